//! Local PDF text-layer reading via pdfium.
//!
//! [`PdfTextReader`] is the seam the extraction engine talks to. It offers
//! three levels of ambition:
//!
//! * [`PdfTextReader::page_texts`]: plain text per page, used to decide
//!   whether the document has a text layer at all.
//! * [`PdfTextReader::markdown`]: text laid out into rows from segment
//!   positions, with aligned multi-column regions emitted as HTML tables
//!   ([`TableStrategy::Lines`]) or as plain rows ([`TableStrategy::Text`]).
//! * [`PdfTextReader::raw_text`]: successively simpler raw extractions used
//!   as last resorts.
//!
//! All methods are blocking. Callers on the async runtime wrap them in
//! `spawn_blocking`, since pdfium is CPU-bound and not async-aware.

use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Environment variable naming the pdfium shared library or its directory.
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

/// Vertical distance (points) within which segments share a row.
const ROW_TOLERANCE: f32 = 3.0;

/// Horizontal distance (points) within which cells share a column.
const COL_TOLERANCE: f32 = 10.0;

/// Minimum consecutive multi-cell rows that make a table.
const MIN_TABLE_ROWS: usize = 2;

static RE_NUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[-+(]?[$€£]?\d[\d,.\s]*%?\)?$").unwrap());

/// A recoverable failure of one reader call.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PdfReadError(pub String);

impl PdfReadError {
    fn pdfium(context: &str, e: PdfiumError) -> Self {
        Self(format!("{}: {:?}", context, e))
    }
}

/// How the Markdown conversion treats column-aligned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStrategy {
    /// Detect aligned rows and emit them as HTML tables.
    Lines,
    /// Emit every row as a plain line.
    Text,
}

/// Raw fallbacks, from most to least structured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTextMethod {
    PageText,
    Segments,
    Characters,
}

impl RawTextMethod {
    pub const ALL: [RawTextMethod; 3] = [
        RawTextMethod::PageText,
        RawTextMethod::Segments,
        RawTextMethod::Characters,
    ];
}

/// Local text-layer access to a PDF held in memory.
pub trait PdfTextReader: Send + Sync {
    /// Plain text of every page, in page order.
    fn page_texts(&self, bytes: &[u8]) -> Result<Vec<String>, PdfReadError>;

    /// Whole-document Markdown using the given table strategy.
    fn markdown(&self, bytes: &[u8], strategy: TableStrategy) -> Result<String, PdfReadError>;

    /// Per-page text using one of the raw fallbacks.
    fn raw_text(&self, bytes: &[u8], method: RawTextMethod) -> Result<Vec<String>, PdfReadError>;
}

// ── pdfium implementation ────────────────────────────────────────────────────

/// [`PdfTextReader`] backed by a dynamically bound pdfium library.
///
/// Only the library location is kept; every call binds its own [`Pdfium`]
/// on the calling (blocking) thread, so the reader itself is `Send + Sync`.
#[derive(Debug, Clone)]
pub struct PdfiumReader {
    /// `None` means the system library search path.
    library: Option<PathBuf>,
}

impl PdfiumReader {
    /// Locate pdfium from `PDFIUM_LIB_PATH` (a file or a directory), falling
    /// back to the system library search path, and check that it binds.
    pub fn new() -> Result<Self, PdfReadError> {
        let library = match std::env::var(PDFIUM_LIB_PATH_ENV) {
            Ok(path) if Path::new(&path).is_file() => Some(PathBuf::from(path)),
            Ok(dir) => Some(Pdfium::pdfium_platform_library_name_at_path(&dir)).filter(|p| p.is_file()),
            Err(_) => None,
        };
        let reader = Self { library };
        reader.bind()?;
        debug!("pdfium located at {:?}", reader.library);
        Ok(reader)
    }

    fn bind(&self) -> Result<Pdfium, PdfReadError> {
        let bindings = match self.library {
            Some(ref path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| PdfReadError::pdfium("failed to bind pdfium", e))?;
        Ok(Pdfium::new(bindings))
    }

    /// Positioned, non-empty text segments of every page.
    fn page_segments(&self, bytes: &[u8]) -> Result<Vec<Vec<PositionedText>>, PdfReadError> {
        let pdfium = self.bind()?;
        let document = load(&pdfium, bytes)?;
        let mut pages = Vec::new();
        for (idx, page) in document.pages().iter().enumerate() {
            let page_height = page.height().value;
            let text = page
                .text()
                .map_err(|e| PdfReadError::pdfium(&format!("page {}", idx + 1), e))?;
            let mut cells = Vec::new();
            for segment in text.segments().iter() {
                let content = segment.text();
                let content = content.trim();
                if content.is_empty() {
                    continue;
                }
                let bounds = segment.bounds();
                cells.push(PositionedText {
                    text: content.to_string(),
                    x: bounds.left().value,
                    y: page_height - bounds.top().value,
                    height: bounds.top().value - bounds.bottom().value,
                });
            }
            pages.push(cells);
        }
        Ok(pages)
    }
}

fn load<'a>(pdfium: &'a Pdfium, bytes: &'a [u8]) -> Result<PdfDocument<'a>, PdfReadError> {
    pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| PdfReadError::pdfium("failed to open PDF", e))
}

impl PdfTextReader for PdfiumReader {
    fn page_texts(&self, bytes: &[u8]) -> Result<Vec<String>, PdfReadError> {
        let pdfium = self.bind()?;
        let document = load(&pdfium, bytes)?;
        let mut pages = Vec::new();
        for (idx, page) in document.pages().iter().enumerate() {
            let text = page
                .text()
                .map_err(|e| PdfReadError::pdfium(&format!("page {}", idx + 1), e))?;
            pages.push(text.all());
        }
        debug!("pdfium read {} page(s)", pages.len());
        Ok(pages)
    }

    fn markdown(&self, bytes: &[u8], strategy: TableStrategy) -> Result<String, PdfReadError> {
        let pages = self.page_segments(bytes)?;
        let rendered: Vec<String> = pages
            .into_iter()
            .map(|cells| layout_page(cells, strategy))
            .filter(|p| !p.trim().is_empty())
            .collect();
        Ok(rendered.join("\n\n"))
    }

    fn raw_text(&self, bytes: &[u8], method: RawTextMethod) -> Result<Vec<String>, PdfReadError> {
        match method {
            RawTextMethod::PageText => self.page_texts(bytes),
            RawTextMethod::Segments => Ok(self
                .page_segments(bytes)?
                .into_iter()
                .map(|cells| {
                    cells
                        .into_iter()
                        .map(|c| c.text)
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .collect()),
            RawTextMethod::Characters => {
                let pdfium = self.bind()?;
                let document = load(&pdfium, bytes)?;
                let mut pages: Vec<String> = Vec::new();
                for (idx, page) in document.pages().iter().enumerate() {
                    let text = page
                        .text()
                        .map_err(|e| PdfReadError::pdfium(&format!("page {}", idx + 1), e))?;
                    pages.push(text.chars().iter().filter_map(|c| c.unicode_char()).collect());
                }
                Ok(pages)
            }
        }
    }
}

// ── Layout ───────────────────────────────────────────────────────────────────

/// A text segment with a top-left-origin position in points.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedText {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub height: f32,
}

impl PositionedText {
    fn center_y(&self) -> f32 {
        self.y + self.height / 2.0
    }
}

/// Lay out one page's segments into text, top to bottom.
///
/// With [`TableStrategy::Lines`], runs of at least two consecutive rows that
/// have the same number (≥ 2) of cells, each starting within
/// `COL_TOLERANCE` of the run's first row, become an HTML table; all-numeric
/// columns are marked right-aligned.
pub fn layout_page(cells: Vec<PositionedText>, strategy: TableStrategy) -> String {
    let rows = cluster_rows(cells);
    let mut out: Vec<String> = Vec::new();

    let mut i = 0;
    while i < rows.len() {
        let width = rows[i].len();
        let mut end = i + 1;
        if strategy == TableStrategy::Lines && width >= 2 {
            while end < rows.len() && columns_align(&rows[i], &rows[end]) {
                end += 1;
            }
        }
        if end - i >= MIN_TABLE_ROWS {
            out.push(html_table(&rows[i..end]));
        } else {
            for row in &rows[i..end] {
                out.push(
                    row.iter()
                        .map(|c| c.text.as_str())
                        .collect::<Vec<_>>()
                        .join(" "),
                );
            }
        }
        i = end;
    }
    out.join("\n")
}

fn cluster_rows(mut cells: Vec<PositionedText>) -> Vec<Vec<PositionedText>> {
    cells.sort_by(|a, b| {
        a.center_y()
            .total_cmp(&b.center_y())
            .then(a.x.total_cmp(&b.x))
    });

    let mut rows: Vec<Vec<PositionedText>> = Vec::new();
    for cell in cells {
        match rows.last_mut() {
            Some(row)
                if row
                    .first()
                    .is_some_and(|f| (cell.center_y() - f.center_y()).abs() <= ROW_TOLERANCE) =>
            {
                row.push(cell)
            }
            _ => rows.push(vec![cell]),
        }
    }
    for row in &mut rows {
        row.sort_by(|a, b| a.x.total_cmp(&b.x));
    }
    rows
}

/// Same cell count, and every cell starts in the same column as its
/// counterpart in `first`.
fn columns_align(first: &[PositionedText], row: &[PositionedText]) -> bool {
    first.len() == row.len()
        && first
            .iter()
            .zip(row)
            .all(|(a, b)| (a.x - b.x).abs() <= COL_TOLERANCE)
}

fn html_table(rows: &[Vec<PositionedText>]) -> String {
    let width = rows.first().map_or(0, Vec::len);
    let numeric: Vec<bool> = (0..width)
        .map(|col| {
            rows.iter()
                .skip(1)
                .all(|r| r.get(col).is_some_and(|c| RE_NUMERIC.is_match(&c.text)))
        })
        .collect();

    let mut html = String::from("<table>\n");
    for (r, row) in rows.iter().enumerate() {
        html.push_str("<tr>");
        let tag = if r == 0 { "th" } else { "td" };
        for (col, cell) in row.iter().enumerate() {
            if r == 0 && numeric.get(col).copied().unwrap_or(false) {
                html.push_str(&format!("<{tag} align=\"right\">"));
            } else {
                html.push_str(&format!("<{tag}>"));
            }
            html.push_str(&escape_html(&cell.text));
            html.push_str(&format!("</{tag}>"));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</table>");
    html
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
