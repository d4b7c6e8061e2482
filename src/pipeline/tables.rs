//! HTML table fragments → GFM pipe tables, plus table detection.
//!
//! Local converters and some OCR back-ends leave tables in the text as raw
//! `<table>` markup. The LLM reads pipe tables far more reliably than HTML,
//! and pipe tables cost fewer tokens, so every extraction path finishes with
//! [`replace_html_tables`].
//!
//! The formatter never fails: rows shorter than the header are padded with
//! empty cells and longer rows are cut to the header's width.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

static RE_HTML_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<table\b[^>]*>.*?</table\s*>").unwrap());

static RE_PIPE_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*\|.*\|[ \t]*\r?\n[ \t]*\|(?:[ \t]*:?-{3,}:?[ \t]*\|)+[ \t]*$").unwrap()
});

static RE_TEXT_ALIGN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)text-align\s*:\s*(left|center|right)").unwrap());

static TABLE_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("table").unwrap());

/// Column alignment in a pipe table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Alignment {
    #[default]
    Left,
    Center,
    Right,
}

impl Alignment {
    /// The separator-row marker for this alignment.
    pub fn marker(self) -> &'static str {
        match self {
            Alignment::Left => "---",
            Alignment::Center => ":---:",
            Alignment::Right => "---:",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "left" => Some(Alignment::Left),
            "center" | "centre" => Some(Alignment::Center),
            "right" => Some(Alignment::Right),
            _ => None,
        }
    }
}

/// Tables found in a piece of extracted text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableScan {
    pub html_tables: usize,
    pub pipe_tables: usize,
}

impl TableScan {
    pub fn total(&self) -> usize {
        self.html_tables + self.pipe_tables
    }

    pub fn any(&self) -> bool {
        self.total() > 0
    }
}

/// Count HTML `<table>` fragments and GFM pipe tables (header + separator row).
pub fn scan_tables(text: &str) -> TableScan {
    TableScan {
        html_tables: RE_HTML_TABLE.find_iter(text).count(),
        pipe_tables: RE_PIPE_TABLE.find_iter(text).count(),
    }
}

/// Replace every `<table>…</table>` fragment in `text` with a pipe table.
pub fn replace_html_tables(text: &str) -> String {
    RE_HTML_TABLE
        .replace_all(text, |caps: &regex::Captures<'_>| html_table_to_markdown(&caps[0]))
        .into_owned()
}

/// Convert one HTML table fragment into a pipe table bracketed by blank lines.
///
/// The first row is the header. Alignment comes from the header cells'
/// `align` attribute or `text-align` style, defaulting to left. A fragment
/// without any cells converts to an empty string.
pub fn html_table_to_markdown(fragment: &str) -> String {
    let html = Html::parse_fragment(fragment);
    let Some(table) = html.select(&TABLE_SELECTOR).next() else {
        return String::new();
    };

    let rows: Vec<Vec<ElementRef<'_>>> = direct_rows(table)
        .into_iter()
        .map(direct_cells)
        .filter(|cells| !cells.is_empty())
        .collect();

    let Some((header, body)) = rows.split_first() else {
        return String::new();
    };

    let width = header.len();
    let alignments: Vec<Alignment> = header.iter().map(cell_alignment).collect();

    let mut out = String::from("\n\n");
    push_row(&mut out, header.iter().map(cell_text), width);
    push_row(&mut out, alignments.iter().map(|a| a.marker().to_string()), width);
    for row in body {
        push_row(&mut out, row.iter().map(cell_text), width);
    }
    out.push('\n');
    out
}

/// Append one `| a | b |` row, padded or truncated to `width` cells.
fn push_row(out: &mut String, cells: impl Iterator<Item = String>, width: usize) {
    let mut cells: Vec<String> = cells.take(width).collect();
    cells.resize(width, String::new());
    out.push('|');
    for cell in cells {
        out.push(' ');
        out.push_str(&cell);
        out.push_str(" |");
    }
    out.push('\n');
}

/// Rows directly under the table or its `thead`/`tbody`/`tfoot`, not nested tables.
fn direct_rows(table: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let mut rows = Vec::new();
    for child in table.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "tr" => rows.push(child),
            "thead" | "tbody" | "tfoot" => rows.extend(
                child
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|e| e.value().name() == "tr"),
            ),
            _ => {}
        }
    }
    rows
}

fn direct_cells(row: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|e| matches!(e.value().name(), "td" | "th"))
        .collect()
}

fn cell_alignment(cell: &ElementRef<'_>) -> Alignment {
    let element = cell.value();
    if let Some(align) = element.attr("align").and_then(Alignment::parse) {
        return align;
    }
    element
        .attr("style")
        .and_then(|style| RE_TEXT_ALIGN.captures(style))
        .and_then(|caps| Alignment::parse(&caps[1]))
        .unwrap_or_default()
}

/// Cell text on one line with pipes escaped.
fn cell_text(cell: &ElementRef<'_>) -> String {
    let raw: String = cell.text().collect();
    escape_cell(&raw.replace("\r\n", " ").replace(['\n', '\r'], " "))
}

/// Trim and escape `|` so the text is safe inside a pipe-table cell.
pub fn escape_cell(text: &str) -> String {
    text.trim().replace('|', "\\|")
}
