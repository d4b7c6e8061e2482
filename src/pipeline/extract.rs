//! Extraction decision engine: one [`SourceDocument`] → one [`ExtractedDocument`].
//!
//! ## Decision procedure
//!
//! 1. Plain text and Markdown are read verbatim.
//! 2. PDFs are probed page by page with the local text-layer reader. If no
//!    page yields text the document is image-based and goes straight to OCR;
//!    the local Markdown converter is never tried on it.
//! 3. Otherwise the local Markdown converter runs with the `Lines` table
//!    strategy, then the `Text` strategy, then three raw fallbacks (page
//!    text, joined segments, individual characters).
//! 4. The result is scanned for HTML and pipe tables. Tables either fail the
//!    document (`reject_tables`) or send it to OCR (`prefer_ocr_for_tables`).
//! 5. OCR output is reconciled into Markdown by [`crate::pipeline::geometry`].
//! 6. Remaining HTML table fragments become pipe tables.
//! 7. The text is cut to the character budget.
//!
//! A failing strategy is not an error on its own. Its message is kept, and
//! only when every fallback has failed are all messages returned together in
//! [`PolicyCheckError::ExtractionFailure`].

use crate::config::EvaluationConfig;
use crate::error::PolicyCheckError;
use crate::pipeline::geometry::{self, CellFormat};
use crate::pipeline::input::SourceDocument;
use crate::pipeline::normalize::{is_blank, normalize_text};
use crate::pipeline::ocr::OcrPipeline;
use crate::pipeline::pdf::{PdfReadError, PdfTextReader, RawTextMethod, TableStrategy};
use crate::pipeline::tables::{replace_html_tables, scan_tables};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Table handling requested for one extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionPolicy {
    /// Fail if the document contains tables.
    pub reject_tables: bool,
    /// Route table-bearing documents through OCR.
    pub prefer_ocr_for_tables: bool,
}

/// Which path produced the final text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionMethod {
    Verbatim,
    LinesMarkdown,
    TextMarkdown,
    PageText,
    Segments,
    Characters,
    Ocr,
}

impl ExtractionMethod {
    fn from_strategy(strategy: TableStrategy) -> Self {
        match strategy {
            TableStrategy::Lines => ExtractionMethod::LinesMarkdown,
            TableStrategy::Text => ExtractionMethod::TextMarkdown,
        }
    }

    fn from_raw(method: RawTextMethod) -> Self {
        match method {
            RawTextMethod::PageText => ExtractionMethod::PageText,
            RawTextMethod::Segments => ExtractionMethod::Segments,
            RawTextMethod::Characters => ExtractionMethod::Characters,
        }
    }
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ExtractionMethod::Verbatim => "verbatim",
            ExtractionMethod::LinesMarkdown => "lines-markdown",
            ExtractionMethod::TextMarkdown => "text-markdown",
            ExtractionMethod::PageText => "page-text",
            ExtractionMethod::Segments => "segments",
            ExtractionMethod::Characters => "characters",
            ExtractionMethod::Ocr => "ocr",
        })
    }
}

/// Canonical Markdown for one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedDocument {
    pub name: String,
    pub markdown: String,
    pub used_ocr: bool,
    /// The text was cut to the character budget.
    pub truncated: bool,
    /// Length in characters before truncation.
    pub original_chars: usize,
    pub method: ExtractionMethod,
    /// Tables found in the text (local scan or OCR).
    pub tables_found: usize,
    /// Non-fatal problems hit on the way, e.g. failed strategies.
    pub warnings: Vec<String>,
}

/// Chooses and drives the extraction path for each document.
pub struct ExtractionEngine {
    reader: Arc<dyn PdfTextReader>,
    ocr: Option<Arc<OcrPipeline>>,
    max_chars: usize,
    cell_format: CellFormat,
}

impl std::fmt::Debug for ExtractionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionEngine")
            .field("ocr", &self.ocr)
            .field("max_chars", &self.max_chars)
            .field("cell_format", &self.cell_format)
            .finish_non_exhaustive()
    }
}

/// Text produced by one local path, before post-processing.
struct LocalText {
    text: String,
    method: ExtractionMethod,
}

impl ExtractionEngine {
    pub fn new(reader: Arc<dyn PdfTextReader>) -> Self {
        Self {
            reader,
            ocr: None,
            max_chars: crate::config::DEFAULT_MAX_DOCUMENT_CHARS,
            cell_format: CellFormat::default(),
        }
    }

    /// Engine with the budget and cell format from `config`.
    pub fn from_config(
        reader: Arc<dyn PdfTextReader>,
        ocr: Option<Arc<OcrPipeline>>,
        config: &EvaluationConfig,
    ) -> Self {
        Self {
            reader,
            ocr,
            max_chars: config.max_document_chars,
            cell_format: config.cell_format(),
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<OcrPipeline>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    /// Character budget; 0 disables truncation.
    pub fn max_chars(mut self, n: usize) -> Self {
        self.max_chars = n;
        self
    }

    pub fn cell_format(mut self, format: CellFormat) -> Self {
        self.cell_format = format;
        self
    }

    /// Extract one document under `policy`.
    pub async fn extract(
        &self,
        doc: &SourceDocument,
        policy: ExtractionPolicy,
    ) -> Result<ExtractedDocument, PolicyCheckError> {
        info!("Extracting '{}' ({:?})", doc.name(), doc.kind());

        if doc.kind().is_text() {
            let text = doc.text_lossy();
            if is_blank(&text) {
                return Err(PolicyCheckError::ExtractionFailure {
                    document: doc.name().to_string(),
                    attempts: vec!["verbatim: file is empty".to_string()],
                });
            }
            return Ok(self.finish(doc, text, ExtractionMethod::Verbatim, false, 0, Vec::new()));
        }

        let bytes: Arc<[u8]> = Arc::from(doc.bytes());
        let mut attempts: Vec<String> = Vec::new();

        let has_text_layer = match self.blocking(&bytes, |r, b| r.page_texts(b)).await {
            Ok(pages) => {
                let with_text = pages.iter().filter(|p| !is_blank(p)).count();
                debug!("'{}': {}/{} page(s) carry text", doc.name(), with_text, pages.len());
                with_text > 0
            }
            Err(e) => {
                warn!("'{}': text-layer probe failed: {}", doc.name(), e);
                attempts.push(format!("text-layer probe: {}", e));
                true
            }
        };

        if !has_text_layer {
            info!("'{}' has no text layer; treating it as image-based", doc.name());
            return self.extract_with_ocr(doc, policy, attempts).await;
        }

        let local = match self.extract_local(&bytes, &mut attempts).await {
            Some(local) => local,
            None => {
                return Err(PolicyCheckError::ExtractionFailure {
                    document: doc.name().to_string(),
                    attempts,
                })
            }
        };

        let scan = scan_tables(&local.text);
        if scan.any() {
            info!(
                "'{}': found {} HTML and {} pipe table(s)",
                doc.name(),
                scan.html_tables,
                scan.pipe_tables
            );
            if policy.reject_tables {
                return Err(PolicyCheckError::TablesNotAllowed {
                    document: doc.name().to_string(),
                    tables: scan.total(),
                });
            }
            if policy.prefer_ocr_for_tables {
                if self.ocr.is_some() {
                    return self.extract_with_ocr(doc, policy, attempts).await;
                }
                warn!("'{}': OCR preferred for tables but not configured; keeping local text", doc.name());
                attempts.push("ocr: preferred for tables but not configured".to_string());
            }
        }

        let text = normalize_text(&replace_html_tables(&local.text));
        if is_blank(&text) {
            attempts.push(format!("{}: no text after normalisation", local.method));
            return Err(PolicyCheckError::ExtractionFailure {
                document: doc.name().to_string(),
                attempts,
            });
        }
        Ok(self.finish(doc, text, local.method, false, scan.total(), attempts))
    }

    /// Local Markdown strategies, then raw fallbacks. `None` when all fail.
    async fn extract_local(&self, bytes: &Arc<[u8]>, attempts: &mut Vec<String>) -> Option<LocalText> {
        for strategy in [TableStrategy::Lines, TableStrategy::Text] {
            let method = ExtractionMethod::from_strategy(strategy);
            match self.blocking(bytes, move |r, b| r.markdown(b, strategy)).await {
                Ok(text) if !is_blank(&text) => {
                    debug!("{} produced {} bytes", method, text.len());
                    return Some(LocalText { text, method });
                }
                Ok(_) => attempts.push(format!("{}: no text", method)),
                Err(e) => attempts.push(format!("{}: {}", method, e)),
            }
            warn!("{} failed; trying the next strategy", method);
        }

        for raw in RawTextMethod::ALL {
            let method = ExtractionMethod::from_raw(raw);
            match self.blocking(bytes, move |r, b| r.raw_text(b, raw)).await {
                Ok(pages) => {
                    let text = pages
                        .into_iter()
                        .filter(|p| !is_blank(p))
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    if !text.is_empty() {
                        return Some(LocalText { text, method });
                    }
                    attempts.push(format!("{}: no text", method));
                }
                Err(e) => attempts.push(format!("{}: {}", method, e)),
            }
            warn!("{} failed; trying the next fallback", method);
        }
        None
    }

    async fn extract_with_ocr(
        &self,
        doc: &SourceDocument,
        policy: ExtractionPolicy,
        mut attempts: Vec<String>,
    ) -> Result<ExtractedDocument, PolicyCheckError> {
        let Some(ocr) = &self.ocr else {
            return Err(PolicyCheckError::OcrNotConfigured {
                document: doc.name().to_string(),
            });
        };

        let blocks = ocr.recognize(doc).await?;
        let reconciled = geometry::reconcile(&blocks, self.cell_format);
        if blocks.iter().all(|b| is_blank(&b.text)) {
            attempts.push("ocr: no text recognised".to_string());
            return Err(PolicyCheckError::ExtractionFailure {
                document: doc.name().to_string(),
                attempts,
            });
        }
        if policy.reject_tables && reconciled.tables > 0 {
            return Err(PolicyCheckError::TablesNotAllowed {
                document: doc.name().to_string(),
                tables: reconciled.tables,
            });
        }

        let text = replace_html_tables(&reconciled.markdown);
        Ok(self.finish(doc, text, ExtractionMethod::Ocr, true, reconciled.tables, attempts))
    }

    /// Apply the character budget and assemble the result.
    fn finish(
        &self,
        doc: &SourceDocument,
        text: String,
        method: ExtractionMethod,
        used_ocr: bool,
        tables_found: usize,
        warnings: Vec<String>,
    ) -> ExtractedDocument {
        let original_chars = text.chars().count();
        let (markdown, truncated) = truncate_chars(text, self.max_chars);
        if truncated {
            warn!(
                "'{}' truncated from {} to {} characters",
                doc.name(),
                original_chars,
                self.max_chars
            );
        }
        info!(
            "'{}' extracted via {} ({} chars)",
            doc.name(),
            method,
            if truncated { self.max_chars } else { original_chars }
        );
        ExtractedDocument {
            name: doc.name().to_string(),
            markdown,
            used_ocr,
            truncated,
            original_chars,
            method,
            tables_found,
            warnings,
        }
    }

    /// Run a blocking reader call off the async workers.
    async fn blocking<T, F>(&self, bytes: &Arc<[u8]>, call: F) -> Result<T, String>
    where
        F: FnOnce(&dyn PdfTextReader, &[u8]) -> Result<T, PdfReadError> + Send + 'static,
        T: Send + 'static,
    {
        let reader = Arc::clone(&self.reader);
        let bytes = Arc::clone(bytes);
        match tokio::task::spawn_blocking(move || call(reader.as_ref(), &bytes)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(format!("reader task panicked: {}", e)),
        }
    }
}

/// Hard cut to `max_chars` characters; 0 means no limit.
pub fn truncate_chars(text: String, max_chars: usize) -> (String, bool) {
    if max_chars == 0 {
        return (text, false);
    }
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            let mut text = text;
            text.truncate(cut);
            (text, true)
        }
        None => (text, false),
    }
}
