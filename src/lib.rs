//! # policycheck
//!
//! Check whether submission documents meet a natural-language compliance
//! policy, using a language model as the judge.
//!
//! PDFs, plain text and Markdown are reduced to one canonical Markdown text
//! each. Native-text PDFs are read locally through pdfium; scanned PDFs (and,
//! on request, PDFs with tables) go through an asynchronous OCR job whose
//! line and table-cell blocks are merged back into Markdown. The policy and
//! submission texts are then sent to the model, and its free-text answer is
//! parsed and corrected into a deterministic [`Verdict`].
//!
//! ## Pipeline Overview
//!
//! ```text
//! file
//!  │
//!  ├─ 1. Input     kind from extension, PDF magic check
//!  ├─ 2. Extract   text layer → table-aware Markdown → raw fallbacks, or OCR
//!  ├─ 3. Tables    HTML fragments → pipe tables; optional rejection
//!  ├─ 4. Prompt    policy + submission, structured or legacy protocol
//!  ├─ 5. LLM       token budget from prompt size, retry with backoff
//!  └─ 6. Verdict   JSON extraction, summary correction, GREEN/YELLOW/RED
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use policycheck::{EvaluationConfig, Evaluator, PdfiumReader, SourceDocument};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = EvaluationConfig::default();
//!     let evaluator = Evaluator::from_config(config, Arc::new(PdfiumReader::new()?), None)?;
//!     let policy = [SourceDocument::from_path("policy.pdf")?];
//!     let submission = SourceDocument::from_path("quote.pdf")?;
//!     let eval = evaluator.evaluate(&policy, &submission).await?;
//!     println!("{}: {}", eval.submission, eval.verdict.level);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `policycheck` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! policycheck = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod evaluate;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{EvaluationConfig, EvaluationConfigBuilder, OcrSettings, PromptProtocol};
pub use error::PolicyCheckError;
pub use evaluate::{default_output_path, write_markdown, Evaluator};
pub use output::{Evaluation, EvaluationStats, ExtractionReport};
pub use pipeline::extract::{ExtractedDocument, ExtractionEngine, ExtractionMethod, ExtractionPolicy};
pub use pipeline::input::{DocumentKind, SourceDocument};
pub use pipeline::llm::{ComplianceModel, TokenBudget};
pub use pipeline::ocr::{FsObjectStore, HttpOcrService, ObjectStore, OcrPipeline, OcrService};
pub use pipeline::pdf::{PdfTextReader, PdfiumReader};
pub use pipeline::verdict::{Verdict, VerdictLevel, VerdictSummary};
pub use progress::{EvaluationProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{evaluate_stream, evaluate_text_stream, EvaluationStream, SubmissionError};
