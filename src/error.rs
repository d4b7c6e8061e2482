//! Error types for the policycheck library.
//!
//! Every fatal condition is a variant of [`PolicyCheckError`], grouped by the
//! stage that raises it:
//!
//! * **Input**: the file is missing, unreadable, or of a kind we cannot read.
//! * **Extraction**: every fallback was tried and none produced text, or the
//!   document violates the configured table policy.
//! * **OCR**: the external job failed, timed out, or no OCR service is wired in.
//! * **Services**: transport/auth failures from the OCR, storage or LLM
//!   collaborators, after their own retries.
//! * **Model output**: the response carried neither a parsable JSON verdict
//!   nor a legacy status word.
//!
//! Recoverable conditions (one extraction strategy failing, an empty page)
//! never become errors on their own; they are recorded in the `attempts`
//! list of [`PolicyCheckError::ExtractionFailure`] only once everything
//! else has failed too. Inconsistent model summaries are not errors at all;
//! they are corrected by [`crate::pipeline::verdict`].

use std::path::PathBuf;
use thiserror::Error;

/// Upper bound on the diagnostic excerpt attached to model-output errors.
pub const EXCERPT_CHARS: usize = 500;

/// All fatal errors returned by the policycheck library.
#[derive(Debug, Error)]
pub enum PolicyCheckError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("File not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The document is not a PDF, plain-text or Markdown file.
    #[error("Unsupported file '{document}': {reason}\nAccepted types: .pdf, .txt, .md")]
    InvalidFileType { document: String, reason: String },

    // ── Extraction errors ─────────────────────────────────────────────────
    /// Every extraction path was tried and none produced usable text.
    #[error(
        "Could not extract text from '{document}' ({} attempt(s) failed):\n  {}",
        .attempts.len(),
        .attempts.join("\n  ")
    )]
    ExtractionFailure {
        document: String,
        attempts: Vec<String>,
    },

    /// The document contains tables and the caller asked for table-free input.
    #[error("'{document}' contains {tables} table(s); tables are not accepted for this document")]
    TablesNotAllowed { document: String, tables: usize },

    // ── OCR errors ────────────────────────────────────────────────────────
    /// The OCR job reached the FAILED state.
    #[error("OCR job {job_id} failed: {message}")]
    OcrJobFailure { job_id: String, message: String },

    /// The OCR job did not finish before the configured deadline.
    #[error("OCR job {job_id} did not finish within {secs}s")]
    OcrTimeout { job_id: String, secs: u64 },

    /// The document needs OCR but no OCR service was configured.
    #[error("'{document}' has no text layer and needs OCR, but no OCR service is configured")]
    OcrNotConfigured { document: String },

    // ── Collaborator errors ───────────────────────────────────────────────
    /// The LLM provider could not be created (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Transport or authentication failure from an external service.
    #[error("{service} service error: {detail}")]
    ServiceError { service: String, detail: String },

    // ── Model output errors ───────────────────────────────────────────────
    /// The model response could not be turned into a verdict.
    #[error("Malformed model response: {reason}\nResponse excerpt:\n{excerpt}")]
    MalformedModelResponse { reason: String, excerpt: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PolicyCheckError {
    /// Shorthand for a [`PolicyCheckError::ServiceError`].
    pub fn service(service: impl Into<String>, detail: impl ToString) -> Self {
        Self::ServiceError {
            service: service.into(),
            detail: detail.to_string(),
        }
    }

    /// Build a [`PolicyCheckError::MalformedModelResponse`] with a capped excerpt.
    pub fn malformed(reason: impl Into<String>, response: &str) -> Self {
        Self::MalformedModelResponse {
            reason: reason.into(),
            excerpt: excerpt(response),
        }
    }
}

/// First [`EXCERPT_CHARS`] characters of `text`, with an ellipsis when cut.
pub fn excerpt(text: &str) -> String {
    match text.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
