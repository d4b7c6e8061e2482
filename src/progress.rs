//! Progress-callback trait for evaluation events.
//!
//! Inject an [`Arc<dyn EvaluationProgressCallback>`] via
//! [`crate::config::EvaluationConfigBuilder::progress_callback`] to receive
//! events as documents are extracted and submissions are judged.
//!
//! # Example
//!
//! ```rust
//! use policycheck::{EvaluationConfig, EvaluationProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     judged: AtomicUsize,
//! }
//!
//! impl EvaluationProgressCallback for CountingCallback {
//!     fn on_submission_complete(&self, name: &str, verdict: &str) {
//!         let n = self.judged.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("#{n} {name}: {verdict}");
//!     }
//! }
//!
//! let config = EvaluationConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { judged: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the evaluator as it works.
///
/// Implementations must be `Send + Sync`: in batch mode submissions are
/// evaluated concurrently and events for different submissions interleave.
/// All methods have default no-op implementations.
pub trait EvaluationProgressCallback: Send + Sync {
    /// A document is about to be extracted.
    fn on_extraction_start(&self, name: &str) {
        let _ = name;
    }

    /// A document was extracted.
    ///
    /// * `chars`: characters of Markdown kept
    /// * `used_ocr`: whether the OCR path produced the text
    fn on_extraction_complete(&self, name: &str, chars: usize, used_ocr: bool) {
        let _ = (name, chars, used_ocr);
    }

    /// The model is about to be called for a submission.
    fn on_model_call(&self, name: &str, max_tokens: usize) {
        let _ = (name, max_tokens);
    }

    /// A submission received its verdict.
    fn on_submission_complete(&self, name: &str, verdict: &str) {
        let _ = (name, verdict);
    }

    /// A submission failed (extraction, model call, or parsing).
    fn on_submission_error(&self, name: &str, error: &str) {
        let _ = (name, error);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl EvaluationProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::EvaluationConfig`].
pub type ProgressCallback = Arc<dyn EvaluationProgressCallback>;
