//! Result types returned by the evaluator.

use crate::pipeline::extract::{ExtractedDocument, ExtractionMethod};
use crate::pipeline::verdict::Verdict;
use serde::Serialize;

/// The result of evaluating one submission against a policy.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    /// Submission file name.
    pub submission: String,
    pub verdict: Verdict,
    /// The model's response exactly as received.
    pub raw_response: String,
    pub extraction: ExtractionReport,
    pub stats: EvaluationStats,
}

/// How the submission text was obtained.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionReport {
    pub method: ExtractionMethod,
    pub used_ocr: bool,
    pub truncated: bool,
    /// Characters sent to the model.
    pub chars: usize,
    pub tables_found: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl From<&ExtractedDocument> for ExtractionReport {
    fn from(doc: &ExtractedDocument) -> Self {
        Self {
            method: doc.method,
            used_ocr: doc.used_ocr,
            truncated: doc.truncated,
            chars: doc.markdown.chars().count(),
            tables_found: doc.tables_found,
            warnings: doc.warnings.clone(),
        }
    }
}

/// Sizes and timings for one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationStats {
    /// Characters of policy text in the prompt.
    pub policy_chars: usize,
    /// Prompt length in bytes.
    pub prompt_bytes: usize,
    /// Completion budget sent with the call.
    pub max_tokens: usize,
    pub extended_context: bool,
    /// Time spent extracting the submission.
    pub extraction_ms: u64,
    /// Time spent waiting for the model.
    pub llm_ms: u64,
    pub total_ms: u64,
}
