//! Batch evaluation: one policy, many submissions, results as they complete.
//!
//! The policy is extracted once up front. Each submission is then extracted
//! and judged independently, up to `config.concurrency` at a time, and its
//! [`Evaluation`] (or error) is yielded as soon as it is ready. Items arrive
//! in completion order; sort by `submission` if order matters.

use crate::error::PolicyCheckError;
use crate::evaluate::Evaluator;
use crate::output::Evaluation;
use crate::pipeline::input::SourceDocument;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

/// A failed submission: its name and the error.
#[derive(Debug)]
pub struct SubmissionError {
    pub submission: String,
    pub error: PolicyCheckError,
}

impl std::fmt::Display for SubmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.submission, self.error)
    }
}

impl std::error::Error for SubmissionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A boxed stream of per-submission results.
pub type EvaluationStream =
    Pin<Box<dyn Stream<Item = Result<Evaluation, SubmissionError>> + Send>>;

/// Evaluate every submission against the policy documents.
///
/// # Returns
/// - `Ok(EvaluationStream)`: one item per submission
/// - `Err(PolicyCheckError)`: the policy itself could not be extracted
///
/// # Example
/// ```rust,no_run
/// use policycheck::{evaluate_stream, EvaluationConfig, Evaluator, PdfiumReader, SourceDocument};
/// use futures::StreamExt;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = EvaluationConfig::default();
/// let reader = Arc::new(PdfiumReader::new()?);
/// let evaluator = Arc::new(Evaluator::from_config(config, reader, None)?);
/// let policy = vec![SourceDocument::from_path("policy.md")?];
/// let submissions = vec![SourceDocument::from_path("a.pdf")?, SourceDocument::from_path("b.pdf")?];
/// let mut results = evaluate_stream(evaluator, &policy, submissions).await?;
/// while let Some(item) = results.next().await {
///     match item {
///         Ok(eval) => println!("{}: {}", eval.submission, eval.verdict.level),
///         Err(e) => eprintln!("{e}"),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub async fn evaluate_stream(
    evaluator: Arc<Evaluator>,
    policy_docs: &[SourceDocument],
    submissions: Vec<SourceDocument>,
) -> Result<EvaluationStream, PolicyCheckError> {
    let policy_text: Arc<str> = Arc::from(evaluator.extract_policy(policy_docs).await?);
    Ok(evaluate_text_stream(evaluator, policy_text, submissions))
}

/// Like [`evaluate_stream`] with policy text that is already extracted.
pub fn evaluate_text_stream(
    evaluator: Arc<Evaluator>,
    policy_text: Arc<str>,
    submissions: Vec<SourceDocument>,
) -> EvaluationStream {
    let concurrency = evaluator.config().concurrency.max(1);
    info!(
        "Evaluating {} submission(s), {} at a time",
        submissions.len(),
        concurrency
    );

    let s = stream::iter(submissions.into_iter().map(move |doc| {
        let evaluator = Arc::clone(&evaluator);
        let policy_text = Arc::clone(&policy_text);
        async move {
            evaluator
                .evaluate_against(&policy_text, &doc)
                .await
                .map_err(|error| SubmissionError {
                    submission: doc.name().to_string(),
                    error,
                })
        }
    }))
    .buffer_unordered(concurrency);

    Box::pin(s)
}
