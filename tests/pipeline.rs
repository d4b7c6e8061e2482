//! Offline tests for extraction and evaluation.
//!
//! Every external collaborator (pdfium, OCR service, staging store, LLM) is
//! replaced by an in-process fake, so these tests need no network, no API
//! key and no pdfium library.

use async_trait::async_trait;
use futures::StreamExt;
use policycheck::pipeline::geometry::{self, BoundingBox, CellAddress, CellFormat, TextBlock};
use policycheck::pipeline::ocr::{JobStatus, ObjectStore, OcrPage, OcrPipeline, OcrService, StoreError};
use policycheck::pipeline::pdf::{PdfReadError, PdfTextReader, RawTextMethod, TableStrategy};
use policycheck::pipeline::tables::html_table_to_markdown;
use policycheck::pipeline::verdict;
use policycheck::{
    evaluate_stream, ComplianceModel, EvaluationConfig, EvaluationProgressCallback, Evaluator,
    ExtractionEngine, ExtractionMethod, ExtractionPolicy, PolicyCheckError, PromptProtocol,
    SourceDocument, TokenBudget, VerdictLevel,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Scripted PDF reader. Each method returns its configured result and counts calls.
#[derive(Default)]
struct FakeReader {
    pages: Vec<String>,
    lines_markdown: Option<String>,
    text_markdown: Option<String>,
    raw: HashMap<&'static str, Vec<String>>,
    markdown_calls: AtomicUsize,
}

impl FakeReader {
    fn with_pages(pages: &[&str]) -> Self {
        Self {
            pages: pages.iter().map(|p| p.to_string()).collect(),
            ..Self::default()
        }
    }

    fn lines(mut self, text: &str) -> Self {
        self.lines_markdown = Some(text.to_string());
        self
    }

    fn raw(mut self, method: RawTextMethod, pages: &[&str]) -> Self {
        self.raw
            .insert(raw_key(method), pages.iter().map(|p| p.to_string()).collect());
        self
    }
}

fn raw_key(method: RawTextMethod) -> &'static str {
    match method {
        RawTextMethod::PageText => "page-text",
        RawTextMethod::Segments => "segments",
        RawTextMethod::Characters => "characters",
    }
}

impl PdfTextReader for FakeReader {
    fn page_texts(&self, _bytes: &[u8]) -> Result<Vec<String>, PdfReadError> {
        Ok(self.pages.clone())
    }

    fn markdown(&self, _bytes: &[u8], strategy: TableStrategy) -> Result<String, PdfReadError> {
        self.markdown_calls.fetch_add(1, Ordering::SeqCst);
        let result = match strategy {
            TableStrategy::Lines => &self.lines_markdown,
            TableStrategy::Text => &self.text_markdown,
        };
        result
            .clone()
            .ok_or_else(|| PdfReadError(format!("{strategy:?} strategy failed")))
    }

    fn raw_text(&self, _bytes: &[u8], method: RawTextMethod) -> Result<Vec<String>, PdfReadError> {
        self.raw
            .get(raw_key(method))
            .cloned()
            .ok_or_else(|| PdfReadError(format!("{} failed", raw_key(method))))
    }
}

#[derive(Default)]
struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create_bucket(&self, _bucket: &str) -> Result<(), StoreError> {
        Err(StoreError::AlreadyExists)
    }

    async fn upload(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StoreError> {
        let bytes = std::fs::read(source).map_err(|e| StoreError::Other(e.to_string()))?;
        self.objects
            .lock()
            .unwrap()
            .insert(format!("{bucket}/{key}"), bytes);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.objects.lock().unwrap().remove(&format!("{bucket}/{key}"));
        Ok(())
    }
}

/// OCR service that finishes on the second poll with a fixed block list.
struct ScriptedOcr {
    blocks: Vec<TextBlock>,
    fail_with: Option<String>,
    polls: AtomicUsize,
}

impl ScriptedOcr {
    fn succeeding(blocks: Vec<TextBlock>) -> Self {
        Self {
            blocks,
            fail_with: None,
            polls: AtomicUsize::new(0),
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            blocks: Vec::new(),
            fail_with: Some(message.to_string()),
            polls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OcrService for ScriptedOcr {
    async fn submit(&self, _bucket: &str, _key: &str) -> Result<String, PolicyCheckError> {
        Ok("job-1".to_string())
    }

    async fn poll(&self, _job_id: &str, _next: Option<&str>) -> Result<OcrPage, PolicyCheckError> {
        if self.polls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(OcrPage {
                status: JobStatus::Running,
                blocks: Vec::new(),
                next_page_token: None,
                status_message: None,
            });
        }
        Ok(match &self.fail_with {
            Some(message) => OcrPage {
                status: JobStatus::Failed,
                blocks: Vec::new(),
                next_page_token: None,
                status_message: Some(message.clone()),
            },
            None => OcrPage {
                status: JobStatus::Succeeded,
                blocks: self.blocks.clone(),
                next_page_token: None,
                status_message: None,
            },
        })
    }
}

fn ocr_pipeline(store: Arc<MemoryStore>, service: ScriptedOcr) -> Arc<OcrPipeline> {
    Arc::new(OcrPipeline::new(
        store,
        Arc::new(service),
        "staging",
        Duration::from_millis(1),
        Duration::from_secs(5),
    ))
}

/// Model that answers with a function of the prompt and records each call.
struct ScriptedModel<F> {
    answer: F,
    prompts: Mutex<Vec<String>>,
    budgets: Mutex<Vec<TokenBudget>>,
}

impl<F> ScriptedModel<F>
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn new(answer: F) -> Arc<Self> {
        Arc::new(Self {
            answer,
            prompts: Mutex::new(Vec::new()),
            budgets: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl<F> ComplianceModel for ScriptedModel<F>
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, prompt: &str, budget: &TokenBudget) -> Result<String, PolicyCheckError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.budgets.lock().unwrap().push(*budget);
        Ok((self.answer)(prompt))
    }
}

/// Route library logs to the test harness; `RUST_LOG=debug` shows them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pdf(name: &str) -> SourceDocument {
    SourceDocument::from_bytes(name, b"%PDF-1.7\n% fake".to_vec()).unwrap()
}

fn text(name: &str, body: &str) -> SourceDocument {
    SourceDocument::from_bytes(name, body.as_bytes().to_vec()).unwrap()
}

fn bb(top: f64, left: f64, width: f64, height: f64) -> BoundingBox {
    BoundingBox::new(top, left, width, height)
}

fn scanned_blocks() -> Vec<TextBlock> {
    let addr = |row, column| CellAddress { table: 0, row, column };
    vec![
        TextBlock::line(1, "Quotation 42", bb(0.05, 0.1, 0.3, 0.02)),
        TextBlock::line(1, "Item", bb(0.5, 0.1, 0.1, 0.02)),
        TextBlock::cell(1, "Item", bb(0.5, 0.1, 0.3, 0.05), addr(0, 0)),
        TextBlock::cell(1, "Price", bb(0.5, 0.4, 0.3, 0.05), addr(0, 1)),
        TextBlock::cell(1, "Chair", bb(0.55, 0.1, 0.3, 0.05), addr(1, 0)),
        TextBlock::cell(1, "12.00", bb(0.55, 0.4, 0.3, 0.05), addr(1, 1)),
    ]
}

// ── Extraction ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn image_based_pdf_goes_straight_to_ocr() {
    init_tracing();
    let reader = Arc::new(FakeReader::with_pages(&["", "   \n"]).lines("should not be used"));
    let store = Arc::new(MemoryStore::default());
    let engine = ExtractionEngine::new(reader.clone())
        .with_ocr(ocr_pipeline(store.clone(), ScriptedOcr::succeeding(scanned_blocks())));

    let doc = engine
        .extract(&pdf("scan.pdf"), ExtractionPolicy::default())
        .await
        .unwrap();

    assert_eq!(reader.markdown_calls.load(Ordering::SeqCst), 0);
    assert!(doc.used_ocr);
    assert_eq!(doc.method, ExtractionMethod::Ocr);
    assert!(doc.markdown.starts_with("# Document Content\n\n"));
    assert!(doc.markdown.contains("| Chair | 12.00 |"));
    assert_eq!(doc.markdown.matches("Item").count(), 1, "{}", doc.markdown);
    assert!(store.objects.lock().unwrap().is_empty(), "staged object must be deleted");
}

#[tokio::test]
async fn image_based_pdf_without_ocr_fails() {
    let engine = ExtractionEngine::new(Arc::new(FakeReader::with_pages(&[""])));
    let err = engine
        .extract(&pdf("scan.pdf"), ExtractionPolicy::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyCheckError::OcrNotConfigured { ref document } if document == "scan.pdf"));
}

#[tokio::test]
async fn failed_ocr_job_reports_message_and_cleans_up() {
    let store = Arc::new(MemoryStore::default());
    let engine = ExtractionEngine::new(Arc::new(FakeReader::with_pages(&[""])))
        .with_ocr(ocr_pipeline(store.clone(), ScriptedOcr::failing("unsupported page size")));

    let err = engine
        .extract(&pdf("scan.pdf"), ExtractionPolicy::default())
        .await
        .unwrap_err();
    match err {
        PolicyCheckError::OcrJobFailure { job_id, message } => {
            assert_eq!(job_id, "job-1");
            assert_eq!(message, "unsupported page size");
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(store.objects.lock().unwrap().is_empty());
}

#[tokio::test]
async fn falls_back_through_strategies_to_raw_segments() {
    let reader = FakeReader::with_pages(&["Clause 1"]).raw(RawTextMethod::Segments, &["Clause 1", "", "Clause 2"]);
    let engine = ExtractionEngine::new(Arc::new(reader));

    let doc = engine
        .extract(&pdf("policy.pdf"), ExtractionPolicy::default())
        .await
        .unwrap();

    assert_eq!(doc.method, ExtractionMethod::Segments);
    assert_eq!(doc.markdown, "Clause 1\n\nClause 2\n");
    assert_eq!(doc.warnings.len(), 3, "lines, text and page-text failed: {:?}", doc.warnings);
}

#[tokio::test]
async fn every_fallback_failing_lists_all_attempts() {
    let engine = ExtractionEngine::new(Arc::new(FakeReader::with_pages(&["has text"])));
    let err = engine
        .extract(&pdf("broken.pdf"), ExtractionPolicy::default())
        .await
        .unwrap_err();
    match err {
        PolicyCheckError::ExtractionFailure { document, attempts } => {
            assert_eq!(document, "broken.pdf");
            assert_eq!(attempts.len(), 5, "{attempts:?}");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn invisible_only_text_layer_counts_as_no_text() {
    let reader = Arc::new(FakeReader::with_pages(&["\u{200B}\u{FEFF}"]).lines("\u{200B}\u{FEFF}"));
    let engine = ExtractionEngine::new(reader.clone());
    let err = engine
        .extract(&pdf("blank.pdf"), ExtractionPolicy::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyCheckError::OcrNotConfigured { .. }), "{err:?}");
    assert_eq!(reader.markdown_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invisible_only_strategy_output_falls_through() {
    let reader = FakeReader::with_pages(&["Clause 1"])
        .lines("\u{200B}\u{FEFF}\n\n")
        .raw(RawTextMethod::PageText, &["\u{FEFF}", "Clause 1"]);
    let engine = ExtractionEngine::new(Arc::new(reader));

    let doc = engine
        .extract(&pdf("policy.pdf"), ExtractionPolicy::default())
        .await
        .unwrap();

    assert_eq!(doc.method, ExtractionMethod::PageText);
    assert_eq!(doc.markdown, "Clause 1\n");
    assert!(doc.warnings[0].contains("lines-markdown: no text"), "{:?}", doc.warnings);
}

const TABLE_TEXT: &str = "Prices\n\n<table><tr><th>Item</th><th align=\"right\">Cost</th></tr><tr><td>Desk</td><td>90</td></tr></table>\n";

#[tokio::test]
async fn reject_tables_names_the_document() {
    let engine = ExtractionEngine::new(Arc::new(FakeReader::with_pages(&["Prices"]).lines(TABLE_TEXT)));
    let policy = ExtractionPolicy {
        reject_tables: true,
        prefer_ocr_for_tables: false,
    };
    let err = engine.extract(&pdf("quote.pdf"), policy).await.unwrap_err();
    assert!(matches!(err, PolicyCheckError::TablesNotAllowed { ref document, tables: 1 } if document == "quote.pdf"));
}

#[tokio::test]
async fn local_tables_become_pipe_tables() {
    let engine = ExtractionEngine::new(Arc::new(FakeReader::with_pages(&["Prices"]).lines(TABLE_TEXT)));
    let doc = engine
        .extract(&pdf("quote.pdf"), ExtractionPolicy::default())
        .await
        .unwrap();
    assert_eq!(doc.method, ExtractionMethod::LinesMarkdown);
    assert_eq!(doc.tables_found, 1);
    assert!(doc.markdown.contains("| Item | Cost |\n| --- | ---: |\n| Desk | 90 |"));
    assert!(!doc.markdown.contains("<table"));
}

#[tokio::test]
async fn prefer_ocr_routes_table_documents_to_ocr() {
    let reader = Arc::new(FakeReader::with_pages(&["Prices"]).lines(TABLE_TEXT));
    let store = Arc::new(MemoryStore::default());
    let engine = ExtractionEngine::new(reader.clone())
        .with_ocr(ocr_pipeline(store, ScriptedOcr::succeeding(scanned_blocks())));
    let policy = ExtractionPolicy {
        reject_tables: false,
        prefer_ocr_for_tables: true,
    };

    let doc = engine.extract(&pdf("quote.pdf"), policy).await.unwrap();
    assert!(doc.used_ocr);
    assert_eq!(reader.markdown_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn prefer_ocr_without_ocr_keeps_local_text() {
    let engine = ExtractionEngine::new(Arc::new(FakeReader::with_pages(&["Prices"]).lines(TABLE_TEXT)));
    let policy = ExtractionPolicy {
        reject_tables: false,
        prefer_ocr_for_tables: true,
    };
    let doc = engine.extract(&pdf("quote.pdf"), policy).await.unwrap();
    assert!(!doc.used_ocr);
    assert!(doc.warnings.iter().any(|w| w.contains("not configured")));
}

#[tokio::test]
async fn text_documents_are_verbatim_and_truncated() {
    let engine = ExtractionEngine::new(Arc::new(FakeReader::default())).max_chars(10);
    let doc = engine
        .extract(&text("notes.md", "<table><tr><td>ünïcode</td></tr></table>"), ExtractionPolicy::default())
        .await
        .unwrap();
    assert_eq!(doc.method, ExtractionMethod::Verbatim);
    assert!(doc.truncated);
    assert_eq!(doc.markdown.chars().count(), 10);
    assert_eq!(doc.markdown, "<table><tr");
}

#[test]
fn existing_staging_bucket_is_not_an_error() {
    let store = MemoryStore::default();
    tokio_test::block_on(policycheck::pipeline::ocr::ensure_bucket(&store, "staging")).unwrap();
}

// ── Evaluation ───────────────────────────────────────────────────────────────

const INCONSISTENT: &str = r#"Here is my assessment.
```json
{
  "requirements": [
    {"requirement": "Delivery within 30 days", "pass": true},
    {"requirement": "Warranty of 2 years", "pass": true, "pass_status": "PARTIAL", "notes": "1 year stated"},
    {"requirement": "Price below 1000", "pass": false, "notes": "1200 quoted"}
  ],
  "summary": {"totalChecks": 2, "passed": 2, "partial": 0, "failed": 0, "statement": "Mostly fine."}
}
```"#;

fn evaluator_with<F>(model: Arc<ScriptedModel<F>>, config: EvaluationConfig) -> Evaluator
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    let engine = ExtractionEngine::from_config(Arc::new(FakeReader::default()), None, &config);
    Evaluator::new(engine, model, config)
}

#[tokio::test]
async fn evaluation_corrects_the_reported_summary() {
    init_tracing();
    let model = ScriptedModel::new(|_: &str| INCONSISTENT.to_string());
    let evaluator = evaluator_with(model.clone(), EvaluationConfig::default());
    let policy = [text("a.md", "Rule A"), text("b.txt", "Rule B")];

    let eval = evaluator
        .evaluate(&policy, &text("quote.txt", "Our quote"))
        .await
        .unwrap();

    assert_eq!(eval.verdict.level, VerdictLevel::Red);
    let summary = eval.verdict.summary.unwrap();
    assert_eq!(
        (summary.total, summary.passed, summary.partial, summary.failed),
        (3, 1, 1, 1)
    );
    assert!(!summary.consistent);
    assert_eq!(eval.verdict.statement.as_deref(), Some("Mostly fine."));
    assert_eq!(eval.raw_response, INCONSISTENT);
    assert_eq!(eval.stats.policy_chars, "Rule A\nRule B\n".chars().count());

    let prompts = model.prompts.lock().unwrap();
    assert!(prompts[0].contains("Policy Document:\nRule A\nRule B"));
    assert!(prompts[0].contains("Submission Document:\nOur quote"));
    assert_eq!(model.budgets.lock().unwrap()[0].max_tokens, 5_000);
}

#[tokio::test]
async fn fixed_max_tokens_reaches_the_model() {
    let model = ScriptedModel::new(|_: &str| {
        r#"{"requirements":[{"requirement":"r","pass":true}],"summary":{}}"#.to_string()
    });
    let config = EvaluationConfig::builder().max_tokens(1234).build().unwrap();
    let evaluator = evaluator_with(model.clone(), config);
    evaluator
        .evaluate(&[text("p.md", "Rule")], &text("s.md", "Doc"))
        .await
        .unwrap();
    assert_eq!(model.budgets.lock().unwrap()[0].max_tokens, 1234);
}

#[tokio::test]
async fn legacy_protocol_yields_four_levels() {
    let model = ScriptedModel::new(|_: &str| "ORANGE: clause 3 needs clarification".to_string());
    let config = EvaluationConfig::builder()
        .protocol(PromptProtocol::Legacy)
        .build()
        .unwrap();
    let evaluator = evaluator_with(model.clone(), config);

    let eval = evaluator
        .evaluate(&[text("p.md", "Rule")], &text("s.md", "Doc"))
        .await
        .unwrap();
    assert_eq!(eval.verdict.level, VerdictLevel::Orange);
    assert_eq!(eval.verdict.explanation, "clause 3 needs clarification");
    assert!(model.prompts.lock().unwrap()[0].contains("exactly one word"));
}

#[tokio::test]
async fn truncated_structured_response_never_grades_by_keyword() {
    let model = ScriptedModel::new(|_: &str| {
        "```json\n{\"requirements\": [{\"requirement\": \"Use GREEN certified packaging\", \"pass\": false}, {\"requirement\": \"Insurance\", \"pa".to_string()
    });
    let evaluator = evaluator_with(model, EvaluationConfig::default());
    let err = evaluator
        .evaluate(&[text("p.md", "Rule")], &text("s.md", "Doc"))
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyCheckError::MalformedModelResponse { .. }), "{err:?}");
}

#[derive(Default)]
struct ErrorRecorder {
    errors: Mutex<Vec<String>>,
    verdicts: Mutex<Vec<String>>,
}

impl EvaluationProgressCallback for ErrorRecorder {
    fn on_submission_complete(&self, name: &str, verdict: &str) {
        self.verdicts.lock().unwrap().push(format!("{name}={verdict}"));
    }

    fn on_submission_error(&self, name: &str, _error: &str) {
        self.errors.lock().unwrap().push(name.to_string());
    }
}

#[tokio::test]
async fn malformed_response_is_an_error_and_reported() {
    let model = ScriptedModel::new(|_: &str| "I cannot decide.".to_string());
    let recorder = Arc::new(ErrorRecorder::default());
    let config = EvaluationConfig::builder()
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let evaluator = evaluator_with(model, config);

    let err = evaluator
        .evaluate(&[text("p.md", "Rule")], &text("s.md", "Doc"))
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyCheckError::MalformedModelResponse { .. }));
    assert_eq!(*recorder.errors.lock().unwrap(), vec!["s.md".to_string()]);
}

#[tokio::test]
async fn batch_evaluates_each_submission_independently() {
    let model = ScriptedModel::new(|prompt: &str| {
        if prompt.contains("broken submission") {
            "no verdict at all".to_string()
        } else if prompt.contains("partial submission") {
            r#"{"requirements":[{"requirement":"r","pass":true,"pass_status":"partial"}],"summary":{"totalChecks":1,"passed":0,"partial":1,"failed":0}}"#.to_string()
        } else {
            r#"{"requirements":[{"requirement":"r","pass":true}],"summary":{"totalChecks":1,"passed":1,"partial":0,"failed":0}}"#.to_string()
        }
    });
    let recorder = Arc::new(ErrorRecorder::default());
    let config = EvaluationConfig::builder()
        .concurrency(2)
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let evaluator = Arc::new(evaluator_with(model.clone(), config));

    let submissions = vec![
        text("good.md", "good submission"),
        text("partial.md", "partial submission"),
        text("broken.md", "broken submission"),
    ];
    let results: Vec<_> = evaluate_stream(evaluator, &[text("p.md", "Rule")], submissions)
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 3);
    let mut levels: Vec<(String, VerdictLevel)> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|e| (e.submission.clone(), e.verdict.level))
        .collect();
    levels.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        levels,
        vec![
            ("good.md".to_string(), VerdictLevel::Green),
            ("partial.md".to_string(), VerdictLevel::Yellow),
        ]
    );
    let failures: Vec<&str> = results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .map(|e| e.submission.as_str())
        .collect();
    assert_eq!(failures, vec!["broken.md"]);
    assert_eq!(recorder.verdicts.lock().unwrap().len(), 2);
    assert_eq!(model.prompts.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn batch_fails_early_when_policy_cannot_be_extracted() {
    let model = ScriptedModel::new(|_: &str| "GREEN".to_string());
    let evaluator = Arc::new(evaluator_with(model.clone(), EvaluationConfig::default()));
    let result = evaluate_stream(evaluator, &[text("empty.md", "   \n")], vec![text("s.md", "Doc")]).await;
    assert!(matches!(result, Err(PolicyCheckError::ExtractionFailure { .. })));
    assert!(model.prompts.lock().unwrap().is_empty());
}

// ── Properties ───────────────────────────────────────────────────────────────

proptest! {
    /// Every line appears exactly once: as body text or folded into the table.
    #[test]
    fn reconciled_lines_are_never_duplicated_or_dropped(
        free in 0usize..6,
        rows in 1usize..4,
        cols in 1usize..4,
        shadowed in proptest::collection::vec(any::<bool>(), 1..16),
    ) {
        let mut blocks = Vec::new();
        for i in 0..free {
            let top = 0.02 + i as f64 * 0.05;
            blocks.push(TextBlock::line(1, format!("free-{i:02}-line"), bb(top, 0.05, 0.5, 0.02)));
        }
        let (cell_w, cell_h) = (0.15, 0.08);
        let mut expected_cells = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                let cell_box = bb(0.5 + r as f64 * cell_h, 0.2 + c as f64 * cell_w, cell_w, cell_h);
                let label = format!("cell-{r}-{c}-text");
                let idx = r * cols + c;
                if shadowed.get(idx).copied().unwrap_or(false) {
                    let line_box = bb(cell_box.top + 0.01, cell_box.left + 0.01, 0.05, 0.02);
                    blocks.push(TextBlock::line(1, label.clone(), line_box));
                }
                blocks.push(TextBlock::cell(1, label.clone(), cell_box, CellAddress { table: 0, row: r, column: c }));
                expected_cells.push(label);
            }
        }

        let doc = geometry::reconcile(&blocks, CellFormat::Preserve);
        for i in 0..free {
            let label = format!("free-{i:02}-line");
            prop_assert_eq!(doc.markdown.matches(&label).count(), 1);
        }
        for label in &expected_cells {
            prop_assert_eq!(doc.markdown.matches(label.as_str()).count(), 1);
        }
        prop_assert_eq!(doc.tables, 1);
    }

    /// Counts always add up, and reconciling the corrected output is a no-op.
    #[test]
    fn corrected_summary_adds_up_and_is_stable(
        items in proptest::collection::vec((any::<bool>(), any::<bool>()), 0..12),
        reported in (0usize..20, 0usize..20, 0usize..20, 0usize..20),
    ) {
        let requirements: Vec<serde_json::Value> = items
            .iter()
            .enumerate()
            .map(|(i, (pass, partial))| {
                let mut item = serde_json::json!({"requirement": format!("r{i}"), "pass": pass});
                if *partial {
                    item["pass_status"] = serde_json::json!("PARTIAL");
                }
                item
            })
            .collect();
        let response = serde_json::json!({
            "requirements": requirements,
            "summary": {"totalChecks": reported.0, "passed": reported.1, "partial": reported.2, "failed": reported.3},
        })
        .to_string();

        let first = verdict::reconcile(&response, PromptProtocol::Structured).unwrap();
        let s = first.summary.unwrap();
        prop_assert_eq!(s.passed + s.partial + s.failed, s.total);
        prop_assert_eq!(s.total, items.len());

        let again = verdict::reconcile(&first.corrected_json().unwrap().to_string(), PromptProtocol::Structured).unwrap();
        let s2 = again.summary.unwrap();
        prop_assert_eq!((s2.total, s2.passed, s2.partial, s2.failed), (s.total, s.passed, s.partial, s.failed));
        prop_assert!(s2.consistent);
        prop_assert_eq!(again.level, first.level);
    }

    /// An N-column HTML table gives a header row and an N-marker separator row.
    #[test]
    fn formatted_table_has_one_marker_per_column(
        aligns in proptest::collection::vec(prop_oneof![Just("left"), Just("center"), Just("right")], 1..8),
        body_rows in 0usize..4,
    ) {
        let header: String = aligns
            .iter()
            .enumerate()
            .map(|(i, a)| format!("<th align=\"{a}\">H{i}</th>"))
            .collect();
        let body: String = (0..body_rows)
            .map(|r| format!("<tr>{}</tr>", (0..aligns.len()).map(|c| format!("<td>{r}.{c}</td>")).collect::<String>()))
            .collect();
        let md = html_table_to_markdown(&format!("<table><tr>{header}</tr>{body}</table>"));

        let rows: Vec<&str> = md.lines().filter(|l| l.starts_with('|')).collect();
        prop_assert_eq!(rows.len(), 2 + body_rows);
        let markers: Vec<&str> = rows[1].trim_matches('|').split('|').map(str::trim).collect();
        prop_assert_eq!(markers.len(), aligns.len());
        for (marker, align) in markers.iter().zip(&aligns) {
            let expected = match *align {
                "center" => ":---:",
                "right" => "---:",
                _ => "---",
            };
            prop_assert_eq!(*marker, expected);
        }
    }
}
