//! CLI binary for policycheck.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `EvaluationConfig`, wires the OCR collaborators from the environment and
//! prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use policycheck::pipeline::pdf::{PdfReadError, RawTextMethod, TableStrategy};
use policycheck::pipeline::verdict::ProtocolKind;
use policycheck::{
    default_output_path, evaluate_text_stream, write_markdown, Evaluation, EvaluationConfig,
    EvaluationProgressCallback, Evaluator, ExtractionEngine, FsObjectStore, HttpOcrService,
    OcrPipeline, OcrSettings, PdfTextReader, PdfiumReader, ProgressCallback, PromptProtocol,
    SourceDocument, SubmissionError, VerdictLevel,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Per-request timeout for the OCR job service.
const OCR_REQUEST_TIMEOUT_SECS: u64 = 60;

const RULE: &str = "================================================================================";
const DASHES: &str = "--------------------------------------------------------------------------------";

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

fn colour_level(level: VerdictLevel) -> String {
    match level {
        VerdictLevel::Green => green(level.as_str()),
        VerdictLevel::Yellow | VerdictLevel::Orange => yellow(level.as_str()),
        VerdictLevel::Red => red(level.as_str()),
    }
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: a spinner plus one log line per finished submission.
/// Submissions finish out of order in batch mode.
struct CliProgressCallback {
    bar: ProgressBar,
    done: AtomicUsize,
    total: usize,
}

impl CliProgressCallback {
    fn new(total: usize) -> Arc<Self> {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Evaluating");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            done: AtomicUsize::new(0),
            total,
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl EvaluationProgressCallback for CliProgressCallback {
    fn on_extraction_start(&self, name: &str) {
        self.bar.set_message(format!("extracting {name}"));
    }

    fn on_extraction_complete(&self, name: &str, chars: usize, used_ocr: bool) {
        self.bar.println(format!(
            "  {} {:<32} {}{}",
            dim("·"),
            name,
            dim(&format!("{chars:>7} chars")),
            if used_ocr { dim("  (ocr)") } else { String::new() },
        ));
    }

    fn on_model_call(&self, name: &str, max_tokens: usize) {
        self.bar
            .set_message(format!("asking the model about {name} ({max_tokens} max tokens)"));
    }

    fn on_submission_complete(&self, name: &str, verdict: &str) {
        let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        self.bar.println(format!(
            "  {} {:>2}/{:<2} {:<32} {}",
            green("✓"),
            n,
            self.total,
            name,
            bold(verdict)
        ));
        self.bar.inc(1);
    }

    fn on_submission_error(&self, name: &str, error: &str) {
        let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let first_line = error.lines().next().unwrap_or(error);
        self.bar.println(format!(
            "  {} {:>2}/{:<2} {:<32} {}",
            red("✗"),
            n,
            self.total,
            name,
            red(first_line)
        ));
        self.bar.inc(1);
    }
}

// ── Missing pdfium ───────────────────────────────────────────────────────────

/// Stand-in reader when pdfium could not be bound. Text inputs still work;
/// PDFs fail extraction with the binding error in their attempt list.
struct UnavailableReader(String);

impl PdfTextReader for UnavailableReader {
    fn page_texts(&self, _bytes: &[u8]) -> Result<Vec<String>, PdfReadError> {
        Err(PdfReadError(self.0.clone()))
    }

    fn markdown(&self, _bytes: &[u8], _strategy: TableStrategy) -> Result<String, PdfReadError> {
        Err(PdfReadError(self.0.clone()))
    }

    fn raw_text(&self, _bytes: &[u8], _method: RawTextMethod) -> Result<Vec<String>, PdfReadError> {
        Err(PdfReadError(self.0.clone()))
    }
}

fn pdf_reader() -> Arc<dyn PdfTextReader> {
    match PdfiumReader::new() {
        Ok(reader) => Arc::new(reader),
        Err(e) => {
            tracing::warn!("pdfium unavailable, PDFs cannot be read locally: {}", e);
            Arc::new(UnavailableReader(format!("pdfium unavailable: {e}")))
        }
    }
}

// ── Arguments ────────────────────────────────────────────────────────────────

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one document to Markdown (writes contract.md)
  policycheck extract contract.pdf

  # Evaluate two quotes against a policy made of two files
  policycheck evaluate --policy rules.pdf --policy annex.md \
      --submission quote-a.pdf --submission quote-b.pdf

  # Show the raw model output and a requirement-by-requirement breakdown
  policycheck evaluate --debug --policy rules.md --submission quote.pdf

  # Legacy single-word verdicts, JSON output
  policycheck evaluate --legacy --json --policy rules.md --submission quote.txt

VERDICTS:
  GREEN   every requirement is met
  YELLOW  no requirement fails, at least one is only partly met
  ORANGE  requirements are ambiguous (legacy protocol only)
  RED     at least one requirement is not met

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY            OpenAI API key
  ANTHROPIC_API_KEY         Anthropic API key
  EDGEQUAKE_LLM_PROVIDER    Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL           Override model ID
  PDFIUM_LIB_PATH           Path to libpdfium (file or directory)
  POLICYCHECK_OCR_ENDPOINT  Base URL of the OCR job service; enables OCR
  POLICYCHECK_OCR_API_KEY   Bearer token for the OCR job service
  POLICYCHECK_OCR_BUCKET    Staging bucket name
  POLICYCHECK_STAGING_DIR   Directory backing the staging store

A .env file in the working directory is loaded first.
"#;

/// Check documents against a compliance policy with an LLM.
#[derive(Parser, Debug)]
#[command(
    name = "policycheck",
    version,
    about = "Check documents against a compliance policy with an LLM",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "POLICYCHECK_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and results.
    #[arg(short, long, global = true, env = "POLICYCHECK_QUIET")]
    quiet: bool,

    /// Disable the progress bar.
    #[arg(long, global = true, env = "POLICYCHECK_NO_PROGRESS")]
    no_progress: bool,

    #[command(flatten)]
    ocr: OcrArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one document to Markdown.
    Extract(ExtractArgs),
    /// Evaluate submissions against a policy.
    Evaluate(EvaluateArgs),
}

#[derive(Args, Debug)]
struct OcrArgs {
    /// OCR job service base URL. OCR is disabled when unset.
    #[arg(long, global = true, env = "POLICYCHECK_OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,

    /// Bearer token for the OCR job service.
    #[arg(long, global = true, env = "POLICYCHECK_OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,

    /// Staging bucket for OCR uploads.
    #[arg(long, global = true, env = "POLICYCHECK_OCR_BUCKET", default_value = "policycheck-staging")]
    ocr_bucket: String,

    /// Directory backing the staging store.
    #[arg(long, global = true, env = "POLICYCHECK_STAGING_DIR")]
    staging_dir: Option<PathBuf>,

    /// Seconds between OCR status polls.
    #[arg(long, global = true, env = "POLICYCHECK_OCR_POLL", default_value_t = 5)]
    ocr_poll: u64,

    /// Seconds before an OCR job is abandoned.
    #[arg(long, global = true, env = "POLICYCHECK_OCR_TIMEOUT", default_value_t = 900)]
    ocr_timeout: u64,
}

#[derive(Args, Debug)]
struct TableArgs {
    /// Fail documents that contain tables.
    #[arg(long, env = "POLICYCHECK_REJECT_TABLES")]
    reject_tables: bool,

    /// Send documents with tables through OCR.
    #[arg(long = "prefer-ocr", env = "POLICYCHECK_PREFER_OCR")]
    prefer_ocr: bool,

    /// Collapse multi-line table cells to one line.
    #[arg(long = "flatten-cells", env = "POLICYCHECK_FLATTEN_CELLS")]
    flatten_cells: bool,

    /// Character budget per document; 0 disables truncation.
    #[arg(long, env = "POLICYCHECK_MAX_CHARS", default_value_t = policycheck::config::DEFAULT_MAX_DOCUMENT_CHARS)]
    max_chars: usize,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// PDF, text or Markdown file.
    input: PathBuf,

    /// Output file; `-` writes to stdout. Default: the input with a `.md` extension.
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(flatten)]
    tables: TableArgs,
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    /// Policy document(s); several are joined in order.
    #[arg(long = "policy", required = true, num_args = 1..)]
    policy: Vec<PathBuf>,

    /// Submission document(s); each is evaluated separately.
    #[arg(long = "submission", required = true, num_args = 1..)]
    submission: Vec<PathBuf>,

    /// Ask for a single GREEN/YELLOW/ORANGE/RED word instead of JSON.
    #[arg(long, env = "POLICYCHECK_LEGACY")]
    legacy: bool,

    /// Print results as JSON.
    #[arg(long, env = "POLICYCHECK_JSON")]
    json: bool,

    /// Print the raw model output and the requirement breakdown.
    #[arg(long, env = "POLICYCHECK_DEBUG")]
    debug: bool,

    /// LLM model ID (e.g. gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Fixed completion budget. Default: two-thirds of the prompt bytes, at least 5000.
    #[arg(long, env = "POLICYCHECK_MAX_TOKENS")]
    max_tokens: Option<usize>,

    /// Retries per LLM call.
    #[arg(long, env = "POLICYCHECK_MAX_RETRIES", default_value_t = 10)]
    max_retries: u32,

    /// Per-LLM-call timeout in seconds.
    #[arg(long, env = "POLICYCHECK_API_TIMEOUT", default_value_t = 300)]
    api_timeout: u64,

    /// Submissions evaluated at the same time.
    #[arg(short, long, env = "POLICYCHECK_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    #[command(flatten)]
    tables: TableArgs,
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || !cli.no_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Extract(args) => run_extract(&cli, args).await,
        Command::Evaluate(args) => run_evaluate(&cli, args).await,
    }
}

/// Connect the OCR pipeline when an endpoint is configured.
async fn build_ocr(args: &OcrArgs) -> Result<Option<(Arc<OcrPipeline>, OcrSettings)>> {
    let Some(ref endpoint) = args.ocr_endpoint else {
        return Ok(None);
    };
    let settings = OcrSettings {
        bucket: args.ocr_bucket.clone(),
        poll_interval_secs: args.ocr_poll,
        timeout_secs: args.ocr_timeout,
    };
    let staging = args
        .staging_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("policycheck"));

    let mut service = HttpOcrService::new(endpoint, OCR_REQUEST_TIMEOUT_SECS)
        .context("Failed to build the OCR client")?;
    if let Some(ref key) = args.ocr_api_key {
        service = service.with_api_key(key);
    }
    let pipeline = OcrPipeline::connect(
        Arc::new(FsObjectStore::new(staging)),
        Arc::new(service),
        &settings,
    )
    .await
    .context("Failed to prepare OCR staging")?;
    Ok(Some((Arc::new(pipeline), settings)))
}

fn apply_tables(
    builder: policycheck::EvaluationConfigBuilder,
    tables: &TableArgs,
) -> policycheck::EvaluationConfigBuilder {
    builder
        .reject_tables(tables.reject_tables)
        .prefer_ocr_for_tables(tables.prefer_ocr)
        .flatten_table_cells(tables.flatten_cells)
        .max_document_chars(tables.max_chars)
}

// ── extract ──────────────────────────────────────────────────────────────────

async fn run_extract(cli: &Cli, args: &ExtractArgs) -> Result<()> {
    let doc = SourceDocument::from_path(&args.input)
        .with_context(|| format!("Failed to load {}", args.input.display()))?;

    let ocr = build_ocr(&cli.ocr).await?;
    let mut builder = apply_tables(EvaluationConfig::builder(), &args.tables);
    if let Some((_, ref settings)) = ocr {
        builder = builder.ocr(settings.clone());
    }
    let config = builder.build().context("Invalid configuration")?;
    let engine = ExtractionEngine::from_config(pdf_reader(), ocr.map(|(p, _)| p), &config);

    let spinner = (!cli.quiet && !cli.no_progress).then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_message(format!("Extracting {}…", doc.name()));
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    });
    let result = engine.extract(&doc, config.submission_policy()).await;
    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }
    let extracted = result.context("Extraction failed")?;

    for warning in &extracted.warnings {
        tracing::warn!("{}", warning);
    }

    match args.output.as_deref() {
        Some(p) if p.as_os_str() == "-" => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(extracted.markdown.as_bytes())
                .context("Failed to write to stdout")?;
            if !extracted.markdown.ends_with('\n') {
                handle.write_all(b"\n").ok();
            }
        }
        output => {
            let out = output
                .map(PathBuf::from)
                .unwrap_or_else(|| default_output_path(&args.input));
            write_markdown(&out, &extracted.markdown)
                .await
                .context("Failed to write Markdown")?;
            if !cli.quiet {
                println!(
                    "Successfully converted:\n  {}\n  -> {}",
                    args.input.display(),
                    out.display()
                );
                eprintln!(
                    "   {} via {}{}",
                    dim(&format!("{} chars", extracted.markdown.chars().count())),
                    extracted.method,
                    if extracted.truncated {
                        format!("  (truncated from {})", extracted.original_chars)
                    } else {
                        String::new()
                    }
                );
            }
        }
    }
    Ok(())
}

// ── evaluate ─────────────────────────────────────────────────────────────────

async fn run_evaluate(cli: &Cli, args: &EvaluateArgs) -> Result<()> {
    let policy_docs: Vec<SourceDocument> = args
        .policy
        .iter()
        .map(|p| SourceDocument::from_path(p).with_context(|| format!("Failed to load policy {}", p.display())))
        .collect::<Result<_>>()?;
    let submissions: Vec<SourceDocument> = args
        .submission
        .iter()
        .map(|p| {
            SourceDocument::from_path(p)
                .with_context(|| format!("Failed to load submission {}", p.display()))
        })
        .collect::<Result<_>>()?;
    let total = submissions.len();

    let show_progress = !cli.quiet && !cli.no_progress && !args.json && !args.debug;
    let progress = show_progress.then(|| CliProgressCallback::new(total));

    let ocr = build_ocr(&cli.ocr).await?;
    let mut builder = apply_tables(EvaluationConfig::builder(), &args.tables)
        .protocol(if args.legacy {
            PromptProtocol::Legacy
        } else {
            PromptProtocol::Structured
        })
        .max_retries(args.max_retries)
        .api_timeout_secs(args.api_timeout)
        .concurrency(args.concurrency);
    if let Some(n) = args.max_tokens {
        builder = builder.max_tokens(n);
    }
    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some((_, ref settings)) = ocr {
        builder = builder.ocr(settings.clone());
    }
    if let Some(ref cb) = progress {
        builder = builder.progress_callback(Arc::clone(cb) as ProgressCallback);
    }
    let config = builder.build().context("Invalid configuration")?;

    let evaluator = Arc::new(
        Evaluator::from_config(config, pdf_reader(), ocr.map(|(p, _)| p))
            .context("Failed to set up the model")?,
    );

    if args.debug {
        println!("LLM Configuration:");
        println!("  Model: {}", evaluator.model_id());
        match args.max_tokens {
            Some(n) => println!("  Max Tokens: {n}"),
            None => println!("  Max Tokens: Dynamic (2/3 of input bytes, min 5000)"),
        }
        println!("  Temperature: {}", evaluator.config().temperature);
        println!();
    }

    let policy_text = evaluator
        .extract_policy(&policy_docs)
        .await
        .context("Failed to extract the policy")?;
    let mut results = evaluate_text_stream(Arc::clone(&evaluator), Arc::from(policy_text), submissions);

    let mut json_items = Vec::new();
    let mut failed = 0usize;
    let mut index = 0usize;
    while let Some(item) = results.next().await {
        index += 1;
        if item.is_err() {
            failed += 1;
        }
        if args.json {
            json_items.push(json_item(&item)?);
        } else if let Some(ref bar) = progress {
            let text = render_item(index, total, &item, args.debug);
            bar.bar.suspend(|| print!("{text}"));
        } else {
            print!("{}", render_item(index, total, &item, args.debug));
        }
    }
    if let Some(cb) = progress {
        cb.finish();
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json_items).context("Failed to serialise output")?
        );
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {total} submission(s) could not be evaluated");
    }
    Ok(())
}

fn json_item(item: &Result<Evaluation, SubmissionError>) -> Result<serde_json::Value> {
    Ok(match item {
        Ok(eval) => serde_json::to_value(eval).context("Failed to serialise evaluation")?,
        Err(e) => serde_json::json!({
            "submission": e.submission,
            "error": e.error.to_string(),
        }),
    })
}

/// Text block printed for one submission.
fn render_item(
    index: usize,
    total: usize,
    item: &Result<Evaluation, SubmissionError>,
    debug: bool,
) -> String {
    let name = match item {
        Ok(eval) => eval.submission.as_str(),
        Err(e) => e.submission.as_str(),
    };
    let mut out = format!("\n{RULE}\nEVALUATION {index}/{total}: {name}\n{RULE}\n");

    let eval = match item {
        Ok(eval) => eval,
        Err(e) => {
            out.push_str(&format!("\n{} {}\n", red("ERROR:"), e.error));
            return out;
        }
    };

    if debug {
        out.push_str(&format!("\nRAW LLM OUTPUT:\n{DASHES}\n{}\n{DASHES}\n", eval.raw_response.trim_end()));
    }

    out.push_str(&format!("\nRESULT: {}\n", colour_level(eval.verdict.level)));

    match eval.verdict.protocol {
        ProtocolKind::Structured => {
            if let Some(ref statement) = eval.verdict.statement {
                out.push_str(&format!("\nSummary Statement: {statement}\n"));
            }
            if let Some(summary) = eval.verdict.summary {
                out.push_str(&format!(
                    "Total Checks: {}\nPassed: {}\nPartial: {}\nFailed: {}\n",
                    summary.total, summary.passed, summary.partial, summary.failed
                ));
            }
            if debug || eval.verdict.level != VerdictLevel::Green {
                out.push('\n');
                for req in &eval.verdict.requirements {
                    let mark = if req.is_partial() {
                        yellow("~ PARTIAL")
                    } else if req.passed {
                        green("✓ PASS")
                    } else {
                        red("✗ FAIL")
                    };
                    out.push_str(&format!("{mark}  {}\n", req.requirement));
                    if let Some(ref notes) = req.notes {
                        out.push_str(&format!("        {}\n", dim(notes)));
                    }
                }
            }
        }
        ProtocolKind::Legacy => {
            out.push_str(&format!("\nANALYSIS:\n{}\n", eval.verdict.explanation));
        }
    }

    if debug {
        for note in &eval.verdict.notes {
            out.push_str(&format!("{} {note}\n", yellow("note:")));
        }
        if eval.extraction.truncated {
            out.push_str(&format!(
                "{} submission truncated to {} chars\n",
                yellow("note:"),
                eval.extraction.chars
            ));
        }
        out.push_str(&format!(
            "{}\n",
            dim(&format!(
                "extraction: {}{}  prompt: {} bytes  max_tokens: {}  {}ms",
                eval.extraction.method,
                if eval.extraction.used_ocr { " (ocr)" } else { "" },
                eval.stats.prompt_bytes,
                eval.stats.max_tokens,
                eval.stats.total_ms
            ))
        ));
    }
    out
}
