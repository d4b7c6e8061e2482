//! Eager evaluation entry points.
//!
//! [`Evaluator`] composes the pipeline stages for one policy and one
//! submission: extract both documents, build the prompt, size the token
//! budget, call the model and reconcile its answer into a [`Verdict`].
//! Use [`crate::stream::evaluate_stream`] to judge many submissions against
//! the same policy.
//!
//! [`Verdict`]: crate::pipeline::verdict::Verdict

use crate::config::{EvaluationConfig, DEFAULT_MODEL};
use crate::error::PolicyCheckError;
use crate::output::{Evaluation, EvaluationStats, ExtractionReport};
use crate::pipeline::extract::{ExtractedDocument, ExtractionEngine, ExtractionPolicy};
use crate::pipeline::input::SourceDocument;
use crate::pipeline::llm::{ComplianceModel, ProviderModel, TokenBudget};
use crate::pipeline::ocr::OcrPipeline;
use crate::pipeline::pdf::PdfTextReader;
use crate::pipeline::verdict;
use crate::prompts;
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Extracts documents and asks the model whether a submission meets a policy.
pub struct Evaluator {
    engine: ExtractionEngine,
    model: Arc<dyn ComplianceModel>,
    config: EvaluationConfig,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("engine", &self.engine)
            .field("model", &self.model.model_id())
            .field("config", &self.config)
            .finish()
    }
}

impl Evaluator {
    pub fn new(
        engine: ExtractionEngine,
        model: Arc<dyn ComplianceModel>,
        config: EvaluationConfig,
    ) -> Self {
        Self {
            engine,
            model,
            config,
        }
    }

    /// Build an evaluator whose model comes from the provider resolution chain.
    pub fn from_config(
        config: EvaluationConfig,
        reader: Arc<dyn PdfTextReader>,
        ocr: Option<Arc<OcrPipeline>>,
    ) -> Result<Self, PolicyCheckError> {
        let model = resolve_model(&config)?;
        let engine = ExtractionEngine::from_config(reader, ocr, &config);
        Ok(Self::new(engine, model, config))
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    pub fn engine(&self) -> &ExtractionEngine {
        &self.engine
    }

    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    /// Extract one document with progress events.
    pub async fn extract(
        &self,
        doc: &SourceDocument,
        policy: ExtractionPolicy,
    ) -> Result<ExtractedDocument, PolicyCheckError> {
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_extraction_start(doc.name());
        }
        let extracted = self.engine.extract(doc, policy).await?;
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_extraction_complete(doc.name(), extracted.markdown.chars().count(), extracted.used_ocr);
        }
        Ok(extracted)
    }

    /// Extract every policy document and join them, each followed by a newline.
    ///
    /// Table policy flags apply to submissions only; policy documents are
    /// always extracted with the default policy.
    pub async fn extract_policy(&self, docs: &[SourceDocument]) -> Result<String, PolicyCheckError> {
        if docs.is_empty() {
            return Err(PolicyCheckError::InvalidConfig(
                "At least one policy document is required".into(),
            ));
        }
        let mut policy = String::new();
        for doc in docs {
            let extracted = self.extract(doc, ExtractionPolicy::default()).await?;
            policy.push_str(&extracted.markdown);
            policy.push('\n');
        }
        info!(
            "Policy text: {} document(s), {} chars",
            docs.len(),
            policy.chars().count()
        );
        Ok(policy)
    }

    /// Evaluate one submission against policy documents.
    pub async fn evaluate(
        &self,
        policy_docs: &[SourceDocument],
        submission: &SourceDocument,
    ) -> Result<Evaluation, PolicyCheckError> {
        let policy_text = self.extract_policy(policy_docs).await?;
        self.evaluate_against(&policy_text, submission).await
    }

    /// Evaluate one submission against already-extracted policy text.
    pub async fn evaluate_against(
        &self,
        policy_text: &str,
        submission: &SourceDocument,
    ) -> Result<Evaluation, PolicyCheckError> {
        let result = self.evaluate_inner(policy_text, submission).await;
        if let Some(ref cb) = self.config.progress_callback {
            match &result {
                Ok(eval) => cb.on_submission_complete(submission.name(), eval.verdict.level.as_str()),
                Err(e) => cb.on_submission_error(submission.name(), &e.to_string()),
            }
        }
        result
    }

    async fn evaluate_inner(
        &self,
        policy_text: &str,
        submission: &SourceDocument,
    ) -> Result<Evaluation, PolicyCheckError> {
        let total_start = Instant::now();

        // ── Step 1: Extract submission ───────────────────────────────────
        let extraction_start = Instant::now();
        let extracted = self.extract(submission, self.config.submission_policy()).await?;
        let extraction_ms = extraction_start.elapsed().as_millis() as u64;

        // ── Step 2: Build prompt and budget ──────────────────────────────
        let prompt = prompts::evaluation_prompt(self.config.protocol, policy_text, &extracted.markdown);
        let budget = TokenBudget::for_prompt(
            &prompt,
            self.config.max_tokens,
            self.model.supports_extended_context(),
        );
        debug!(
            "'{}': prompt {} bytes, max_tokens {}",
            submission.name(),
            prompt.len(),
            budget.max_tokens
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_model_call(submission.name(), budget.max_tokens);
        }

        // ── Step 3: Ask the model ────────────────────────────────────────
        let llm_start = Instant::now();
        let raw_response = self.model.invoke(&prompt, &budget).await?;
        let llm_ms = llm_start.elapsed().as_millis() as u64;

        // ── Step 4: Reconcile ────────────────────────────────────────────
        let verdict = verdict::reconcile(&raw_response, self.config.protocol)?;
        info!("'{}': {}", submission.name(), verdict.level);

        Ok(Evaluation {
            submission: submission.name().to_string(),
            verdict,
            raw_response,
            extraction: ExtractionReport::from(&extracted),
            stats: EvaluationStats {
                policy_chars: policy_text.chars().count(),
                prompt_bytes: prompt.len(),
                max_tokens: budget.max_tokens,
                extended_context: budget.extended_context,
                extraction_ms,
                llm_ms,
                total_ms: total_start.elapsed().as_millis() as u64,
            },
        })
    }
}

/// Write Markdown to `path` atomically (temp file + rename).
pub async fn write_markdown(path: impl AsRef<Path>, markdown: &str) -> Result<(), PolicyCheckError> {
    let path = path.as_ref();
    let write_err = |e: std::io::Error| PolicyCheckError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, markdown).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

/// `input` with its extension replaced by `.md`.
pub fn default_output_path(input: &Path) -> PathBuf {
    input.with_extension("md")
}

// ── Provider resolution ──────────────────────────────────────────────────

/// Build the production [`ComplianceModel`] for `config`.
pub fn resolve_model(config: &EvaluationConfig) -> Result<Arc<dyn ComplianceModel>, PolicyCheckError> {
    let (provider, model_id) = resolve_provider(config)?;
    info!("Using model {}", model_id);
    Ok(Arc::new(ProviderModel::new(provider, model_id, config)))
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PolicyCheckError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PolicyCheckError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`).
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **OpenAI key** (`OPENAI_API_KEY`) with the configured or default model.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
///
/// Returns the provider and the model id used for extended-context lookup.
fn resolve_provider(
    config: &EvaluationConfig,
) -> Result<(Arc<dyn LLMProvider>, String), PolicyCheckError> {
    let configured_model = config.model.clone();

    if let Some(ref provider) = config.provider {
        let model = configured_model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        return Ok((Arc::clone(provider), model));
    }

    if let Some(ref name) = config.provider_name {
        let model = configured_model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        return Ok((create_provider(name, &model)?, model));
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return Ok((create_provider(&prov, &model)?, model));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = configured_model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
            return Ok((create_provider("openai", &model)?, model));
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PolicyCheckError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok((llm_provider, configured_model.unwrap_or_else(|| "auto".to_string())))
}
