//! Configuration types for extraction and evaluation.
//!
//! All behaviour is controlled through [`EvaluationConfig`], built via its
//! [`EvaluationConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across tasks and to log exactly what a run used.

use crate::error::PolicyCheckError;
use crate::pipeline::extract::ExtractionPolicy;
use crate::pipeline::geometry::CellFormat;
use crate::progress::EvaluationProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Default character budget for each extracted document.
pub const DEFAULT_MAX_DOCUMENT_CHARS: usize = 150_000;

/// Default model when a provider is chosen by name or API key.
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

/// Configuration for extracting documents and evaluating them against a policy.
///
/// Built via [`EvaluationConfig::builder()`] or using
/// [`EvaluationConfig::default()`].
///
/// # Example
/// ```rust
/// use policycheck::EvaluationConfig;
///
/// let config = EvaluationConfig::builder()
///     .model("gpt-4.1-mini")
///     .max_document_chars(50_000)
///     .reject_tables(true)
///     .build()
///     .unwrap();
/// assert!(config.reject_tables);
/// ```
#[derive(Clone)]
pub struct EvaluationConfig {
    /// LLM model identifier, e.g. "gpt-4.1-mini", "claude-sonnet-4-20250514".
    /// If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, the provider is detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    ///
    /// Grading the same documents twice should give the same verdict.
    pub temperature: f32,

    /// Fixed completion budget. Default: None.
    ///
    /// When None the budget is computed per prompt: two-thirds of the prompt's
    /// byte length, at least 5 000 tokens.
    pub max_tokens: Option<usize>,

    /// Models allowed to use a context window above 200 000 tokens.
    pub extended_context_models: Vec<String>,

    /// Maximum retry attempts on a failed LLM call. Default: 10.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-LLM-call timeout in seconds. Default: 300.
    pub api_timeout_secs: u64,

    /// Character budget per extracted document; 0 disables truncation. Default: 150 000.
    pub max_document_chars: usize,

    /// Which response format the prompt asks for. Default: Structured.
    pub protocol: PromptProtocol,

    /// Fail submissions that contain tables. Default: false.
    pub reject_tables: bool,

    /// Send table-bearing submissions through OCR. Default: false.
    pub prefer_ocr_for_tables: bool,

    /// Collapse multi-line OCR table cells to one line. Default: false.
    pub flatten_table_cells: bool,

    /// OCR staging and polling settings. Default: None (no OCR).
    pub ocr: Option<OcrSettings>,

    /// Submissions evaluated concurrently in batch mode. Default: 4.
    pub concurrency: usize,

    /// Progress callback. Default: None.
    pub progress_callback: Option<Arc<dyn EvaluationProgressCallback>>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: None,
            extended_context_models: vec![
                "claude-sonnet-4-20250514".to_string(),
                "claude-sonnet-4-5".to_string(),
                "gpt-4.1".to_string(),
                "gpt-4.1-mini".to_string(),
            ],
            max_retries: 10,
            retry_backoff_ms: 500,
            api_timeout_secs: 300,
            max_document_chars: DEFAULT_MAX_DOCUMENT_CHARS,
            protocol: PromptProtocol::default(),
            reject_tables: false,
            prefer_ocr_for_tables: false,
            flatten_table_cells: false,
            ocr: None,
            concurrency: 4,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for EvaluationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_document_chars", &self.max_document_chars)
            .field("protocol", &self.protocol)
            .field("reject_tables", &self.reject_tables)
            .field("prefer_ocr_for_tables", &self.prefer_ocr_for_tables)
            .field("flatten_table_cells", &self.flatten_table_cells)
            .field("ocr", &self.ocr)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl EvaluationConfig {
    /// Create a new builder for `EvaluationConfig`.
    pub fn builder() -> EvaluationConfigBuilder {
        EvaluationConfigBuilder {
            config: Self::default(),
        }
    }

    /// Table policy applied to submission documents.
    pub fn submission_policy(&self) -> ExtractionPolicy {
        ExtractionPolicy {
            reject_tables: self.reject_tables,
            prefer_ocr_for_tables: self.prefer_ocr_for_tables,
        }
    }

    pub fn cell_format(&self) -> CellFormat {
        if self.flatten_table_cells {
            CellFormat::Flatten
        } else {
            CellFormat::Preserve
        }
    }
}

/// Builder for [`EvaluationConfig`].
#[derive(Debug)]
pub struct EvaluationConfigBuilder {
    config: EvaluationConfig,
}

impl EvaluationConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = Some(n);
        self
    }

    pub fn extended_context_models(mut self, models: Vec<String>) -> Self {
        self.config.extended_context_models = models;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_document_chars(mut self, n: usize) -> Self {
        self.config.max_document_chars = n;
        self
    }

    pub fn protocol(mut self, protocol: PromptProtocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn reject_tables(mut self, v: bool) -> Self {
        self.config.reject_tables = v;
        self
    }

    pub fn prefer_ocr_for_tables(mut self, v: bool) -> Self {
        self.config.prefer_ocr_for_tables = v;
        self
    }

    pub fn flatten_table_cells(mut self, v: bool) -> Self {
        self.config.flatten_table_cells = v;
        self
    }

    pub fn ocr(mut self, settings: OcrSettings) -> Self {
        self.config.ocr = Some(settings);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn progress_callback(mut self, cb: Arc<dyn EvaluationProgressCallback>) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<EvaluationConfig, PolicyCheckError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(PolicyCheckError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.max_tokens == Some(0) {
            return Err(PolicyCheckError::InvalidConfig(
                "max_tokens must be ≥ 1 when set".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(PolicyCheckError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if let Some(ocr) = &c.ocr {
            if ocr.bucket.trim().is_empty() {
                return Err(PolicyCheckError::InvalidConfig(
                    "OCR staging bucket name is empty".into(),
                ));
            }
            if ocr.timeout_secs == 0 {
                return Err(PolicyCheckError::InvalidConfig(
                    "OCR timeout must be ≥ 1 second".into(),
                ));
            }
        }
        Ok(self.config)
    }
}

// ── Settings ─────────────────────────────────────────────────────────────

/// Which response format the prompt asks the model for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PromptProtocol {
    /// JSON `requirements` array plus `summary`. (default)
    #[default]
    Structured,
    /// A single GREEN/YELLOW/ORANGE/RED word plus an explanation.
    Legacy,
}

/// OCR staging bucket and polling bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrSettings {
    /// Staging bucket, created once when the OCR pipeline connects.
    pub bucket: String,
    /// Seconds between job status polls. Default: 5.
    pub poll_interval_secs: u64,
    /// Seconds before a running job is abandoned. Default: 900.
    pub timeout_secs: u64,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            bucket: "policycheck-staging".to_string(),
            poll_interval_secs: 5,
            timeout_secs: 900,
        }
    }
}

impl OcrSettings {
    pub fn with_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }
}
