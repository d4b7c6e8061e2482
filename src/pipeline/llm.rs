//! LLM interaction: size the token budget and call the provider.
//!
//! [`ComplianceModel`] is the seam the orchestrator calls; tests plug in a
//! scripted model, production uses [`ProviderModel`] over an
//! `edgequake-llm` provider. Prompt wording lives in [`crate::prompts`].
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from LLM APIs are transient and frequent under
//! concurrent load. Exponential backoff (`retry_backoff_ms * 2^attempt`)
//! spreads retries out; each attempt is also bounded by the API timeout so a
//! hung connection counts as a failed attempt rather than a stuck request.

use crate::config::EvaluationConfig;
use crate::error::PolicyCheckError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Floor for the computed completion budget.
pub const MIN_MAX_TOKENS: usize = 5_000;

/// Budget above which a model needs its extended context window.
pub const STANDARD_CONTEXT_TOKENS: usize = 200_000;

/// Completion budget for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub max_tokens: usize,
    /// The call needs more than [`STANDARD_CONTEXT_TOKENS`] and the model allows it.
    ///
    /// The only effect is that `max_tokens` is not capped; the provider picks
    /// the context window from the model id, and `CompletionOptions` has no
    /// field to request one.
    pub extended_context: bool,
}

impl TokenBudget {
    /// Two-thirds of the prompt's byte length, at least [`MIN_MAX_TOKENS`],
    /// unless `override_tokens` is given.
    ///
    /// Budgets over [`STANDARD_CONTEXT_TOKENS`] switch on extended context
    /// when the model supports it and are capped otherwise.
    pub fn for_prompt(prompt: &str, override_tokens: Option<usize>, supports_extended: bool) -> Self {
        let wanted = override_tokens.unwrap_or_else(|| (prompt.len() * 2 / 3).max(MIN_MAX_TOKENS));
        if wanted <= STANDARD_CONTEXT_TOKENS {
            return Self {
                max_tokens: wanted,
                extended_context: false,
            };
        }
        if supports_extended {
            Self {
                max_tokens: wanted,
                extended_context: true,
            }
        } else {
            warn!(
                "Token budget {} exceeds {} and the model has no extended context; capping",
                wanted, STANDARD_CONTEXT_TOKENS
            );
            Self {
                max_tokens: STANDARD_CONTEXT_TOKENS,
                extended_context: false,
            }
        }
    }
}

/// A language model that answers one compliance prompt with free text.
#[async_trait]
pub trait ComplianceModel: Send + Sync {
    /// Identifier used for logging and extended-context lookup.
    fn model_id(&self) -> &str;

    fn supports_extended_context(&self) -> bool {
        false
    }

    /// Send `prompt` and return the raw response text.
    async fn invoke(&self, prompt: &str, budget: &TokenBudget) -> Result<String, PolicyCheckError>;
}

/// [`ComplianceModel`] over an `edgequake-llm` provider, with retry and timeout.
pub struct ProviderModel {
    provider: Arc<dyn LLMProvider>,
    model_id: String,
    extended_context: bool,
    temperature: f32,
    max_retries: u32,
    retry_backoff_ms: u64,
    api_timeout: Duration,
}

impl std::fmt::Debug for ProviderModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderModel")
            .field("model_id", &self.model_id)
            .field("extended_context", &self.extended_context)
            .field("temperature", &self.temperature)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl ProviderModel {
    pub fn new(provider: Arc<dyn LLMProvider>, model_id: impl Into<String>, config: &EvaluationConfig) -> Self {
        let model_id = model_id.into();
        let extended_context = config
            .extended_context_models
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&model_id));
        Self {
            provider,
            model_id,
            extended_context,
            temperature: config.temperature,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            api_timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

}

fn completion_options(temperature: f32, budget: &TokenBudget) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(temperature),
        max_tokens: Some(budget.max_tokens),
        ..Default::default()
    }
}

#[async_trait]
impl ComplianceModel for ProviderModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn supports_extended_context(&self) -> bool {
        self.extended_context
    }

    async fn invoke(&self, prompt: &str, budget: &TokenBudget) -> Result<String, PolicyCheckError> {
        let messages = vec![ChatMessage::user(prompt)];
        let options = completion_options(self.temperature, budget);
        if budget.extended_context {
            info!("{}: budget of {} tokens left uncapped", self.model_id, budget.max_tokens);
        }

        let start = Instant::now();
        let mut last_err: Option<String> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    self.model_id, attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match timeout(self.api_timeout, self.provider.chat(&messages, Some(&options))).await {
                Ok(Ok(response)) => {
                    debug!(
                        "{}: {} input tokens, {} output tokens, {:?}",
                        self.model_id,
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(response.content);
                }
                Ok(Err(e)) => {
                    warn!("{}: attempt {} failed: {}", self.model_id, attempt + 1, e);
                    last_err = Some(e.to_string());
                }
                Err(_) => {
                    warn!(
                        "{}: attempt {} timed out after {:?}",
                        self.model_id,
                        attempt + 1,
                        self.api_timeout
                    );
                    last_err = Some(format!("timed out after {}s", self.api_timeout.as_secs()));
                }
            }
        }

        Err(PolicyCheckError::service(
            "llm",
            format!(
                "{} failed after {} attempt(s): {}",
                self.model_id,
                self.max_retries + 1,
                last_err.unwrap_or_else(|| "unknown error".to_string())
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_prompt_gets_floor() {
        let b = TokenBudget::for_prompt("short", None, false);
        assert_eq!(b.max_tokens, MIN_MAX_TOKENS);
        assert!(!b.extended_context);
    }

    #[test]
    fn budget_is_two_thirds_of_bytes() {
        let prompt = "x".repeat(30_000);
        assert_eq!(TokenBudget::for_prompt(&prompt, None, false).max_tokens, 20_000);
    }

    #[test]
    fn override_wins_over_computation() {
        let prompt = "x".repeat(30_000);
        assert_eq!(TokenBudget::for_prompt(&prompt, Some(1_000), false).max_tokens, 1_000);
    }

    #[test]
    fn large_budget_uses_extended_context_when_supported() {
        let prompt = "x".repeat(600_000);
        let b = TokenBudget::for_prompt(&prompt, None, true);
        assert_eq!(b.max_tokens, 400_000);
        assert!(b.extended_context);
    }

    #[test]
    fn large_budget_is_capped_without_extended_context() {
        let prompt = "x".repeat(600_000);
        let b = TokenBudget::for_prompt(&prompt, None, false);
        assert_eq!(b.max_tokens, STANDARD_CONTEXT_TOKENS);
        assert!(!b.extended_context);
    }

    #[test]
    fn uncapped_budget_reaches_completion_options() {
        let prompt = "x".repeat(600_000);
        let extended = TokenBudget::for_prompt(&prompt, None, true);
        let capped = TokenBudget::for_prompt(&prompt, None, false);
        assert_eq!(completion_options(0.1, &extended).max_tokens, Some(400_000));
        assert_eq!(completion_options(0.1, &capped).max_tokens, Some(STANDARD_CONTEXT_TOKENS));
        assert_eq!(completion_options(0.1, &capped).temperature, Some(0.1));
    }

    #[test]
    fn budget_counts_bytes_not_chars() {
        let prompt = "é".repeat(9_000);
        assert_eq!(TokenBudget::for_prompt(&prompt, None, false).max_tokens, 12_000);
    }
}
