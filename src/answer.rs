//! Grounded answer generation.
//!
//! The pipeline hands an [`AnswerClient`] the question and the structured
//! [`PromptPayload`]; how that becomes a model call is up to the client.
//! [`ProviderAnswerClient`] renders the payload into the prompt template and
//! calls an `edgequake_llm` chat provider.
//!
//! ## Retry Strategy
//!
//! Rate limits and 5xx responses are common under load. Exponential backoff
//! (`retry_backoff_ms * 2^attempt`) with 500 ms base and 3 retries waits
//! 500 ms → 1 s → 2 s before giving up.

use crate::config::QaConfig;
use crate::context::PromptPayload;
use crate::error::{CollaboratorError, DocQaError};
use crate::prompts::{fill_template, DEFAULT_PROMPT_TEMPLATE, DEFAULT_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Default chat model when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

/// Produces an answer grounded in the supplied context.
#[async_trait]
pub trait AnswerClient: Send + Sync {
    async fn generate(&self, question: &str, payload: &PromptPayload)
        -> Result<String, CollaboratorError>;

    /// Retry budget, reported in [`DocQaError::Generation`] on failure.
    fn max_retries(&self) -> u32 {
        0
    }
}

/// [`AnswerClient`] over an `edgequake_llm` chat provider.
pub struct ProviderAnswerClient {
    provider: Arc<dyn LLMProvider>,
    system_prompt: String,
    template: String,
    max_text_chars: usize,
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl ProviderAnswerClient {
    /// Take template, sampling, and retry settings from `config`.
    pub fn new(provider: Arc<dyn LLMProvider>, config: &QaConfig) -> Self {
        Self {
            provider,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            template: config
                .prompt_template
                .clone()
                .unwrap_or_else(|| DEFAULT_PROMPT_TEMPLATE.to_string()),
            max_text_chars: config.max_text_chars,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// The user-turn prompt sent for `question`.
    pub fn render_prompt(&self, question: &str, payload: &PromptPayload) -> String {
        render_prompt(&self.template, self.max_text_chars, question, payload)
    }
}

fn render_prompt(
    template: &str,
    max_text_chars: usize,
    question: &str,
    payload: &PromptPayload,
) -> String {
    fill_template(template, &payload.render(max_text_chars), question)
}

/// Build `CompletionOptions` from the sampling settings.
fn build_options(temperature: f32, max_tokens: usize) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(temperature),
        max_tokens: Some(max_tokens),
        ..Default::default()
    }
}

#[async_trait]
impl AnswerClient for ProviderAnswerClient {
    async fn generate(
        &self,
        question: &str,
        payload: &PromptPayload,
    ) -> Result<String, CollaboratorError> {
        let start = Instant::now();
        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user(self.render_prompt(question, payload)),
        ];
        let options = build_options(self.temperature, self.max_tokens);

        let mut last_err: Option<String> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Answer generation: retry {}/{} after {}ms",
                    attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "Answer: {} input tokens, {} output tokens, {:?}",
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(response.content);
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    warn!("Answer generation: attempt {} failed: {}", attempt + 1, err_msg);
                    last_err = Some(err_msg);
                }
            }
        }

        Err(CollaboratorError::Provider(
            last_err.unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, DocQaError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        DocQaError::InvalidConfig(format!(
            "provider '{provider_name}' is not configured: {e}\nCheck its API key environment variable."
        ))
    })
}

/// Resolve the chat provider, from most-specific to least-specific.
///
/// 1. **Named provider** (`provider_name`, with `model` or [`DEFAULT_MODEL`]).
/// 2. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when
///    both are set and non-empty.
/// 3. **OpenAI** when `OPENAI_API_KEY` is set, so users holding several keys
///    get a predictable default.
/// 4. **Auto-detection** via `ProviderFactory::from_env`.
pub fn resolve_provider(
    provider_name: Option<&str>,
    model: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, DocQaError> {
    if let Some(name) = provider_name.filter(|n| !n.is_empty()) {
        return create_provider(name, model.unwrap_or(DEFAULT_MODEL));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, model.unwrap_or(&env_model));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", model.unwrap_or(DEFAULT_MODEL));
        }
    }

    let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
        DocQaError::InvalidConfig(format!(
            "No LLM provider could be auto-detected from environment.\n\
             Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --provider.\n\
             Error: {e}"
        ))
    })?;
    Ok(llm_provider)
}
