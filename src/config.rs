//! Configuration types for question answering.
//!
//! Everything that tunes a request lives in [`QaConfig`], built through
//! [`QaConfigBuilder`]. The fusion knobs are grouped in [`FusionConfig`]
//! because [`crate::fusion::fuse`] is a pure function that needs nothing
//! else.
//!
//! Collaborators (embedders, indices, answer client) are not configuration;
//! they are wired into a [`crate::pipeline::Pipeline`].

use crate::error::DocQaError;
use crate::model::Modality;
use crate::prompts::{CONTEXT_PLACEHOLDER, QUESTION_PLACEHOLDER};
use serde::{Deserialize, Serialize};

/// Configuration for a question-answering request.
///
/// # Example
/// ```rust
/// use edgequake_docqa::{Modality, QaConfig};
///
/// let config = QaConfig::builder()
///     .alpha(0.6)
///     .token_budget(1500)
///     .per_modality_k(8)
///     .modality_priority(vec![Modality::Table, Modality::Text, Modality::Image])
///     .build()
///     .unwrap();
/// assert_eq!(config.fusion.token_budget, 1500);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaConfig {
    /// Fusion and ranking knobs.
    pub fusion: FusionConfig,

    /// Number of neighbours requested from each modality's index. Default: 5.
    pub per_modality_k: usize,

    /// Characters of a text record kept when rendering the prompt. Default: 1200.
    ///
    /// Tables and captions are never truncated; a half table is worse than none.
    pub max_text_chars: usize,

    /// Deadline for the whole request (embedding, retrieval, generation) in seconds. Default: 60.
    pub request_timeout_secs: u64,

    /// Custom prompt template. Must contain `{{CONTEXT}}` and `{{QUESTION}}`.
    /// If None, uses [`crate::prompts::DEFAULT_PROMPT_TEMPLATE`].
    pub prompt_template: Option<String>,

    /// Sampling temperature for the answer model. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the answer model may generate. Default: 1200.
    pub max_tokens: usize,

    /// Retries on a transient generation failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            fusion: FusionConfig::default(),
            per_modality_k: 5,
            max_text_chars: 1200,
            request_timeout_secs: 60,
            prompt_template: None,
            temperature: 0.1,
            max_tokens: 1200,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl QaConfig {
    /// Create a new builder for `QaConfig`.
    pub fn builder() -> QaConfigBuilder {
        QaConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`QaConfig`].
#[derive(Debug)]
pub struct QaConfigBuilder {
    config: QaConfig,
}

impl QaConfigBuilder {
    pub fn alpha(mut self, alpha: f32) -> Self {
        self.config.fusion.alpha = alpha.clamp(0.0, 1.0);
        self
    }

    pub fn modality_priority(mut self, order: Vec<Modality>) -> Self {
        self.config.fusion.modality_priority = order;
        self
    }

    pub fn token_budget(mut self, budget: usize) -> Self {
        self.config.fusion.token_budget = budget;
        self
    }

    pub fn token_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.config.fusion.estimator = estimator;
        self
    }

    pub fn per_modality_k(mut self, k: usize) -> Self {
        self.config.per_modality_k = k.max(1);
        self
    }

    pub fn max_text_chars(mut self, n: usize) -> Self {
        self.config.max_text_chars = n;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs.max(1);
        self
    }

    pub fn prompt_template(mut self, template: impl Into<String>) -> Self {
        self.config.prompt_template = Some(template.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
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

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<QaConfig, DocQaError> {
        let c = &self.config;
        c.fusion.validate()?;
        if c.per_modality_k == 0 {
            return Err(DocQaError::InvalidConfig(
                "per_modality_k must be ≥ 1".into(),
            ));
        }
        if let Some(ref template) = c.prompt_template {
            validate_template(template)?;
        }
        Ok(self.config)
    }
}

/// Reject a prompt template that would silently drop the context or question.
pub fn validate_template(template: &str) -> Result<(), DocQaError> {
    for placeholder in [CONTEXT_PLACEHOLDER, QUESTION_PLACEHOLDER] {
        if !template.contains(placeholder) {
            return Err(DocQaError::InvalidConfig(format!(
                "prompt template is missing the {placeholder} placeholder"
            )));
        }
    }
    Ok(())
}

// ── Fusion ───────────────────────────────────────────────────────────────

/// Knobs consumed by [`crate::fusion::fuse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Weight of the normalised similarity against the rank position. Default: 0.7.
    ///
    /// `1.0` ranks purely by normalised score, `0.0` purely by the index's
    /// own ordering. The rank term damps min-max artefacts such as a
    /// single-result list normalising to 1.0 however weak the match.
    pub alpha: f32,

    /// Order in which the round-robin visits modalities. Default: text, table, image.
    pub modality_priority: Vec<Modality>,

    /// Upper bound on the estimated tokens of the fused context. Default: 2000.
    pub token_budget: usize,

    /// How record length is converted to tokens.
    pub estimator: TokenEstimator,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            modality_priority: Modality::ALL.to_vec(),
            token_budget: 2000,
            estimator: TokenEstimator::default(),
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), DocQaError> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(DocQaError::InvalidConfig(format!(
                "alpha must be within 0.0–1.0, got {}",
                self.alpha
            )));
        }
        if self.modality_priority.is_empty() {
            return Err(DocQaError::InvalidConfig(
                "modality priority order must name at least one modality".into(),
            ));
        }
        for (i, m) in self.modality_priority.iter().enumerate() {
            if self.modality_priority[..i].contains(m) {
                return Err(DocQaError::InvalidConfig(format!(
                    "modality '{m}' appears twice in the priority order"
                )));
            }
        }
        self.estimator.validate()
    }
}

/// Length heuristic used for budget accounting.
///
/// Exact tokenisation depends on the answer model and is not worth a
/// tokenizer dependency for a budget that is itself an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenEstimator {
    /// `ceil(whitespace-separated words × multiplier)`. Default multiplier: 1.3.
    Words { multiplier: f32 },
    /// `ceil(chars / chars_per_token)`.
    Chars { chars_per_token: f32 },
}

impl Default for TokenEstimator {
    fn default() -> Self {
        TokenEstimator::Words { multiplier: 1.3 }
    }
}

impl TokenEstimator {
    pub fn estimate(&self, text: &str) -> usize {
        let raw = match *self {
            TokenEstimator::Words { multiplier } => {
                text.split_whitespace().count() as f32 * multiplier
            }
            TokenEstimator::Chars { chars_per_token } => {
                text.chars().count() as f32 / chars_per_token
            }
        };
        raw.ceil() as usize
    }

    fn validate(&self) -> Result<(), DocQaError> {
        let factor = match *self {
            TokenEstimator::Words { multiplier } => multiplier,
            TokenEstimator::Chars { chars_per_token } => chars_per_token,
        };
        if !(factor.is_finite() && factor > 0.0) {
            return Err(DocQaError::InvalidConfig(format!(
                "token estimator factor must be positive, got {factor}"
            )));
        }
        Ok(())
    }
}

/// Parse a comma-separated modality list such as `"table,text,image"`.
pub fn parse_modality_list(s: &str) -> Result<Vec<Modality>, DocQaError> {
    s.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.parse::<Modality>().map_err(DocQaError::InvalidConfig))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = QaConfig::default();
        assert_eq!(c.fusion.alpha, 0.7);
        assert_eq!(c.fusion.token_budget, 2000);
        assert_eq!(c.per_modality_k, 5);
        assert_eq!(c.fusion.modality_priority, Modality::ALL.to_vec());
    }

    #[test]
    fn builder_clamps_alpha() {
        let c = QaConfig::builder().alpha(3.0).build().unwrap();
        assert_eq!(c.fusion.alpha, 1.0);
    }

    #[test]
    fn duplicate_priority_rejected() {
        let err = QaConfig::builder()
            .modality_priority(vec![Modality::Text, Modality::Text])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("twice"), "got: {err}");
    }

    #[test]
    fn empty_priority_rejected() {
        assert!(QaConfig::builder()
            .modality_priority(vec![])
            .build()
            .is_err());
    }

    #[test]
    fn template_without_question_rejected() {
        let err = QaConfig::builder()
            .prompt_template("Context: {{CONTEXT}}")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("{{QUESTION}}"), "got: {err}");
    }

    #[test]
    fn word_estimator_rounds_up() {
        let est = TokenEstimator::default();
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.estimate("one"), 2);
        assert_eq!(est.estimate("one two three four five six seven eight nine ten"), 13);
    }

    #[test]
    fn char_estimator() {
        let est = TokenEstimator::Chars { chars_per_token: 4.0 };
        assert_eq!(est.estimate("abcdefgh"), 2);
        assert_eq!(est.estimate("abcdefghi"), 3);
    }

    #[test]
    fn zero_multiplier_rejected() {
        let err = QaConfig::builder()
            .token_estimator(TokenEstimator::Words { multiplier: 0.0 })
            .build()
            .unwrap_err();
        assert!(matches!(err, DocQaError::InvalidConfig(_)));
    }

    #[test]
    fn parse_modality_list_accepts_spaces() {
        assert_eq!(
            parse_modality_list("table, text ,image").unwrap(),
            vec![Modality::Table, Modality::Text, Modality::Image]
        );
        assert!(parse_modality_list("text,audio").is_err());
    }
}
