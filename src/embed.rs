//! Query embedding: the "text → vector" collaborator and its implementations.
//!
//! Modalities may live in different embedding spaces (a table index built
//! with a table-aware model, captions embedded with a multimodal model). The
//! [`QueryEmbedders`] set maps each modality to the embedder that produced
//! its index and calls every distinct embedder exactly once per question.

use crate::error::{CollaboratorError, DocQaError};
use crate::model::Modality;
use async_trait::async_trait;
use edgequake_llm::EmbeddingProvider;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Converts text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single, non-empty string.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError>;

    /// Model identifier, for logs.
    fn model(&self) -> &str;
}

// ── Per-modality embedder set ────────────────────────────────────────────

/// The embedders used to vectorise a question, one per modality.
#[derive(Clone)]
pub struct QueryEmbedders {
    default: Arc<dyn Embedder>,
    overrides: BTreeMap<Modality, Arc<dyn Embedder>>,
}

impl QueryEmbedders {
    /// Every modality shares `embedder`.
    pub fn shared(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            default: embedder,
            overrides: BTreeMap::new(),
        }
    }

    /// Use a dedicated embedder for one modality.
    pub fn with_override(mut self, modality: Modality, embedder: Arc<dyn Embedder>) -> Self {
        self.overrides.insert(modality, embedder);
        self
    }

    pub fn for_modality(&self, modality: Modality) -> &Arc<dyn Embedder> {
        self.overrides.get(&modality).unwrap_or(&self.default)
    }

    /// Embed `text` once per distinct embedder among `modalities`.
    ///
    /// Modalities sharing an embedder share the resulting vector.
    pub async fn embed_query(
        &self,
        text: &str,
        modalities: &[Modality],
    ) -> Result<BTreeMap<Modality, Arc<Vec<f32>>>, DocQaError> {
        if text.trim().is_empty() {
            return Err(DocQaError::InvalidInput("question is empty".into()));
        }

        let mut done: Vec<(Arc<dyn Embedder>, Arc<Vec<f32>>)> = Vec::new();
        let mut out = BTreeMap::new();

        for &modality in modalities {
            let embedder = self.for_modality(modality);
            if let Some((_, vector)) = done.iter().find(|(e, _)| Arc::ptr_eq(e, embedder)) {
                out.insert(modality, Arc::clone(vector));
                continue;
            }

            let vector = embedder
                .embed(text)
                .await
                .map_err(|e| DocQaError::Embedding {
                    modality,
                    detail: e.to_string(),
                })?;
            debug!(
                "Embedded {} query with {} ({} dims)",
                modality,
                embedder.model(),
                vector.len()
            );
            let vector = Arc::new(vector);
            done.push((Arc::clone(embedder), Arc::clone(&vector)));
            out.insert(modality, vector);
        }

        Ok(out)
    }
}

// ── edgequake-llm provider ───────────────────────────────────────────────

/// Adapter over an `edgequake_llm` embedding provider (OpenAI, Gemini,
/// Ollama, ... as auto-detected by `ProviderFactory::from_env`).
pub struct ProviderEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        if text.is_empty() {
            return Err(CollaboratorError::InvalidRequest("cannot embed empty text".into()));
        }
        let mut vectors = self
            .provider
            .embed(&[text.to_string()])
            .await
            .map_err(|e| CollaboratorError::Provider(e.to_string()))?;
        vectors
            .pop()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CollaboratorError::Decode("provider returned no embedding".into()))
    }

    fn model(&self) -> &str {
        self.provider.model()
    }
}

// ── OpenAI-compatible HTTP embedder ──────────────────────────────────────

/// Async client for any OpenAI-compatible `/embeddings` endpoint.
#[derive(Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl HttpEmbedder {
    /// Build a client for `{base_url}/embeddings`.
    pub fn new(
        api_key: Option<&str>,
        base_url: &str,
        model: impl Into<String>,
        dimensions: Option<usize>,
        timeout: Duration,
    ) -> Result<Self, DocQaError> {
        let model = model.into();
        if model.trim().is_empty() {
            return Err(DocQaError::InvalidConfig("embedding model name is empty".into()));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(DocQaError::InvalidConfig(format!(
                "embedding endpoint must be an http(s) URL, got '{base_url}'"
            )));
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.map(str::trim).filter(|k| !k.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| DocQaError::InvalidConfig("invalid embedding API key".into()))?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| DocQaError::Internal(format!("failed to build embedding client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model,
            dimensions,
            max_retries: 3,
            retry_backoff_ms: 500,
        })
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    async fn request_once(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: [text],
            dimensions: self.dimensions,
        };
        let resp = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(CollaboratorError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| CollaboratorError::Decode(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .min_by_key(|d| d.index)
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CollaboratorError::Decode("response contained no embedding".into()))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        if text.is_empty() {
            return Err(CollaboratorError::InvalidRequest("cannot embed empty text".into()));
        }

        let mut attempt = 0u32;
        loop {
            match self.request_once(text).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                    warn!(
                        "Embedding retry {}/{} after {}ms: {}",
                        attempt, self.max_retries, backoff, e
                    );
                    sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}
