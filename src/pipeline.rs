//! Question-answering entry points.
//!
//! ```text
//! question
//!  │
//!  ├─ 1. Embed     once per distinct embedder
//!  ├─ 2. Retrieve  concurrent k-NN per modality (partial failures tolerated)
//!  ├─ 3. Fuse      normalise, blend, round-robin under the token budget
//!  ├─ 4. Context   split into text / table / image sections
//!  └─ 5. Generate  grounded answer from the answer client
//! ```
//!
//! [`retrieve_context`] stops after step 4; [`ask`] runs all five. Both share
//! one deadline of [`QaConfig::request_timeout_secs`]: when it expires the
//! in-flight calls are dropped and [`DocQaError::Timeout`] names the stage
//! that was running.

use crate::answer::AnswerClient;
use crate::config::QaConfig;
use crate::context::{self, PromptPayload};
use crate::embed::QueryEmbedders;
use crate::error::{DocQaError, RetrievalError};
use crate::fusion;
use crate::index::IndexSet;
use crate::model::{FusedContext, Modality};
use crate::retrieve::Retriever;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{timeout_at, Duration, Instant as Deadline};
use tracing::{debug, info, warn};

/// The collaborators and configuration needed to answer questions.
///
/// Cheap to share behind an `Arc`; holds no per-request state.
#[derive(Clone)]
pub struct Pipeline {
    embedders: QueryEmbedders,
    retriever: Retriever,
    answer: Option<Arc<dyn AnswerClient>>,
    config: QaConfig,
}

impl Pipeline {
    pub fn new(
        embedders: QueryEmbedders,
        indices: IndexSet,
        answer: Arc<dyn AnswerClient>,
        config: QaConfig,
    ) -> Result<Self, DocQaError> {
        let mut pipeline = Self::retrieval_only(embedders, indices, config)?;
        pipeline.answer = Some(answer);
        Ok(pipeline)
    }

    /// A pipeline for [`retrieve_context`] only; [`ask`] on it fails with
    /// [`DocQaError::InvalidConfig`].
    pub fn retrieval_only(
        embedders: QueryEmbedders,
        indices: IndexSet,
        config: QaConfig,
    ) -> Result<Self, DocQaError> {
        config.fusion.validate()?;
        Ok(Self {
            embedders,
            retriever: Retriever::new(indices)?,
            answer: None,
            config,
        })
    }

    pub fn config(&self) -> &QaConfig {
        &self.config
    }
}

/// Timings and counts for one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QaStats {
    /// Hits returned per queried modality, before fusion.
    pub retrieved: BTreeMap<Modality, usize>,
    /// Records admitted per modality.
    pub admitted: BTreeMap<Modality, usize>,
    /// Estimated tokens of admitted content.
    pub context_tokens: usize,
    pub embed_duration_ms: u64,
    pub retrieval_duration_ms: u64,
    pub generation_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Retrieval result without generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOutcome {
    pub question: String,
    pub fused: FusedContext,
    pub payload: PromptPayload,
    /// Modalities that failed and contributed nothing.
    pub failures: Vec<RetrievalError>,
    pub stats: QaStats,
}

/// A grounded answer together with the evidence it was generated from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub question: String,
    pub text: String,
    pub payload: PromptPayload,
    pub fused: FusedContext,
    pub failures: Vec<RetrievalError>,
    pub stats: QaStats,
}

impl Answer {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

async fn within<T>(
    deadline: Deadline,
    secs: u64,
    stage: &'static str,
    fut: impl Future<Output = Result<T, DocQaError>>,
) -> Result<T, DocQaError> {
    timeout_at(deadline, fut)
        .await
        .map_err(|_| DocQaError::Timeout { stage, secs })?
}

fn deadline(config: &QaConfig) -> Deadline {
    Deadline::now() + Duration::from_secs(config.request_timeout_secs)
}

/// Retrieve, fuse, and structure context for `question` without generating.
pub async fn retrieve_context(
    question: &str,
    pipeline: &Pipeline,
) -> Result<ContextOutcome, DocQaError> {
    retrieve_until(question, pipeline, deadline(&pipeline.config)).await
}

async fn retrieve_until(
    question: &str,
    pipeline: &Pipeline,
    deadline: Deadline,
) -> Result<ContextOutcome, DocQaError> {
    let total_start = Instant::now();
    let config = &pipeline.config;
    let secs = config.request_timeout_secs;

    let question = question.trim();
    if question.is_empty() {
        return Err(DocQaError::InvalidInput("question is empty".into()));
    }
    info!("Answering: {}", question);

    // ── Step 1: Embed the question ───────────────────────────────────────
    let modalities = pipeline
        .retriever
        .queried_modalities(&config.fusion.modality_priority);
    let embed_start = Instant::now();
    let vectors = within(
        deadline,
        secs,
        "embedding",
        pipeline.embedders.embed_query(question, &modalities),
    )
    .await?;
    let embed_duration_ms = embed_start.elapsed().as_millis() as u64;

    // ── Step 2: Retrieve per modality ────────────────────────────────────
    let retrieval_start = Instant::now();
    let outcome = within(
        deadline,
        secs,
        "retrieval",
        pipeline
            .retriever
            .retrieve_all(&vectors, &modalities, config.per_modality_k),
    )
    .await?;
    let retrieval_duration_ms = retrieval_start.elapsed().as_millis() as u64;
    for failure in &outcome.failures {
        warn!("Continuing without {}: {}", failure.modality(), failure);
    }

    // ── Step 3: Fuse ─────────────────────────────────────────────────────
    let fused = fusion::fuse(&outcome.results, &config.fusion);

    // ── Step 4: Structure context ────────────────────────────────────────
    let payload = context::build(&fused)?;
    debug!(
        "Context: {} records, {} tokens",
        fused.len(),
        fused.total_tokens()
    );

    let stats = QaStats {
        retrieved: outcome
            .results
            .iter()
            .map(|(m, list)| (*m, list.len()))
            .collect(),
        admitted: fused.modality_counts().clone(),
        context_tokens: fused.total_tokens(),
        embed_duration_ms,
        retrieval_duration_ms,
        generation_duration_ms: 0,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };

    Ok(ContextOutcome {
        question: question.to_string(),
        fused,
        payload,
        failures: outcome.failures,
        stats,
    })
}

/// Answer `question` from the indexed documents.
///
/// # Errors
/// Returns `Err(DocQaError)` only for fatal errors:
/// - empty question
/// - embedding failure
/// - every queried modality failed
/// - generation failed after retries
/// - the request deadline expired
///
/// A modality that fails while others succeed is reported in
/// [`Answer::failures`] instead.
pub async fn ask(question: &str, pipeline: &Pipeline) -> Result<Answer, DocQaError> {
    let total_start = Instant::now();
    let answer = pipeline.answer.as_ref().ok_or_else(|| {
        DocQaError::InvalidConfig("pipeline was built without an answer client".into())
    })?;
    let deadline = deadline(&pipeline.config);
    let secs = pipeline.config.request_timeout_secs;

    let ctx = retrieve_until(question, pipeline, deadline).await?;
    if ctx.payload.is_empty() {
        info!("No context retrieved; the answer will say so");
    }

    // ── Step 5: Generate ─────────────────────────────────────────────────
    let generation_start = Instant::now();
    let text = within(deadline, secs, "generation", async {
        answer
            .generate(&ctx.question, &ctx.payload)
            .await
            .map_err(|e| DocQaError::Generation {
                retries: answer.max_retries(),
                detail: e.to_string(),
            })
    })
    .await?;

    let mut stats = ctx.stats;
    stats.generation_duration_ms = generation_start.elapsed().as_millis() as u64;
    stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

    info!(
        "Answered with {} context records ({} partial failures), {}ms total",
        ctx.fused.len(),
        ctx.failures.len(),
        stats.total_duration_ms
    );

    Ok(Answer {
        question: ctx.question,
        text,
        payload: ctx.payload,
        fused: ctx.fused,
        failures: ctx.failures,
        stats,
    })
}

/// Synchronous wrapper around [`ask`].
///
/// Creates a temporary tokio runtime internally; do not call from async code.
pub fn ask_sync(question: &str, pipeline: &Pipeline) -> Result<Answer, DocQaError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| DocQaError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(ask(question, pipeline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::Embedder;
    use crate::error::CollaboratorError;
    use crate::index::MemoryIndex;
    use crate::model::{Record, SourceRef};
    use async_trait::async_trait;

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _: &str) -> Result<Vec<f32>, CollaboratorError> {
            Ok(vec![1.0, 0.0])
        }
        fn model(&self) -> &str {
            "fixed"
        }
    }

    struct SlowAnswer;

    #[async_trait]
    impl AnswerClient for SlowAnswer {
        async fn generate(&self, _: &str, _: &PromptPayload) -> Result<String, CollaboratorError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    struct FailingAnswer;

    #[async_trait]
    impl AnswerClient for FailingAnswer {
        async fn generate(&self, _: &str, _: &PromptPayload) -> Result<String, CollaboratorError> {
            Err(CollaboratorError::Provider("model overloaded".into()))
        }
        fn max_retries(&self) -> u32 {
            2
        }
    }

    fn pipeline(answer: Arc<dyn AnswerClient>, timeout_secs: u64) -> Pipeline {
        let index = MemoryIndex::with_records(
            Modality::Text,
            vec![Record::new("a", Modality::Text, "alpha", SourceRef::new("d"))
                .with_embedding(vec![1.0, 0.0])],
        )
        .unwrap();
        Pipeline::new(
            QueryEmbedders::shared(Arc::new(FixedEmbedder)),
            IndexSet::new().with(Arc::new(index)),
            answer,
            QaConfig::builder()
                .request_timeout_secs(timeout_secs)
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let p = pipeline(Arc::new(FailingAnswer), 5);
        assert!(matches!(
            retrieve_context("   ", &p).await,
            Err(DocQaError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn generation_failure_carries_retries() {
        let p = pipeline(Arc::new(FailingAnswer), 5);
        match ask("what?", &p).await {
            Err(DocQaError::Generation { retries, detail }) => {
                assert_eq!(retries, 2);
                assert!(detail.contains("model overloaded"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_names_generation_stage() {
        let p = pipeline(Arc::new(SlowAnswer), 1);
        match ask("what?", &p).await {
            Err(DocQaError::Timeout { stage, secs }) => {
                assert_eq!(stage, "generation");
                assert_eq!(secs, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn retrieve_context_skips_generation() {
        let p = pipeline(Arc::new(FailingAnswer), 5);
        let ctx = retrieve_context("what?", &p).await.unwrap();
        assert_eq!(ctx.fused.ids(), vec!["a"]);
        assert_eq!(ctx.stats.retrieved[&Modality::Text], 1);
        assert_eq!(ctx.stats.admitted[&Modality::Table], 0);
        assert_eq!(ctx.payload.text_context[0].content, "alpha");
    }

    #[tokio::test]
    async fn retrieval_only_pipeline_cannot_answer() {
        let p = Pipeline::retrieval_only(
            QueryEmbedders::shared(Arc::new(FixedEmbedder)),
            IndexSet::new().with(Arc::new(MemoryIndex::new(Modality::Text))),
            QaConfig::default(),
        )
        .unwrap();
        assert!(retrieve_context("what?", &p).await.is_ok());
        assert!(matches!(ask("what?", &p).await, Err(DocQaError::InvalidConfig(_))));
    }

    #[test]
    fn invalid_fusion_config_is_rejected() {
        let mut config = QaConfig::default();
        config.fusion.modality_priority.clear();
        let result = Pipeline::new(
            QueryEmbedders::shared(Arc::new(FixedEmbedder)),
            IndexSet::new().with(Arc::new(MemoryIndex::new(Modality::Text))),
            Arc::new(FailingAnswer),
            config,
        );
        assert!(matches!(result, Err(DocQaError::InvalidConfig(_))));
    }
}
