//! Error types for the edgequake-docqa library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`DocQaError`] (**fatal**): the question cannot be answered at all
//!   (every index down, embedding service refused, generation failed).
//!   Returned as `Err(DocQaError)` from the top-level `ask*` functions.
//!
//! * [`RetrievalError`] (**non-fatal**): one modality's index failed but the
//!   others answered. Stored in [`crate::retrieve::RetrievalOutcome`] and in
//!   the final [`crate::pipeline::Answer`] so callers can see which modalities
//!   were missing from the context.
//!
//! * [`CollaboratorError`]: what an [`crate::embed::Embedder`],
//!   [`crate::index::VectorIndex`], or [`crate::answer::AnswerClient`]
//!   implementation reports. The pipeline wraps it with stage and modality
//!   before it reaches the caller.

use crate::model::Modality;
use thiserror::Error;

/// All fatal errors returned by the edgequake-docqa library.
#[derive(Debug, Error)]
pub enum DocQaError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The question (or a record draft) is unusable as given.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ── Retrieval errors ──────────────────────────────────────────────────
    /// Every queried modality failed; there is nothing to ground an answer on.
    #[error(
        "All {} queried modalities failed during retrieval.\nFirst error: {}",
        .failures.len(),
        first_failure(.failures)
    )]
    TotalRetrievalFailure { failures: Vec<RetrievalError> },

    /// The embedding service rejected the query text.
    #[error("Embedding failed for {modality} query: {detail}\nCheck the embedding endpoint, model id, and quota.")]
    Embedding { modality: Modality, detail: String },

    /// A modality's vector index could not be created, written, or reached
    /// outside of a query (administration paths, ingestion).
    #[error("Vector index for {modality} is unavailable: {detail}")]
    IndexUnavailable { modality: Modality, detail: String },

    // ── Context errors ────────────────────────────────────────────────────
    /// A fused context violated its own invariants. Indicates a bug or a
    /// corrupted cached context.
    #[error("Malformed fused context: {detail}")]
    MalformedContext { detail: String },

    // ── Generation errors ─────────────────────────────────────────────────
    /// The answer model failed after all retries.
    #[error("Answer generation failed after {retries} retries: {detail}")]
    Generation { retries: u32, detail: String },

    /// The request deadline expired; in-flight calls were abandoned.
    #[error("Request timed out after {secs}s during {stage}\nIncrease --timeout.")]
    Timeout { stage: &'static str, secs: u64 },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn first_failure(failures: &[RetrievalError]) -> String {
    failures
        .first()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// A non-fatal retrieval error for a single modality.
///
/// The modality contributes an empty list to fusion; the answer is still
/// produced from the remaining modalities.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum RetrievalError {
    /// The modality's index was unreachable or returned an error.
    #[error("{modality} retrieval failed: {detail}")]
    Partial { modality: Modality, detail: String },
}

impl RetrievalError {
    pub fn modality(&self) -> Modality {
        match self {
            RetrievalError::Partial { modality, .. } => *modality,
        }
    }
}

/// Failure reported by an external collaborator implementation.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The service answered, but not with the expected payload.
    #[error("unexpected response payload: {0}")]
    Decode(String),

    /// An LLM/embedding provider returned an error.
    #[error("provider error: {0}")]
    Provider(String),

    /// The request is invalid before it is sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl CollaboratorError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CollaboratorError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            CollaboratorError::Status { status, .. } => *status == 429 || *status >= 500,
            CollaboratorError::Provider(_) => true,
            CollaboratorError::Decode(_) | CollaboratorError::InvalidRequest(_) => false,
        }
    }
}
