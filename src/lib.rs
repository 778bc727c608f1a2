//! # edgequake-docqa
//!
//! Answer questions over PDF collections whose text, tables, and figures
//! live in separate vector indices.
//!
//! ## Why this crate?
//!
//! Similarity scores from a text index, a table index, and an image-caption
//! index are not comparable: one might peak at 0.92 while another never
//! exceeds 0.55. Sorting everything by raw score lets one modality crowd out
//! the others, and a numeric question answered from prose instead of the
//! table that holds the figure is a bad answer. This crate normalises each
//! modality's scores, blends them with rank, and interleaves modalities
//! round-robin under a token budget so every kind of evidence gets a seat.
//!
//! ## Pipeline Overview
//!
//! ```text
//! question
//!  │
//!  ├─ 1. Embed     query vector(s), one call per distinct embedder
//!  ├─ 2. Retrieve  concurrent k-NN on text / table / image indices
//!  ├─ 3. Fuse      min-max + rank blend, round-robin, budget, dedup
//!  ├─ 4. Context   [TEXT] / [TABLE] / [IMAGE] sections with sources
//!  └─ 5. Generate  grounded answer via edgequake-llm
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docqa::{
//!     ask, resolve_provider, OpenSearchConfig, OpenSearchIndex, Pipeline,
//!     ProviderAnswerClient, ProviderEmbedder, QaConfig, QueryEmbedders,
//! };
//! use edgequake_llm::ProviderFactory;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = QaConfig::default();
//!     let (_, embedding) = ProviderFactory::from_env()?;
//!     let pipeline = Pipeline::new(
//!         QueryEmbedders::shared(Arc::new(ProviderEmbedder::new(embedding))),
//!         OpenSearchIndex::connect(&OpenSearchConfig::default())?,
//!         Arc::new(ProviderAnswerClient::new(resolve_provider(None, None)?, &config)),
//!         config,
//!     )?;
//!     let answer = ask("What were Q3 sales in the US?", &pipeline).await?;
//!     println!("{}", answer.text);
//!     for failure in &answer.failures {
//!         eprintln!("partial: {failure}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docqa` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-docqa = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod answer;
pub mod config;
pub mod context;
pub mod embed;
pub mod error;
pub mod fusion;
pub mod index;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod prompts;
pub mod retrieve;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use answer::{resolve_provider, AnswerClient, ProviderAnswerClient};
pub use config::{FusionConfig, QaConfig, QaConfigBuilder, TokenEstimator};
pub use context::{ContextEntry, PromptPayload};
pub use embed::{Embedder, HttpEmbedder, ProviderEmbedder, QueryEmbedders};
pub use error::{CollaboratorError, DocQaError, RetrievalError};
pub use fusion::fuse;
pub use index::{IndexHit, IndexSet, MemoryIndex, OpenSearchConfig, OpenSearchIndex, VectorIndex};
pub use ingest::{ingest_records, IngestReport, RecordDraft};
pub use model::{FusedContext, Modality, Record, RecordKey, ScoredRecord, SourceRef};
pub use pipeline::{ask, ask_sync, retrieve_context, Answer, ContextOutcome, Pipeline, QaStats};
pub use retrieve::{RetrievalOutcome, Retriever};
