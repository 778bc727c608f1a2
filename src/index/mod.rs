//! Vector index collaborators.
//!
//! One [`VectorIndex`] per modality. The retriever only ever calls
//! [`VectorIndex::search`]; [`VectorIndex::upsert`] exists for the
//! record-writing side in [`crate::ingest`].
//!
//! * [`opensearch`]: Amazon OpenSearch / OpenSearch Serverless k-NN over HTTP
//! * [`memory`]: brute-force cosine similarity, for tests and local runs

pub mod memory;
pub mod opensearch;

use crate::error::CollaboratorError;
use crate::model::{Modality, Record};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use memory::MemoryIndex;
pub use opensearch::{OpenSearchConfig, OpenSearchIndex};

/// A k-NN hit: the stored record and its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub record: Record,
    pub score: f32,
}

/// A per-modality vector collection.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// The modality this collection stores.
    fn modality(&self) -> Modality;

    /// Up to `k` nearest neighbours of `vector`, best first.
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, CollaboratorError>;

    /// Insert or replace `record` (keyed by its id).
    async fn upsert(&self, record: &Record) -> Result<(), CollaboratorError>;

    /// Create the backing collection if needed. Called once before writes.
    async fn ensure_ready(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// The indices a pipeline queries, keyed by modality.
#[derive(Clone, Default)]
pub struct IndexSet {
    indices: BTreeMap<Modality, Arc<dyn VectorIndex>>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `index` under its own modality, replacing any previous one.
    pub fn with(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.indices.insert(index.modality(), index);
        self
    }

    pub fn get(&self, modality: Modality) -> Option<&Arc<dyn VectorIndex>> {
        self.indices.get(&modality)
    }

    /// Modalities with a configured index, in enum order.
    pub fn modalities(&self) -> Vec<Modality> {
        self.indices.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}
