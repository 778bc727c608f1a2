//! Per-modality k-NN retrieval.
//!
//! One call per modality, issued concurrently. A failing index costs the
//! answer that modality's evidence, not the answer itself: its error is
//! recorded as a [`RetrievalError`] and fusion sees an empty list. Only when
//! every queried modality fails does retrieval become fatal.

use crate::error::{DocQaError, RetrievalError};
use crate::index::IndexSet;
use crate::model::{Modality, ScoredRecord};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of querying every configured modality for one question.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    /// Ranked hits per modality. Failed modalities map to an empty list.
    pub results: BTreeMap<Modality, Vec<ScoredRecord>>,
    /// Modalities whose index failed, in query order.
    pub failures: Vec<RetrievalError>,
}

impl RetrievalOutcome {
    pub fn hit_count(&self) -> usize {
        self.results.values().map(Vec::len).sum()
    }
}

/// Queries the per-modality indices of an [`IndexSet`].
#[derive(Clone)]
pub struct Retriever {
    indices: IndexSet,
}

impl Retriever {
    /// Fails with [`DocQaError::InvalidConfig`] when no modality has an index.
    pub fn new(indices: IndexSet) -> Result<Self, DocQaError> {
        if indices.is_empty() {
            return Err(DocQaError::InvalidConfig(
                "no vector index configured for any modality".into(),
            ));
        }
        Ok(Self { indices })
    }

    pub fn indices(&self) -> &IndexSet {
        &self.indices
    }

    /// Modalities from `priority` that have an index, in priority order,
    /// followed by any other indexed modality.
    pub fn queried_modalities(&self, priority: &[Modality]) -> Vec<Modality> {
        let available = self.indices.modalities();
        let mut order: Vec<Modality> = priority
            .iter()
            .copied()
            .filter(|m| available.contains(m))
            .collect();
        for m in available {
            if !order.contains(&m) {
                order.push(m);
            }
        }
        order
    }

    /// Top-`k` records for one modality, best first, ranks 1-based.
    ///
    /// Hits whose record claims another modality are dropped before ranking.
    pub async fn retrieve(
        &self,
        query_vector: &[f32],
        modality: Modality,
        k: usize,
    ) -> Result<Vec<ScoredRecord>, RetrievalError> {
        let index = self
            .indices
            .get(modality)
            .ok_or_else(|| RetrievalError::Partial {
                modality,
                detail: "no index configured".into(),
            })?;

        let hits = index
            .search(query_vector, k)
            .await
            .map_err(|e| RetrievalError::Partial {
                modality,
                detail: e.to_string(),
            })?;

        let mut hits: Vec<_> = hits
            .into_iter()
            .filter(|h| {
                let ok = h.record.modality == modality;
                if !ok {
                    warn!(
                        "{} index returned record '{}' tagged {}; dropped",
                        modality, h.record.id, h.record.modality
                    );
                }
                ok
            })
            .collect();
        // Stable: equal scores keep the index's order.
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(k);

        Ok(hits
            .into_iter()
            .enumerate()
            .map(|(i, h)| ScoredRecord {
                record: h.record,
                score: h.score,
                rank: i + 1,
            })
            .collect())
    }

    /// Query every modality in `vectors` concurrently.
    ///
    /// Returns [`DocQaError::TotalRetrievalFailure`] only when every queried
    /// modality failed.
    pub async fn retrieve_all(
        &self,
        vectors: &BTreeMap<Modality, Arc<Vec<f32>>>,
        order: &[Modality],
        k: usize,
    ) -> Result<RetrievalOutcome, DocQaError> {
        let queried: Vec<Modality> = order
            .iter()
            .copied()
            .filter(|m| vectors.contains_key(m) && self.indices.get(*m).is_some())
            .collect();
        if queried.is_empty() {
            return Err(DocQaError::InvalidConfig(
                "none of the requested modalities has an index".into(),
            ));
        }

        let calls = queried.iter().map(|&m| async move {
            let vector = vectors.get(&m).map(|v| v.as_slice()).unwrap_or(&[]);
            (m, self.retrieve(vector, m, k).await)
        });
        let settled = join_all(calls).await;

        let mut outcome = RetrievalOutcome::default();
        for (modality, result) in settled {
            match result {
                Ok(list) => {
                    debug!("{}: {} hits", modality, list.len());
                    outcome.results.insert(modality, list);
                }
                Err(e) => {
                    warn!("{}", e);
                    outcome.results.insert(modality, Vec::new());
                    outcome.failures.push(e);
                }
            }
        }

        if outcome.failures.len() == queried.len() {
            return Err(DocQaError::TotalRetrievalFailure {
                failures: outcome.failures,
            });
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use crate::index::{IndexHit, MemoryIndex, VectorIndex};
    use crate::model::{Record, SourceRef};
    use async_trait::async_trait;

    struct FailingIndex(Modality);

    #[async_trait]
    impl VectorIndex for FailingIndex {
        fn modality(&self) -> Modality {
            self.0
        }
        async fn search(&self, _: &[f32], _: usize) -> Result<Vec<IndexHit>, CollaboratorError> {
            Err(CollaboratorError::Status {
                status: 503,
                body: "unavailable".into(),
            })
        }
        async fn upsert(&self, _: &Record) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    /// Returns fixed hits regardless of the query, unsorted.
    struct FixedIndex(Modality, Vec<IndexHit>);

    #[async_trait]
    impl VectorIndex for FixedIndex {
        fn modality(&self) -> Modality {
            self.0
        }
        async fn search(&self, _: &[f32], _: usize) -> Result<Vec<IndexHit>, CollaboratorError> {
            Ok(self.1.clone())
        }
        async fn upsert(&self, _: &Record) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    fn hit(id: &str, modality: Modality, score: f32) -> IndexHit {
        IndexHit {
            record: Record::new(id, modality, id, SourceRef::new("doc")),
            score,
        }
    }

    fn text_index() -> Arc<dyn VectorIndex> {
        Arc::new(
            MemoryIndex::with_records(
                Modality::Text,
                vec![
                    Record::new("t1", Modality::Text, "a", SourceRef::new("d"))
                        .with_embedding(vec![1.0, 0.0]),
                    Record::new("t2", Modality::Text, "b", SourceRef::new("d"))
                        .with_embedding(vec![0.5, 0.5]),
                ],
            )
            .unwrap(),
        )
    }

    fn vectors(modalities: &[Modality]) -> BTreeMap<Modality, Arc<Vec<f32>>> {
        let v = Arc::new(vec![1.0, 0.0]);
        modalities.iter().map(|m| (*m, Arc::clone(&v))).collect()
    }

    #[test]
    fn empty_index_set_is_invalid() {
        assert!(matches!(
            Retriever::new(IndexSet::new()),
            Err(DocQaError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn retrieve_sorts_ranks_and_truncates() {
        let index = FixedIndex(
            Modality::Table,
            vec![
                hit("low", Modality::Table, 0.1),
                hit("high", Modality::Table, 0.9),
                hit("mid", Modality::Table, 0.5),
            ],
        );
        let retriever = Retriever::new(IndexSet::new().with(Arc::new(index))).unwrap();
        let list = retriever.retrieve(&[0.0], Modality::Table, 2).await.unwrap();
        let ids: Vec<(&str, usize)> = list.iter().map(|s| (s.record.id.as_str(), s.rank)).collect();
        assert_eq!(ids, vec![("high", 1), ("mid", 2)]);
        assert_eq!(list[0].score, 0.9);
    }

    #[tokio::test]
    async fn retrieve_drops_mislabelled_hits() {
        let index = FixedIndex(
            Modality::Table,
            vec![hit("t", Modality::Text, 0.9), hit("ok", Modality::Table, 0.2)],
        );
        let retriever = Retriever::new(IndexSet::new().with(Arc::new(index))).unwrap();
        let list = retriever.retrieve(&[0.0], Modality::Table, 5).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].record.id, "ok");
        assert_eq!(list[0].rank, 1);
    }

    #[tokio::test]
    async fn partial_failure_keeps_other_modalities() {
        let set = IndexSet::new()
            .with(text_index())
            .with(Arc::new(FailingIndex(Modality::Table)));
        let retriever = Retriever::new(set).unwrap();
        let order = [Modality::Text, Modality::Table];
        let outcome = retriever
            .retrieve_all(&vectors(&order), &order, 5)
            .await
            .unwrap();

        assert_eq!(outcome.results[&Modality::Text].len(), 2);
        assert!(outcome.results[&Modality::Table].is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].modality(), Modality::Table);
        assert_eq!(outcome.hit_count(), 2);
    }

    #[tokio::test]
    async fn all_failing_is_fatal() {
        let set = IndexSet::new()
            .with(Arc::new(FailingIndex(Modality::Text)))
            .with(Arc::new(FailingIndex(Modality::Image)));
        let retriever = Retriever::new(set).unwrap();
        let order = [Modality::Text, Modality::Image];
        let err = retriever
            .retrieve_all(&vectors(&order), &order, 5)
            .await
            .unwrap_err();
        match err {
            DocQaError::TotalRetrievalFailure { failures } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn modalities_without_index_are_skipped() {
        let retriever = Retriever::new(IndexSet::new().with(text_index())).unwrap();
        let order = Modality::ALL;
        let outcome = retriever
            .retrieve_all(&vectors(&order), &order, 1)
            .await
            .unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.results[&Modality::Text][0].record.id, "t1");
    }

    #[test]
    fn queried_modalities_follow_priority_then_rest() {
        let set = IndexSet::new()
            .with(text_index())
            .with(Arc::new(FailingIndex(Modality::Image)));
        let retriever = Retriever::new(set).unwrap();
        assert_eq!(
            retriever.queried_modalities(&[Modality::Image]),
            vec![Modality::Image, Modality::Text]
        );
    }
}
