//! In-process vector index with exact cosine similarity.

use super::{IndexHit, VectorIndex};
use crate::error::CollaboratorError;
use crate::model::{Modality, Record};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::RwLock;

/// Brute-force index over an in-memory record list.
///
/// O(n) per query; meant for tests, fixtures, and small local corpora.
pub struct MemoryIndex {
    modality: Modality,
    records: RwLock<Vec<Record>>,
}

impl MemoryIndex {
    pub fn new(modality: Modality) -> Self {
        Self {
            modality,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Seed the index. Records of another modality are rejected.
    pub fn with_records(
        modality: Modality,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<Self, CollaboratorError> {
        let index = Self::new(modality);
        {
            let mut guard = index.write()?;
            for record in records {
                check_modality(modality, &record)?;
                upsert_into(&mut guard, record);
            }
        }
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<Record>>, CollaboratorError> {
        self.records
            .write()
            .map_err(|_| CollaboratorError::Provider("memory index lock poisoned".into()))
    }
}

fn check_modality(expected: Modality, record: &Record) -> Result<(), CollaboratorError> {
    if record.modality != expected {
        return Err(CollaboratorError::InvalidRequest(format!(
            "record '{}' is {}, index stores {}",
            record.id, record.modality, expected
        )));
    }
    Ok(())
}

fn upsert_into(records: &mut Vec<Record>, record: Record) {
    match records.iter_mut().find(|r| r.id == record.id) {
        Some(slot) => *slot = record,
        None => records.push(record),
    }
}

/// Cosine similarity; 0.0 for mismatched dimensions or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn modality(&self) -> Modality {
        self.modality
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, CollaboratorError> {
        let records = self
            .records
            .read()
            .map_err(|_| CollaboratorError::Provider("memory index lock poisoned".into()))?;

        let mut hits: Vec<IndexHit> = records
            .iter()
            .map(|r| IndexHit {
                score: cosine_similarity(vector, &r.embedding),
                record: r.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn upsert(&self, record: &Record) -> Result<(), CollaboratorError> {
        check_modality(self.modality, record)?;
        let mut guard = self.write()?;
        upsert_into(&mut guard, record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceRef;

    fn rec(id: &str, embedding: Vec<f32>) -> Record {
        Record::new(id, Modality::Text, id, SourceRef::new("doc")).with_embedding(embedding)
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn search_returns_best_first_truncated() {
        let index = MemoryIndex::with_records(
            Modality::Text,
            vec![
                rec("far", vec![0.0, 1.0]),
                rec("near", vec![1.0, 0.1]),
                rec("mid", vec![1.0, 1.0]),
            ],
        )
        .unwrap();
        let hits = index.search(&[1.0, 0.0], 2).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let index = MemoryIndex::new(Modality::Text);
        index.upsert(&rec("a", vec![1.0])).await.unwrap();
        index.upsert(&rec("a", vec![2.0])).await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn upsert_rejects_other_modality() {
        let index = MemoryIndex::new(Modality::Table);
        assert!(index.upsert(&rec("a", vec![1.0])).await.is_err());
    }
}
