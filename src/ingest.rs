//! Writing records into the per-modality indices.
//!
//! Parsing documents is someone else's job: callers hand over pre-chunked
//! [`RecordDraft`]s (one per text line or passage, table, or figure caption)
//! and this module embeds, names, and stores them.

use crate::embed::QueryEmbedders;
use crate::error::DocQaError;
use crate::index::IndexSet;
use crate::model::{Modality, Record, SourceRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// A record before it has an id or an embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub document: String,
    pub modality: Modality,
    pub content: String,
    /// Text to embed instead of `content`, e.g. a table plus its surrounding prose.
    #[serde(default)]
    pub embed_text: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RecordDraft {
    pub fn new(document: impl Into<String>, modality: Modality, content: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            modality,
            content: content.into(),
            embed_text: None,
            page: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    /// Embed `content` followed by `"\nContext: {context}"`; `content` is stored unchanged.
    pub fn with_context(mut self, context: &str) -> Self {
        if !context.trim().is_empty() {
            self.embed_text = Some(format!("{}\nContext: {}", self.content, context.trim()));
        }
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn text_to_embed(&self) -> &str {
        self.embed_text.as_deref().unwrap_or(&self.content)
    }
}

/// What [`ingest_records`] wrote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub written: BTreeMap<Modality, usize>,
    /// Drafts with blank content.
    pub skipped: usize,
    /// Ids in write order.
    pub ids: Vec<String>,
}

impl IngestReport {
    pub fn total(&self) -> usize {
        self.written.values().sum()
    }
}

/// Id of the `n`-th (0-based) record of `modality` in `document`.
pub fn record_id(document: &str, modality: Modality, n: usize) -> String {
    format!("{document}::{modality}::{n}")
}

/// Embed and upsert `drafts`, numbering records per document and modality
/// in input order.
///
/// Every draft's modality must have an index; that is checked before
/// anything is written. Each touched index is prepared once with
/// [`crate::index::VectorIndex::ensure_ready`]. Blank drafts are skipped but
/// do not consume a number, so re-ingesting the same input overwrites the
/// same ids.
pub async fn ingest_records(
    embedders: &QueryEmbedders,
    indices: &IndexSet,
    drafts: impl IntoIterator<Item = RecordDraft>,
) -> Result<IngestReport, DocQaError> {
    let drafts: Vec<RecordDraft> = drafts.into_iter().collect();

    let touched: BTreeSet<Modality> = drafts.iter().map(|d| d.modality).collect();
    for &modality in &touched {
        let index = indices.get(modality).ok_or_else(|| DocQaError::IndexUnavailable {
            modality,
            detail: "no index configured".into(),
        })?;
        index
            .ensure_ready()
            .await
            .map_err(|e| DocQaError::IndexUnavailable {
                modality,
                detail: e.to_string(),
            })?;
    }

    let mut report = IngestReport::default();
    let mut counters: BTreeMap<(String, Modality), usize> = BTreeMap::new();

    for draft in drafts {
        if draft.content.trim().is_empty() {
            report.skipped += 1;
            continue;
        }
        let modality = draft.modality;
        let slot = counters
            .entry((draft.document.clone(), modality))
            .or_default();
        let id = record_id(&draft.document, modality, *slot);
        *slot += 1;

        let embedding = embedders
            .for_modality(modality)
            .embed(draft.text_to_embed())
            .await
            .map_err(|e| DocQaError::Embedding {
                modality,
                detail: format!("{id}: {e}"),
            })?;

        let mut source_ref = SourceRef::new(&draft.document);
        source_ref.page = draft.page;
        let mut metadata = draft.metadata;
        metadata.insert("source".into(), draft.document.clone());
        if let Some(page) = draft.page {
            metadata.insert("page".into(), page.to_string());
        }
        let record = Record {
            id: id.clone(),
            modality,
            content: draft.content,
            source_ref,
            embedding,
            metadata,
        };

        // Presence checked above.
        if let Some(index) = indices.get(modality) {
            index
                .upsert(&record)
                .await
                .map_err(|e| DocQaError::IndexUnavailable {
                    modality,
                    detail: format!("{id}: {e}"),
                })?;
        }
        debug!("Wrote {}", id);
        *report.written.entry(modality).or_default() += 1;
        report.ids.push(id);
    }

    info!(
        "Ingested {} records ({} skipped)",
        report.total(),
        report.skipped
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::Embedder;
    use crate::error::CollaboratorError;
    use crate::index::{MemoryIndex, VectorIndex};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Records every text it is asked to embed.
    #[derive(Default)]
    struct RecordingEmbedder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Embedder for RecordingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
            self.seen.lock().unwrap().push(text.to_string());
            Ok(vec![text.len() as f32, 1.0])
        }
        fn model(&self) -> &str {
            "recording"
        }
    }

    #[tokio::test]
    async fn ids_are_numbered_per_document_and_modality() {
        let text = Arc::new(MemoryIndex::new(Modality::Text));
        let table = Arc::new(MemoryIndex::new(Modality::Table));
        let indices = IndexSet::new()
            .with(text.clone() as Arc<dyn VectorIndex>)
            .with(table.clone() as Arc<dyn VectorIndex>);
        let embedders = QueryEmbedders::shared(Arc::new(RecordingEmbedder::default()));

        let report = ingest_records(
            &embedders,
            &indices,
            vec![
                RecordDraft::new("a.pdf", Modality::Text, "first line").with_page(1),
                RecordDraft::new("a.pdf", Modality::Table, "| x |"),
                RecordDraft::new("a.pdf", Modality::Text, "   "),
                RecordDraft::new("a.pdf", Modality::Text, "second line"),
                RecordDraft::new("b.pdf", Modality::Text, "other doc"),
            ],
        )
        .await
        .unwrap();

        assert_eq!(
            report.ids,
            vec!["a.pdf::text::0", "a.pdf::table::0", "a.pdf::text::1", "b.pdf::text::0"]
        );
        assert_eq!(report.skipped, 1);
        assert_eq!(report.written[&Modality::Text], 3);
        assert_eq!(text.len(), 3);
        assert_eq!(table.len(), 1);

        let hits = text.search(&[10.0, 1.0], 3).await.unwrap();
        let first = hits.iter().find(|h| h.record.id == "a.pdf::text::0").unwrap();
        assert_eq!(first.record.metadata["page"], "1");
        assert_eq!(first.record.source_ref.to_string(), "a.pdf p.1");
    }

    #[tokio::test]
    async fn table_context_is_embedded_not_stored() {
        let table = Arc::new(MemoryIndex::new(Modality::Table));
        let embedder = Arc::new(RecordingEmbedder::default());
        let embedders = QueryEmbedders::shared(embedder.clone());
        let indices = IndexSet::new().with(table.clone() as Arc<dyn VectorIndex>);

        ingest_records(
            &embedders,
            &indices,
            vec![RecordDraft::new("a.pdf", Modality::Table, "| US | 5000 |")
                .with_context("Quarterly sales by region")],
        )
        .await
        .unwrap();

        assert_eq!(
            embedder.seen.lock().unwrap()[0],
            "| US | 5000 |\nContext: Quarterly sales by region"
        );
        let hits = table.search(&[1.0, 1.0], 1).await.unwrap();
        assert_eq!(hits[0].record.content, "| US | 5000 |");
    }

    #[tokio::test]
    async fn missing_index_fails_before_writing() {
        let text = Arc::new(MemoryIndex::new(Modality::Text));
        let indices = IndexSet::new().with(text.clone() as Arc<dyn VectorIndex>);
        let embedders = QueryEmbedders::shared(Arc::new(RecordingEmbedder::default()));

        let err = ingest_records(
            &embedders,
            &indices,
            vec![
                RecordDraft::new("a.pdf", Modality::Text, "line"),
                RecordDraft::new("a.pdf", Modality::Image, "a chart"),
            ],
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            DocQaError::IndexUnavailable {
                modality: Modality::Image,
                ..
            }
        ));
        assert!(text.is_empty());
    }
}
