//! Retrievable records and the request-scoped types built from them.
//!
//! A [`Record`] is created at ingestion time and lives in a modality's vector
//! index until the document is re-ingested. Everything else in this module
//! ([`ScoredRecord`], [`FusedContext`]) exists only for the duration of one
//! question.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The three kinds of content a document is split into.
///
/// Closed on purpose: every `match` over a modality is exhaustive, so adding
/// a fourth kind forces every consumer (fusion, context building, CLI) to be
/// revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Table,
    Image,
}

impl Modality {
    /// All modalities in their default priority order.
    pub const ALL: [Modality; 3] = [Modality::Text, Modality::Table, Modality::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Table => "table",
            Modality::Image => "image",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Modality::Text),
            "table" => Ok(Modality::Table),
            "image" | "figure" => Ok(Modality::Image),
            other => Err(format!(
                "unknown modality '{other}' (expected text, table, or image)"
            )),
        }
    }
}

/// Where a record came from inside the source corpus.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceRef {
    /// Document identifier, e.g. the S3 key of the PDF.
    pub document: String,
    /// 1-indexed page number, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Free-form location within the page (bounding box, figure number, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl SourceRef {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            page: None,
            location: None,
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.page {
            Some(page) => write!(f, "{} p.{}", self.document, page)?,
            None => f.write_str(&self.document)?,
        }
        if let Some(ref loc) = self.location {
            write!(f, " [{loc}]")?;
        }
        Ok(())
    }
}

/// One retrievable unit: a text passage, a serialised table, or an image caption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique within its modality.
    pub id: String,
    pub modality: Modality,
    /// Raw text, Markdown table, or caption.
    pub content: String,
    pub source_ref: SourceRef,
    /// Dimension is fixed per modality but may differ between modalities.
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Record {
    pub fn new(
        id: impl Into<String>,
        modality: Modality,
        content: impl Into<String>,
        source_ref: SourceRef,
    ) -> Self {
        Self {
            id: id.into(),
            modality,
            content: content.into(),
            source_ref,
            embedding: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Stable identity across the whole corpus.
    pub fn key(&self) -> RecordKey {
        RecordKey {
            modality: self.modality,
            id: self.id.clone(),
        }
    }
}

/// `(modality, id)`: two records with the same key are the same record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub modality: Modality,
    pub id: String,
}

/// A record as returned by one modality's k-NN query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: Record,
    /// Raw similarity reported by the index. Only comparable within a modality.
    pub score: f32,
    /// 1-based position in the modality's result list, before fusion.
    pub rank: usize,
}

impl ScoredRecord {
    pub fn modality(&self) -> Modality {
        self.record.modality
    }
}

/// The fused, budget-bounded context for one question.
///
/// Built only by [`crate::fusion::fuse`]; read-only afterwards. Records are
/// kept in admission order, which interleaves modalities rather than sorting
/// by relevance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedContext {
    records: Vec<ScoredRecord>,
    total_tokens: usize,
    modality_counts: BTreeMap<Modality, usize>,
}

impl FusedContext {
    pub(crate) fn new(records: Vec<ScoredRecord>, total_tokens: usize) -> Self {
        let mut modality_counts: BTreeMap<Modality, usize> =
            Modality::ALL.iter().map(|m| (*m, 0)).collect();
        for r in &records {
            *modality_counts.entry(r.modality()).or_default() += 1;
        }
        Self {
            records,
            total_tokens,
            modality_counts,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), 0)
    }

    pub fn records(&self) -> &[ScoredRecord] {
        &self.records
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn modality_counts(&self) -> &BTreeMap<Modality, usize> {
        &self.modality_counts
    }

    /// Number of admitted records for `modality` (0 when none).
    pub fn count(&self, modality: Modality) -> usize {
        self.modality_counts.get(&modality).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Admitted record ids, in admission order.
    pub fn ids(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.record.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modality_parses_case_insensitively() {
        assert_eq!("TABLE".parse::<Modality>().unwrap(), Modality::Table);
        assert_eq!(" image ".parse::<Modality>().unwrap(), Modality::Image);
        assert!("audio".parse::<Modality>().is_err());
    }

    #[test]
    fn modality_serialises_lowercase() {
        let json = serde_json::to_string(&Modality::Table).unwrap();
        assert_eq!(json, "\"table\"");
        assert!(serde_json::from_str::<Modality>("\"video\"").is_err());
    }

    #[test]
    fn source_ref_display() {
        let s = SourceRef::new("reports/q3.pdf").with_page(4);
        assert_eq!(s.to_string(), "reports/q3.pdf p.4");
        assert_eq!(SourceRef::new("a.pdf").to_string(), "a.pdf");
    }

    #[test]
    fn fused_context_counts_every_modality() {
        let rec = Record::new("a", Modality::Text, "hello", SourceRef::new("d"));
        let ctx = FusedContext::new(
            vec![ScoredRecord {
                record: rec,
                score: 0.5,
                rank: 1,
            }],
            2,
        );
        assert_eq!(ctx.count(Modality::Text), 1);
        assert_eq!(ctx.count(Modality::Table), 0);
        assert_eq!(ctx.modality_counts().len(), 3);
    }
}
