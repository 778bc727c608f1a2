//! Turn a [`FusedContext`] into the sections the answer prompt is built from.

use crate::error::DocQaError;
use crate::model::{FusedContext, Modality, RecordKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One fragment of grounded context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: String,
    pub content: String,
    /// Rendered [`crate::model::SourceRef`], e.g. `reports/q3.pdf p.4`.
    pub source: String,
}

/// Context grouped by modality, each section in admission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptPayload {
    pub text_context: Vec<ContextEntry>,
    pub table_context: Vec<ContextEntry>,
    pub image_context: Vec<ContextEntry>,
}

impl PromptPayload {
    pub fn is_empty(&self) -> bool {
        self.text_context.is_empty() && self.table_context.is_empty() && self.image_context.is_empty()
    }

    pub fn len(&self) -> usize {
        self.text_context.len() + self.table_context.len() + self.image_context.len()
    }

    pub fn section(&self, modality: Modality) -> &[ContextEntry] {
        match modality {
            Modality::Text => &self.text_context,
            Modality::Table => &self.table_context,
            Modality::Image => &self.image_context,
        }
    }

    /// Render the context block inserted at `{{CONTEXT}}`.
    ///
    /// Sections appear as text, table, image; blocks are separated by a
    /// blank line. Text content is cut to `max_text_chars` characters.
    pub fn render(&self, max_text_chars: usize) -> String {
        let text = self.text_context.iter().map(|e| {
            format!(
                "[TEXT]\n{}\n(Source: {})\n",
                truncate_chars(&e.content, max_text_chars),
                e.source
            )
        });
        let tables = self
            .table_context
            .iter()
            .map(|e| format!("[TABLE]\n{}\n(Source: {})\n", e.content, e.source));
        let images = self
            .image_context
            .iter()
            .map(|e| format!("[IMAGE]\nCaption: {}\n(Source: {})\n", e.content, e.source));

        text.chain(tables).chain(images).collect::<Vec<_>>().join("\n")
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((cut, _)) => &s[..cut],
        None => s,
    }
}

/// Split `fused` into per-modality sections.
///
/// Fails with [`DocQaError::MalformedContext`] when the context breaks its
/// own invariants; a context produced by [`crate::fusion::fuse`] never does.
pub fn build(fused: &FusedContext) -> Result<PromptPayload, DocQaError> {
    let mut payload = PromptPayload::default();
    let mut seen: HashSet<RecordKey> = HashSet::with_capacity(fused.len());
    let mut counts: BTreeMap<Modality, usize> = BTreeMap::new();

    for scored in fused.records() {
        let record = &scored.record;
        if !seen.insert(record.key()) {
            return Err(DocQaError::MalformedContext {
                detail: format!("{} record '{}' appears twice", record.modality, record.id),
            });
        }
        *counts.entry(record.modality).or_default() += 1;

        let entry = ContextEntry {
            id: record.id.clone(),
            content: record.content.clone(),
            source: record.source_ref.to_string(),
        };
        match record.modality {
            Modality::Text => payload.text_context.push(entry),
            Modality::Table => payload.table_context.push(entry),
            Modality::Image => payload.image_context.push(entry),
        }
    }

    for (modality, &declared) in fused.modality_counts() {
        let actual = counts.get(modality).copied().unwrap_or(0);
        if declared != actual {
            return Err(DocQaError::MalformedContext {
                detail: format!("{modality} count is {declared} but {actual} records are present"),
            });
        }
    }
    if let Some(m) = counts.keys().find(|m| !fused.modality_counts().contains_key(m)) {
        return Err(DocQaError::MalformedContext {
            detail: format!("{m} records present but not counted"),
        });
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Record, ScoredRecord, SourceRef};

    fn scored(id: &str, modality: Modality, content: &str) -> ScoredRecord {
        ScoredRecord {
            record: Record::new(id, modality, content, SourceRef::new("q3.pdf").with_page(2)),
            score: 1.0,
            rank: 1,
        }
    }

    #[test]
    fn empty_context_gives_empty_payload() {
        let payload = build(&FusedContext::empty()).unwrap();
        assert!(payload.is_empty());
        assert_eq!(payload.render(1200), "");
    }

    #[test]
    fn sections_preserve_admission_order() {
        let fused = FusedContext::new(
            vec![
                scored("a", Modality::Text, "first"),
                scored("c", Modality::Table, "| x |"),
                scored("b", Modality::Text, "second"),
            ],
            5,
        );
        let payload = build(&fused).unwrap();
        let text: Vec<&str> = payload.text_context.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(text, vec!["a", "b"]);
        assert_eq!(payload.section(Modality::Table)[0].source, "q3.pdf p.2");
        assert!(payload.image_context.is_empty());
        assert_eq!(payload.len(), 3);
    }

    #[test]
    fn render_blocks() {
        let fused = FusedContext::new(
            vec![
                scored("a", Modality::Text, "abcdef"),
                scored("i", Modality::Image, "Revenue by region"),
                scored("t", Modality::Table, "| US | 5000 |"),
            ],
            5,
        );
        let rendered = build(&fused).unwrap().render(3);
        assert_eq!(
            rendered,
            "[TEXT]\nabc\n(Source: q3.pdf p.2)\n\n\
             [TABLE]\n| US | 5000 |\n(Source: q3.pdf p.2)\n\n\
             [IMAGE]\nCaption: Revenue by region\n(Source: q3.pdf p.2)\n"
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 2), "hi");
    }

    #[test]
    fn duplicate_key_is_malformed() {
        let fused = FusedContext::new(
            vec![scored("a", Modality::Text, "x"), scored("a", Modality::Text, "x")],
            2,
        );
        assert!(matches!(build(&fused), Err(DocQaError::MalformedContext { .. })));
    }

    #[test]
    fn same_id_in_two_modalities_is_fine() {
        let fused = FusedContext::new(
            vec![scored("a", Modality::Text, "x"), scored("a", Modality::Table, "y")],
            2,
        );
        assert!(build(&fused).is_ok());
    }

    #[test]
    fn tampered_counts_are_malformed() {
        let fused = FusedContext::new(vec![scored("a", Modality::Text, "x")], 1);
        let mut json = serde_json::to_value(&fused).unwrap();
        json["modality_counts"]["table"] = serde_json::json!(4);
        let tampered: FusedContext = serde_json::from_value(json).unwrap();
        let err = build(&tampered).unwrap_err();
        assert!(err.to_string().contains("table count is 4"), "got: {err}");
    }
}
