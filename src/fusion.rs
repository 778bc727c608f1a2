//! Cross-modality fusion: three ranked lists in, one budgeted context out.
//!
//! Similarity scores from the text, table, and image indices come from
//! different embedding spaces and are not comparable. Sorting the union by raw
//! score would hand the whole context to whichever modality's model produces
//! numerically larger cosines. Fusion therefore works in four steps:
//!
//! ```text
//! per modality:  min-max normalise ──▶ blend with rank ──▶ sort by value
//! across:        round-robin in priority order, skipping exhausted lists
//!                admit while the token estimate stays within budget
//! ```
//!
//! The output keeps admission order, so the answer model sees an interleaved
//! text/table/image context instead of a text-only one.

use crate::config::FusionConfig;
use crate::model::{FusedContext, Modality, RecordKey, ScoredRecord};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::debug;

/// A record with its fused relevance value, ready for interleaving.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate<'a> {
    pub scored: &'a ScoredRecord,
    /// Min-max normalised score within the modality, in `[0, 1]`.
    pub normalized: f32,
    /// `alpha * normalized + (1 - alpha) * rank_term`.
    pub value: f32,
}

/// Min-max normalise `scores` to `[0, 1]`.
///
/// All entries map to 1.0 when the list has a single element or every score
/// is equal. Non-finite scores map to 0.0 and are ignored when computing the
/// range.
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    let finite = scores.iter().copied().filter(|s| s.is_finite());
    let (min, max) = finite.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), s| {
        (lo.min(s), hi.max(s))
    });
    let range = max - min;

    scores
        .iter()
        .map(|&s| {
            if !s.is_finite() {
                0.0
            } else if range > 0.0 {
                ((s - min) / range).clamp(0.0, 1.0)
            } else {
                1.0
            }
        })
        .collect()
}

/// Positional relevance of a 1-based `rank` in a list of `len`: 1.0 for the
/// head, decaying linearly towards `1/len` for the tail.
pub fn rank_term(rank: usize, len: usize) -> f32 {
    if len == 0 {
        return 0.0;
    }
    let pos = rank.max(1) - 1;
    (1.0 - pos as f32 / len as f32).clamp(0.0, 1.0)
}

/// Blend a normalised score with its rank position.
pub fn blend(alpha: f32, normalized: f32, rank: usize, len: usize) -> f32 {
    alpha * normalized + (1.0 - alpha) * rank_term(rank, len)
}

/// Score one modality's list and order it by descending fused value.
///
/// Ties keep the index's rank order, so equal inputs always produce equal
/// outputs.
pub fn rank_modality(list: &[ScoredRecord], alpha: f32) -> Vec<RankedCandidate<'_>> {
    let scores: Vec<f32> = list.iter().map(|r| r.score).collect();
    let normalized = normalize_scores(&scores);
    let len = list.len();

    let mut ranked: Vec<RankedCandidate<'_>> = list
        .iter()
        .zip(normalized)
        .map(|(scored, norm)| RankedCandidate {
            scored,
            normalized: norm,
            value: blend(alpha, norm, scored.rank, len),
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.value
            .partial_cmp(&a.value)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.scored.rank.cmp(&b.scored.rank))
    });
    ranked
}

/// Visiting order for the round-robin: the configured priority first, then
/// any other modality present in the input (enum order), so no list is
/// silently dropped by a short priority setting.
fn visiting_order(
    per_modality: &BTreeMap<Modality, Vec<ScoredRecord>>,
    priority: &[Modality],
) -> Vec<Modality> {
    let mut order: Vec<Modality> = Vec::with_capacity(Modality::ALL.len());
    for m in priority {
        if !order.contains(m) {
            order.push(*m);
        }
    }
    for m in per_modality.keys() {
        if !order.contains(m) {
            order.push(*m);
        }
    }
    order
}

/// Fuse per-modality result lists into one budget-bounded context.
///
/// Pure and deterministic: the same inputs and config always produce the
/// same [`FusedContext`]. Empty lists are treated as exhausted; a zero budget
/// or an all-empty input yields an empty context rather than an error.
pub fn fuse(
    per_modality: &BTreeMap<Modality, Vec<ScoredRecord>>,
    config: &FusionConfig,
) -> FusedContext {
    let budget = config.token_budget;
    if budget == 0 {
        return FusedContext::empty();
    }

    let order = visiting_order(per_modality, &config.modality_priority);
    let mut queues: Vec<VecDeque<RankedCandidate<'_>>> = order
        .iter()
        .map(|m| {
            per_modality
                .get(m)
                .map(|list| rank_modality(list, config.alpha).into())
                .unwrap_or_default()
        })
        .collect();

    let mut admitted: Vec<ScoredRecord> = Vec::new();
    let mut seen: HashSet<RecordKey> = HashSet::new();
    let mut total_tokens = 0usize;
    let mut over_budget = 0usize;
    let mut duplicates = 0usize;

    while queues.iter().any(|q| !q.is_empty()) {
        for queue in queues.iter_mut() {
            // A duplicate is not a real candidate and does not cost the
            // modality its turn.
            let candidate = loop {
                match queue.pop_front() {
                    Some(c) if seen.contains(&c.scored.record.key()) => duplicates += 1,
                    other => break other,
                }
            };
            let Some(candidate) = candidate else {
                continue;
            };

            let tokens = config.estimator.estimate(&candidate.scored.record.content);
            if total_tokens + tokens > budget {
                over_budget += 1;
                continue;
            }

            total_tokens += tokens;
            seen.insert(candidate.scored.record.key());
            admitted.push(candidate.scored.clone());
        }
    }

    debug!(
        "Fusion admitted {} records ({} tokens of {}), skipped {} over budget, {} duplicates",
        admitted.len(),
        total_tokens,
        budget,
        over_budget,
        duplicates
    );

    FusedContext::new(admitted, total_tokens)
}
