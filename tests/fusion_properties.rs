//! Property tests for cross-modality fusion.

use edgequake_docqa::fusion::{normalize_scores, rank_modality};
use edgequake_docqa::{fuse, FusionConfig, Modality, Record, ScoredRecord, SourceRef};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};

fn modality_strategy() -> impl Strategy<Value = Modality> {
    prop_oneof![
        Just(Modality::Text),
        Just(Modality::Table),
        Just(Modality::Image)
    ]
}

/// One modality's result list: ids drawn from a small pool so duplicates
/// occur, scores sorted descending, ranks 1-based.
fn list_strategy(modality: Modality) -> impl Strategy<Value = Vec<ScoredRecord>> {
    prop::collection::vec((0u8..6, 0.0f32..1.0, 0usize..25), 0..8).prop_map(move |mut raw| {
        raw.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        raw.into_iter()
            .enumerate()
            .map(|(i, (id, score, words))| ScoredRecord {
                record: Record::new(
                    format!("r{id}"),
                    modality,
                    vec!["word"; words].join(" "),
                    SourceRef::new("doc.pdf"),
                ),
                score,
                rank: i + 1,
            })
            .collect()
    })
}

fn input_strategy() -> impl Strategy<Value = BTreeMap<Modality, Vec<ScoredRecord>>> {
    (
        list_strategy(Modality::Text),
        list_strategy(Modality::Table),
        list_strategy(Modality::Image),
    )
        .prop_map(|(text, table, image)| {
            BTreeMap::from([
                (Modality::Text, text),
                (Modality::Table, table),
                (Modality::Image, image),
            ])
        })
}

fn config_strategy() -> impl Strategy<Value = FusionConfig> {
    (
        0.0f32..=1.0,
        0usize..120,
        prop::collection::vec(modality_strategy(), 1..4),
    )
        .prop_map(|(alpha, budget, mut priority)| {
            let mut seen = HashSet::new();
            priority.retain(|m| seen.insert(*m));
            FusionConfig {
                alpha,
                modality_priority: priority,
                token_budget: budget,
                ..FusionConfig::default()
            }
        })
}

proptest! {
    #[test]
    fn never_admits_a_key_twice(input in input_strategy(), config in config_strategy()) {
        let fused = fuse(&input, &config);
        let mut seen = HashSet::new();
        for r in fused.records() {
            prop_assert!(seen.insert(r.record.key()), "duplicate {:?}", r.record.key());
        }
    }

    #[test]
    fn stays_within_budget(input in input_strategy(), config in config_strategy()) {
        let fused = fuse(&input, &config);
        let recomputed: usize = fused
            .records()
            .iter()
            .map(|r| config.estimator.estimate(&r.record.content))
            .sum();
        prop_assert!(fused.total_tokens() <= config.token_budget);
        prop_assert_eq!(fused.total_tokens(), recomputed);
    }

    #[test]
    fn is_deterministic(input in input_strategy(), config in config_strategy()) {
        prop_assert_eq!(fuse(&input, &config), fuse(&input, &config));
    }

    #[test]
    fn counts_match_records(input in input_strategy(), config in config_strategy()) {
        let fused = fuse(&input, &config);
        for m in Modality::ALL {
            let n = fused.records().iter().filter(|r| r.modality() == m).count();
            prop_assert_eq!(fused.count(m), n);
        }
    }

    #[test]
    fn keeps_per_modality_value_order(input in input_strategy(), config in config_strategy()) {
        let fused = fuse(&input, &config);
        for (m, list) in &input {
            let ranked: Vec<&str> = rank_modality(list, config.alpha)
                .iter()
                .map(|c| c.scored.record.id.as_str())
                .collect();
            let admitted: Vec<&str> = fused
                .records()
                .iter()
                .filter(|r| r.modality() == *m)
                .map(|r| r.record.id.as_str())
                .collect();
            // `admitted` must be a subsequence of `ranked`.
            let mut it = ranked.iter();
            for id in &admitted {
                prop_assert!(it.any(|r| r == id), "{} out of order in {}", id, m);
            }
        }
    }

    #[test]
    fn unlimited_budget_admits_every_distinct_record(input in input_strategy()) {
        let config = FusionConfig { token_budget: usize::MAX / 2, ..FusionConfig::default() };
        let fused = fuse(&input, &config);
        let distinct: HashSet<_> = input.values().flatten().map(|r| r.record.key()).collect();
        prop_assert_eq!(fused.len(), distinct.len());
    }

    #[test]
    fn normalisation_is_bounded(scores in prop::collection::vec(-5.0f32..5.0, 1..20)) {
        let norm = normalize_scores(&scores);
        prop_assert_eq!(norm.len(), scores.len());
        prop_assert!(norm.iter().all(|v| (0.0..=1.0).contains(v)));

        let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let min = scores.iter().cloned().fold(f32::INFINITY, f32::min);
        let best = scores.iter().position(|s| *s == max).unwrap();
        let worst = scores.iter().position(|s| *s == min).unwrap();
        prop_assert_eq!(norm[best], 1.0);
        if max > min {
            prop_assert_eq!(norm[worst], 0.0);
        }
    }
}
