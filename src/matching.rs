use crate::config::MatcherConfig;
use crate::features::{Feature, DESCRIPTOR_BYTES};
use rayon::prelude::*;
use std::collections::HashMap;

/// A candidate correspondence: indices into the two feature sets plus the
/// Hamming distance that ranked the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub idx0: usize,
    pub idx1: usize,
    pub distance: u32,
}

pub fn hamming_distance(a: &[u8; DESCRIPTOR_BYTES], b: &[u8; DESCRIPTOR_BYTES]) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Match descriptors from `features0` against `features1`.
///
/// For every query descriptor the best and second-best neighbors are found by
/// Hamming distance; a pair is accepted only when the best distance clears an
/// absolute cutoff and Lowe's ratio test (best must be meaningfully closer
/// than second-best). Matches are then made one-to-one, keeping the closest
/// pair per target feature, so the result size is bounded by
/// `min(|features0|, |features1|)`.
pub fn match_features(
    features0: &[Feature],
    features1: &[Feature],
    config: &MatcherConfig,
) -> Vec<Match> {
    if features0.is_empty() || features1.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<Match> = features0
        .par_iter()
        .enumerate()
        .filter_map(|(idx0, query)| {
            let mut best_distance = u32::MAX;
            let mut second_best_distance = u32::MAX;
            let mut best_idx1 = 0;

            for (idx1, target) in features1.iter().enumerate() {
                let distance = hamming_distance(&query.descriptor, &target.descriptor);
                if distance < best_distance {
                    second_best_distance = best_distance;
                    best_distance = distance;
                    best_idx1 = idx1;
                } else if distance < second_best_distance {
                    second_best_distance = distance;
                }
            }

            let ratio_ok = second_best_distance == u32::MAX
                || (best_distance as f32) < config.ratio * second_best_distance as f32;
            if best_distance <= config.max_distance && ratio_ok {
                Some(Match {
                    idx0,
                    idx1: best_idx1,
                    distance: best_distance,
                })
            } else {
                None
            }
        })
        .collect();

    // One-to-one: several queries may claim the same target, keep the closest.
    candidates.sort_by_key(|m| (m.distance, m.idx0));
    let mut best_per_target: HashMap<usize, Match> = HashMap::new();
    for candidate in candidates {
        best_per_target.entry(candidate.idx1).or_insert(candidate);
    }

    let mut matches: Vec<Match> = best_per_target.into_values().collect();
    matches.sort_by_key(|m| (m.distance, m.idx0));
    matches
}
