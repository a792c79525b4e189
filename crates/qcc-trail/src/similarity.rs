//! Similarity scoring for `find_similar`.
//!
//! `score = 0.7 * jaccard(capabilities) + 0.3 / (1 + euclid(features))`,
//! with missing feature keys counted as 0.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::types::ConfigurationHint;

pub const CAPABILITY_WEIGHT: f64 = 0.7;
pub const CONTEXT_WEIGHT: f64 = 0.3;

/// Jaccard index of two capability sets. Two empty sets are identical.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// `1 / (1 + euclidean distance)` over the union of feature keys.
pub fn proximity(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> f64 {
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    let distance = keys
        .into_iter()
        .map(|k| {
            let d = a.get(k).copied().unwrap_or(0.0) - b.get(k).copied().unwrap_or(0.0);
            d * d
        })
        .sum::<f64>()
        .sqrt();
    1.0 / (1.0 + distance)
}

pub fn score(
    requested: &BTreeSet<String>,
    recorded: &BTreeSet<String>,
    context: &BTreeMap<String, f64>,
    recorded_context: &BTreeMap<String, f64>,
) -> f64 {
    CAPABILITY_WEIGHT * jaccard(requested, recorded)
        + CONTEXT_WEIGHT * proximity(context, recorded_context)
}

/// Ranking order: similarity desc, then success rate desc, then recency desc.
pub fn compare(a: &ConfigurationHint, b: &ConfigurationHint) -> Ordering {
    b.similarity_score
        .total_cmp(&a.similarity_score)
        .then_with(|| b.success_rate.total_cmp(&a.success_rate))
        .then_with(|| b.last_used.cmp(&a.last_used))
}

/// Drop hints below `min_similarity` and sort the rest.
pub fn rank(mut hints: Vec<ConfigurationHint>, min_similarity: f64) -> Vec<ConfigurationHint> {
    hints.retain(|h| h.similarity_score >= min_similarity);
    hints.sort_by(compare);
    hints
}
