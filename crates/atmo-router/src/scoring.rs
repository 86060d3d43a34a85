use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use atmo_config::{RoutingConfig, RoutingWeights};
use atmo_mesh::CapabilityEntry;

/// Score given to any keyword overlap at all.
const OVERLAP_BASE: f64 = 0.5;
/// Extra score spread over the fraction of query words matched.
const OVERLAP_SPAN: f64 = 0.45;

/// Share of the cost score taken by `load`; the rest is queue depth.
const LOAD_SHARE: f64 = 0.6;
const QUEUE_SHARE: f64 = 0.4;

/// The four sub-scores and their weighted sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub semantic_score: f64,
    pub latency_score: f64,
    pub hop_score: f64,
    pub cost_score: f64,
    pub composite_score: f64,
}

impl ScoreBreakdown {
    pub fn compute(semantic: f64, entry: &CapabilityEntry, config: &RoutingConfig) -> Self {
        let latency = latency_score(entry.estimated_latency_ms, config.latency_ceiling_ms);
        let hop = hop_score(entry.hop_count);
        let cost = cost_score(entry.load, entry.queue_depth, config.queue_depth_ceiling);
        Self {
            semantic_score: semantic,
            latency_score: latency,
            hop_score: hop,
            cost_score: cost,
            composite_score: composite(&config.weights, semantic, latency, hop, cost),
        }
    }
}

/// Lower-cased alphanumeric words of at least two characters, deduplicated.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// Words a capability can be matched on.
fn vocabulary(entry: &CapabilityEntry) -> BTreeSet<String> {
    let mut vocab: BTreeSet<String> = entry.semantic_tags.iter().flat_map(|t| tokenize(t)).collect();
    vocab.extend(tokenize(&entry.capability_type));
    if let Some(ref model) = entry.model {
        vocab.extend(tokenize(model));
    }
    for (supported, word) in [
        (entry.supports.rag, "rag"),
        (entry.supports.vision, "vision"),
        (entry.supports.tools, "tools"),
    ] {
        if supported {
            vocab.insert(word.to_string());
        }
    }
    vocab
}

/// How well a query fits a capability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SemanticMatch {
    pub score: f64,
    /// The whole query named a tag, the capability id or the model.
    pub exact: bool,
}

/// Keyword relevance of `query` to `entry`.
///
/// An exact hit scores 1.0. Otherwise, with `m` of the `n` query words in
/// the entry's vocabulary, the score is `0.5 + 0.45 * m / n`, or 0 with no
/// overlap at all.
pub fn semantic_match(query: &str, entry: &CapabilityEntry) -> SemanticMatch {
    let normalized = query.trim().to_lowercase();
    if !normalized.is_empty() {
        let exact = entry.semantic_tags.contains(&normalized)
            || entry.capability_id.to_lowercase() == normalized
            || entry
                .model
                .as_deref()
                .is_some_and(|m| m.to_lowercase() == normalized);
        if exact {
            return SemanticMatch {
                score: 1.0,
                exact: true,
            };
        }
    }

    let words = tokenize(query);
    if words.is_empty() {
        return SemanticMatch {
            score: 0.0,
            exact: false,
        };
    }
    let vocab = vocabulary(entry);
    let matched = words.iter().filter(|w| vocab.contains(*w)).count();
    let score = if matched == 0 {
        0.0
    } else {
        OVERLAP_BASE + OVERLAP_SPAN * matched as f64 / words.len() as f64
    };
    SemanticMatch { score, exact: false }
}

/// 1 at zero latency, falling linearly to 0 at the ceiling.
pub fn latency_score(latency_ms: u64, ceiling_ms: u64) -> f64 {
    if ceiling_ms == 0 {
        return 0.0;
    }
    1.0 - latency_ms.min(ceiling_ms) as f64 / ceiling_ms as f64
}

/// 1 for a local capability, halving at one hop and so on.
pub fn hop_score(hop_count: u32) -> f64 {
    1.0 / (1.0 + hop_count as f64)
}

/// 1 when idle with an empty queue, 0 when saturated with a full one.
pub fn cost_score(load: f64, queue_depth: u32, queue_ceiling: u32) -> f64 {
    let load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 1.0 };
    let queue = if queue_ceiling == 0 {
        1.0
    } else {
        queue_depth.min(queue_ceiling) as f64 / queue_ceiling as f64
    };
    (1.0 - (LOAD_SHARE * load + QUEUE_SHARE * queue)).clamp(0.0, 1.0)
}

pub fn composite(weights: &RoutingWeights, semantic: f64, latency: f64, hop: f64, cost: f64) -> f64 {
    weights.semantic * semantic + weights.latency * latency + weights.hop * hop + weights.cost * cost
}
