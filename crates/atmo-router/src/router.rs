use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use atmo_config::RoutingConfig;
use atmo_core::{AtmoError, Result, short_id};
use atmo_mesh::{CapabilityEntry, CapabilityFilter, CapabilityTable};

use crate::scoring::{ScoreBreakdown, semantic_match};

/// How the chosen capability relates to the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// The query named one of its tags, its id or its model.
    Exact,
    /// Some query words overlap its vocabulary.
    Semantic,
    /// Nothing overlaps; chosen on latency, distance and load alone.
    Fallback,
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MatchMethod::Exact => "exact",
            MatchMethod::Semantic => "semantic",
            MatchMethod::Fallback => "fallback",
        })
    }
}

/// A candidate with its scores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub entry: CapabilityEntry,
    pub breakdown: ScoreBreakdown,
    pub exact: bool,
}

impl ScoredCandidate {
    pub fn match_method(&self) -> MatchMethod {
        if self.exact {
            MatchMethod::Exact
        } else if self.breakdown.semantic_score > 0.0 {
            MatchMethod::Semantic
        } else {
            MatchMethod::Fallback
        }
    }
}

/// The outcome of routing one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub capability: CapabilityEntry,
    pub match_method: MatchMethod,
    pub score_breakdown: ScoreBreakdown,
    /// Runners-up, best first.
    pub alternatives: Vec<CapabilityEntry>,
}

/// Best first: composite score, then fewer hops, shorter queue, owner id,
/// capability id.
fn by_rank(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.breakdown
        .composite_score
        .total_cmp(&a.breakdown.composite_score)
        .then_with(|| a.entry.hop_count.cmp(&b.entry.hop_count))
        .then_with(|| a.entry.queue_depth.cmp(&b.entry.queue_depth))
        .then_with(|| a.entry.owner_node_id.cmp(&b.entry.owner_node_id))
        .then_with(|| a.entry.capability_id.cmp(&b.entry.capability_id))
}

/// Score and order the available candidates for `query`.
pub fn rank(query: &str, candidates: Vec<CapabilityEntry>, config: &RoutingConfig) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .filter(|e| e.available)
        .map(|entry| {
            let semantic = semantic_match(query, &entry);
            let breakdown = ScoreBreakdown::compute(semantic.score, &entry, config);
            ScoredCandidate {
                entry,
                breakdown,
                exact: semantic.exact,
            }
        })
        .collect();
    scored.sort_by(by_rank);
    scored
}

/// Chooses capabilities from a shared table.
#[derive(Clone)]
pub struct SemanticRouter {
    table: Arc<CapabilityTable>,
    config: RoutingConfig,
}

impl SemanticRouter {
    pub fn new(table: Arc<CapabilityTable>, config: RoutingConfig) -> Self {
        Self { table, config }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Ranking over an explicit candidate list; does not touch the table.
    pub fn rank(&self, query: &str, candidates: Vec<CapabilityEntry>) -> Vec<ScoredCandidate> {
        rank(query, candidates, &self.config)
    }

    /// Decide among explicit candidates. `None` when none is available.
    pub fn decide(&self, query: &str, candidates: Vec<CapabilityEntry>) -> Option<RoutingDecision> {
        let mut ranked = self.rank(query, candidates).into_iter();
        let best = ranked.next()?;
        let match_method = best.match_method();
        let alternatives = ranked
            .take(self.config.max_alternatives)
            .map(|c| c.entry)
            .collect();

        debug!(
            capability_id = %best.entry.capability_id,
            owner = %short_id(&best.entry.owner_node_id),
            method = %match_method,
            composite = best.breakdown.composite_score,
            "routing decision"
        );
        Some(RoutingDecision {
            capability: best.entry,
            match_method,
            score_breakdown: best.breakdown,
            alternatives,
        })
    }

    /// Route against the current table contents.
    pub fn route(&self, query: &str, filter: &CapabilityFilter) -> Option<RoutingDecision> {
        self.decide(query, self.table.query(filter))
    }

    /// Like [`route`](Self::route), with the empty case as an error.
    pub fn try_route(&self, query: &str, filter: &CapabilityFilter) -> Result<RoutingDecision> {
        self.route(query, filter).ok_or_else(|| {
            AtmoError::NoCandidateCapability(match filter.capability_type {
                Some(ref t) => format!("no available '{t}' capability"),
                None => "no available capability".into(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, owner: &str) -> CapabilityEntry {
        CapabilityEntry::new(id, owner, "llm")
    }

    #[test]
    fn test_match_method_display() {
        assert_eq!(MatchMethod::Exact.to_string(), "exact");
        assert_eq!(
            serde_json::to_string(&MatchMethod::Fallback).unwrap(),
            "\"fallback\""
        );
    }

    #[test]
    fn test_rank_skips_unavailable() {
        let ranked = rank(
            "chat",
            vec![entry("a", "n1").with_available(false), entry("b", "n2")],
            &RoutingConfig::default(),
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].entry.capability_id, "b");
    }

    #[test]
    fn test_ties_break_on_owner_then_id() {
        let ranked = rank(
            "anything",
            vec![entry("b", "n2"), entry("b", "n1"), entry("a", "n2")],
            &RoutingConfig::default(),
        );
        let order: Vec<_> = ranked
            .iter()
            .map(|c| (c.entry.owner_node_id.as_str(), c.entry.capability_id.as_str()))
            .collect();
        assert_eq!(order, vec![("n1", "b"), ("n2", "a"), ("n2", "b")]);
    }

    #[test]
    fn test_try_route_on_empty_table() {
        let router = SemanticRouter::new(Arc::new(CapabilityTable::new()), RoutingConfig::default());
        let err = router
            .try_route("chat", &CapabilityFilter::of_type("llm"))
            .unwrap_err();
        assert!(matches!(err, AtmoError::NoCandidateCapability(_)));
        assert!(err.to_string().contains("llm"));
    }
}
