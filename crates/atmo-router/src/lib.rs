//! # atmo-router
//!
//! Picks which capability in the mesh should serve a request.
//!
//! Each available candidate gets four sub-scores in `[0, 1]` (semantic
//! relevance, latency, hop distance, load) which are combined with fixed
//! weights into one composite score. Ranking is a pure function of the
//! query, the candidates and the weights, so the same inputs always give
//! the same decision.

pub mod router;
pub mod scoring;

pub use router::{MatchMethod, RoutingDecision, ScoredCandidate, SemanticRouter, rank};
pub use scoring::{ScoreBreakdown, SemanticMatch, semantic_match, tokenize};
