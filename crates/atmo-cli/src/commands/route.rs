use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use atmo_config::AtmoConfig;
use atmo_core::{AtmoError, Result};
use atmo_mesh::{CapabilityEntry, CapabilityFilter, CapabilityTable};
use atmo_router::{RoutingDecision, SemanticRouter};

pub(super) fn cmd_route(
    config: &AtmoConfig,
    query: &str,
    table_path: &Path,
    capability_type: Option<String>,
    tags: Vec<String>,
    json: bool,
) -> Result<()> {
    let table = Arc::new(load_snapshot(table_path)?);
    let filter = CapabilityFilter {
        capability_type,
        tags,
        available_only: true,
    };
    let router = SemanticRouter::new(table, config.routing.clone());

    match router.try_route(query, &filter) {
        Ok(decision) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&decision)?);
            } else {
                print!("{}", render(&decision));
            }
            Ok(())
        }
        Err(e) => {
            println!("No capability available for '{query}'.");
            if e.is_retryable() {
                println!("Try again once more peers have advertised.");
            }
            Err(e)
        }
    }
}

/// Read a JSON array of capability entries into a fresh table.
/// Entries that fail validation are skipped with a warning.
fn load_snapshot(path: &Path) -> Result<CapabilityTable> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AtmoError::Config(format!("cannot read {}: {e}", path.display())))?;
    let values: Vec<serde_json::Value> = serde_json::from_str(&raw)?;

    let table = CapabilityTable::new();
    for (i, value) in values.into_iter().enumerate() {
        match CapabilityEntry::from_json(value).and_then(|entry| table.ingest(entry)) {
            Ok(_) => {}
            Err(e) => warn!(index = i, error = %e, "skipping snapshot entry"),
        }
    }
    info!(
        entries = table.len(),
        owners = table.owners().len(),
        path = %path.display(),
        "loaded capability snapshot"
    );
    Ok(table)
}

fn render(decision: &RoutingDecision) -> String {
    let c = &decision.capability;
    let s = &decision.score_breakdown;
    let mut out = format!(
        "{} on {} ({} match)\n",
        c.capability_id,
        if c.owner_node_name.is_empty() {
            &c.owner_node_id
        } else {
            &c.owner_node_name
        },
        decision.match_method
    );
    out.push_str(&format!("  composite  {:.3}\n", s.composite_score));
    out.push_str(&format!("  semantic   {:.3}\n", s.semantic_score));
    out.push_str(&format!("  latency    {:.3}\n", s.latency_score));
    out.push_str(&format!("  hops       {:.3}  ({} hops)\n", s.hop_score, c.hop_count));
    out.push_str(&format!("  cost       {:.3}\n", s.cost_score));
    if !decision.alternatives.is_empty() {
        out.push_str("  alternatives:\n");
        for alt in &decision.alternatives {
            out.push_str(&format!("    {} on {}\n", alt.capability_id, alt.owner_node_id));
        }
    }
    out
}
