use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::debug;

use atmo_core::{AtmoError, Result, short_id, to_chrono};

/// Optional features a capability offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Supports {
    pub rag: bool,
    pub vision: bool,
    pub tools: bool,
}

/// One capability advertised by one node.
///
/// Entries are keyed by `(capability_id, owner_node_id)`. Everything except
/// the ids, the type and `last_seen` is optional on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEntry {
    #[serde(default)]
    pub capability_id: String,
    #[serde(default)]
    pub owner_node_id: String,
    #[serde(default)]
    pub owner_node_name: String,
    /// e.g. "llm", "vision", "tool".
    #[serde(rename = "type", default)]
    pub capability_type: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub model_tier: Option<String>,
    /// Model size in billions of parameters.
    #[serde(default)]
    pub params_b: Option<f64>,
    #[serde(default)]
    pub supports: Supports,
    /// Relays between us and the owner; 0 for local capabilities.
    #[serde(default)]
    pub hop_count: u32,
    #[serde(default)]
    pub estimated_latency_ms: u64,
    /// 0 (idle) ..= 1 (saturated).
    #[serde(default)]
    pub load: f64,
    #[serde(default)]
    pub queue_depth: u32,
    #[serde(default)]
    pub avg_inference_ms: Option<f64>,
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default)]
    pub semantic_tags: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
    /// Advertiser-local counter, breaks `last_seen` ties.
    #[serde(default)]
    pub sequence: u64,
}

fn default_available() -> bool {
    true
}

impl CapabilityEntry {
    pub fn new(
        capability_id: impl Into<String>,
        owner_node_id: impl Into<String>,
        capability_type: impl Into<String>,
    ) -> Self {
        Self {
            capability_id: capability_id.into(),
            owner_node_id: owner_node_id.into(),
            owner_node_name: String::new(),
            capability_type: capability_type.into(),
            model: None,
            model_tier: None,
            params_b: None,
            supports: Supports::default(),
            hop_count: 0,
            estimated_latency_ms: 0,
            load: 0.0,
            queue_depth: 0,
            avg_inference_ms: None,
            available: true,
            semantic_tags: BTreeSet::new(),
            last_seen: Utc::now(),
            sequence: 0,
        }
    }

    pub fn with_owner_name(mut self, name: impl Into<String>) -> Self {
        self.owner_node_name = name.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.semantic_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_supports(mut self, supports: Supports) -> Self {
        self.supports = supports;
        self
    }

    pub fn with_hop_count(mut self, hops: u32) -> Self {
        self.hop_count = hops;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.estimated_latency_ms = latency_ms;
        self
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.load = load;
        self
    }

    pub fn with_queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn with_last_seen(mut self, at: DateTime<Utc>) -> Self {
        self.last_seen = at;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn key(&self) -> (String, String) {
        (self.capability_id.clone(), self.owner_node_id.clone())
    }

    /// Parse an entry received over gossip and normalise it.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let entry: CapabilityEntry = serde_json::from_value(value).map_err(|e| AtmoError::InvalidEntry {
            field: "entry".into(),
            reason: e.to_string(),
        })?;
        entry.validate()
    }

    /// Reject entries that cannot be scored, and normalise the rest.
    pub fn validate(mut self) -> Result<Self> {
        self.capability_id = self.capability_id.trim().to_string();
        self.owner_node_id = self.owner_node_id.trim().to_string();
        self.capability_type = self.capability_type.trim().to_lowercase();

        for (field, value) in [
            ("capability_id", &self.capability_id),
            ("owner_node_id", &self.owner_node_id),
            ("type", &self.capability_type),
        ] {
            if value.is_empty() {
                return Err(AtmoError::InvalidEntry {
                    field: field.into(),
                    reason: "must not be empty".into(),
                });
            }
        }
        if !self.load.is_finite() {
            return Err(AtmoError::InvalidEntry {
                field: "load".into(),
                reason: format!("{} is not a number", self.load),
            });
        }
        self.load = self.load.clamp(0.0, 1.0);

        self.params_b = self.params_b.filter(|p| p.is_finite() && *p >= 0.0);
        self.avg_inference_ms = self.avg_inference_ms.filter(|ms| ms.is_finite() && *ms >= 0.0);
        self.model = self.model.map(|m| m.trim().to_string()).filter(|m| !m.is_empty());
        self.semantic_tags = self
            .semantic_tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Ok(self)
    }

    /// Whether `other` should replace this entry.
    fn superseded_by(&self, other: &CapabilityEntry) -> bool {
        other.last_seen > self.last_seen
            || (other.last_seen == self.last_seen && other.sequence > self.sequence)
    }
}

/// Type/tag restriction applied to table queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityFilter {
    /// Only entries of this type (case-insensitive).
    pub capability_type: Option<String>,
    /// Entries must carry every one of these tags.
    pub tags: Vec<String>,
    /// Skip entries whose owner marked them unavailable.
    pub available_only: bool,
}

impl CapabilityFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn of_type(capability_type: impl Into<String>) -> Self {
        Self {
            capability_type: Some(capability_type.into()),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn available(mut self) -> Self {
        self.available_only = true;
        self
    }

    pub fn matches(&self, entry: &CapabilityEntry) -> bool {
        if self.available_only && !entry.available {
            return false;
        }
        if let Some(ref t) = self.capability_type
            && !entry.capability_type.eq_ignore_ascii_case(t.trim())
        {
            return false;
        }
        self.tags
            .iter()
            .all(|tag| entry.semantic_tags.contains(&tag.trim().to_lowercase()))
    }
}

/// What `ingest` did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Replaced,
    /// The table already held a newer (or equally new) copy.
    Dropped,
}

/// Capabilities currently known to this node, local and gossiped.
///
/// Reads take a shared lock and clone; ingest, sweep and removal take the
/// write lock, so concurrent writers never interleave on a key.
#[derive(Debug, Default)]
pub struct CapabilityTable {
    entries: RwLock<HashMap<(String, String), CapabilityEntry>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert an entry, last-writer-wins by `last_seen` then `sequence`.
    pub fn ingest(&self, entry: CapabilityEntry) -> Result<IngestOutcome> {
        let entry = entry.validate()?;
        let key = entry.key();
        let mut entries = self.entries.write();

        let outcome = match entries.get(&key) {
            None => IngestOutcome::Inserted,
            Some(existing) if existing.superseded_by(&entry) => IngestOutcome::Replaced,
            Some(_) => IngestOutcome::Dropped,
        };
        if outcome != IngestOutcome::Dropped {
            entries.insert(key, entry);
        } else {
            debug!(
                capability_id = %key.0,
                owner = %short_id(&key.1),
                "dropped stale capability advert"
            );
        }
        Ok(outcome)
    }

    /// Evict entries not refreshed within `ttl` of `now`. Returns how many went.
    pub fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let ttl = to_chrono(ttl);
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| now.signed_duration_since(e.last_seen) <= ttl);
        before - entries.len()
    }

    /// Entries matching `filter`, in no particular order.
    pub fn query(&self, filter: &CapabilityFilter) -> Vec<CapabilityEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Every entry, sorted by owner then capability id for stable output.
    pub fn snapshot(&self) -> Vec<CapabilityEntry> {
        let mut all: Vec<CapabilityEntry> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| {
            a.owner_node_id
                .cmp(&b.owner_node_id)
                .then_with(|| a.capability_id.cmp(&b.capability_id))
        });
        all
    }

    pub fn get(&self, capability_id: &str, owner_node_id: &str) -> Option<CapabilityEntry> {
        self.entries
            .read()
            .get(&(capability_id.to_string(), owner_node_id.to_string()))
            .cloned()
    }

    /// Drop everything a node advertised. Returns how many went.
    pub fn remove_owner(&self, owner_node_id: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(_, owner), _| owner != owner_node_id);
        before - entries.len()
    }

    pub fn remove(&self, capability_id: &str, owner_node_id: &str) -> Option<CapabilityEntry> {
        self.entries
            .write()
            .remove(&(capability_id.to_string(), owner_node_id.to_string()))
    }

    /// Distinct owners currently present.
    pub fn owners(&self) -> BTreeSet<String> {
        self.entries.read().keys().map(|(_, owner)| owner.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_normalises() {
        let entry = CapabilityEntry::new(" llm-1 ", "node-a", "LLM")
            .with_tags(["Chat", "  ", "CODE "])
            .with_load(1.7)
            .validate()
            .unwrap();
        assert_eq!(entry.capability_id, "llm-1");
        assert_eq!(entry.capability_type, "llm");
        assert_eq!(entry.load, 1.0);
        assert_eq!(
            entry.semantic_tags,
            ["chat", "code"].into_iter().map(String::from).collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_validate_rejects_empty_ids_and_nan_load() {
        assert!(CapabilityEntry::new("", "n", "llm").validate().is_err());
        assert!(CapabilityEntry::new("c", "", "llm").validate().is_err());
        assert!(CapabilityEntry::new("c", "n", " ").validate().is_err());
        let err = CapabilityEntry::new("c", "n", "llm")
            .with_load(f64::NAN)
            .validate()
            .unwrap_err();
        assert!(matches!(err, AtmoError::InvalidEntry { ref field, .. } if field == "load"));
    }

    #[test]
    fn test_from_json_defaults_optional_fields() {
        let json = serde_json::json!({
            "capability_id": "vision-1",
            "owner_node_id": "node-b",
            "type": "vision",
            "last_seen": "2026-01-01T00:00:00Z",
        });
        let entry = CapabilityEntry::from_json(json).unwrap();
        assert!(entry.available);
        assert_eq!(entry.hop_count, 0);
        assert_eq!(entry.model, None);
        assert_eq!(entry.supports, Supports::default());
    }

    #[test]
    fn test_from_json_rejects_wrong_types() {
        let json = serde_json::json!({
            "capability_id": "x",
            "owner_node_id": "n",
            "type": "llm",
            "hop_count": -1,
            "last_seen": "2026-01-01T00:00:00Z",
        });
        assert!(matches!(
            CapabilityEntry::from_json(json),
            Err(AtmoError::InvalidEntry { .. })
        ));
    }

    #[test]
    fn test_filter_matches_type_and_all_tags() {
        let entry = CapabilityEntry::new("c", "n", "llm")
            .with_tags(["chat", "code"])
            .validate()
            .unwrap();
        assert!(CapabilityFilter::any().matches(&entry));
        assert!(CapabilityFilter::of_type("LLM").matches(&entry));
        assert!(!CapabilityFilter::of_type("vision").matches(&entry));
        assert!(CapabilityFilter::any().with_tag("Chat").matches(&entry));
        assert!(!CapabilityFilter::any().with_tag("chat").with_tag("audio").matches(&entry));

        let off = entry.with_available(false);
        assert!(CapabilityFilter::any().matches(&off));
        assert!(!CapabilityFilter::any().available().matches(&off));
    }
}
