use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::sync::Arc;
use tokio::sync::broadcast;

/// Events published by the core for observers such as the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Peer lifecycle ─────────────────────────────────────────
    PeerAdmitted {
        node_id: String,
        name: String,
    },
    PeerRejected {
        node_id: String,
        reason: String,
    },
    PeerLeft {
        node_id: String,
        reason: String,
    },

    // ── Capability table ───────────────────────────────────────
    CapabilitiesEvicted {
        count: usize,
    },

    // ── Routing / sessions ─────────────────────────────────────
    RouteDecided {
        query: String,
        capability_id: String,
        owner_node_id: String,
        match_method: String,
        composite_score: f64,
    },
    SessionStateChanged {
        session_id: String,
        state: String,
    },

    // ── Node lifecycle ─────────────────────────────────────────
    NodeStarted {
        node_id: String,
        at: DateTime<Utc>,
    },
    NodeStopped {
        node_id: String,
    },
}

/// A broadcast-based event bus for system-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
