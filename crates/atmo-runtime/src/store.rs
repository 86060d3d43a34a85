use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use atmo_core::Result;

/// The replicated document log the mailbox writes into.
///
/// Replication itself happens elsewhere. Implementations must not assume
/// ordering or immediate visibility of documents written by other peers.
#[async_trait]
pub trait ReplicatedStore: Send + Sync {
    /// Write a document under `id`. Ids are write-once: returns `false`
    /// and leaves the stored document untouched if `id` already exists.
    async fn insert(&self, collection: &str, id: &str, document: Value) -> Result<bool>;

    /// Every document currently visible in `collection`, in no particular order.
    async fn query(&self, collection: &str) -> Result<Vec<Value>>;

    /// Woken whenever new documents become visible, if the store can tell.
    fn change_notifier(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// In-process store for tests and single-node use.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, HashMap<String, Value>>>,
    changed: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, |docs| docs.len())
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(id).cloned())
    }
}

#[async_trait]
impl ReplicatedStore for MemoryStore {
    async fn insert(&self, collection: &str, id: &str, document: Value) -> Result<bool> {
        let inserted = {
            let mut collections = self.collections.write();
            let docs = collections.entry(collection.to_string()).or_default();
            if docs.contains_key(id) {
                false
            } else {
                docs.insert(id.to_string(), document);
                true
            }
        };
        if inserted {
            self.changed.notify_waiters();
        } else {
            debug!(collection, id, "duplicate id ignored");
        }
        Ok(inserted)
    }

    async fn query(&self, collection: &str) -> Result<Vec<Value>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    fn change_notifier(&self) -> Option<Arc<Notify>> {
        Some(Arc::clone(&self.changed))
    }
}
