use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use atmo_core::{AtmoError, Result, short_id};

/// Delivers bytes to a peer. LAN, BLE or relay drivers implement this.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_to_peer(&self, node_id: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Bytes received from a peer, stamped with the transport-level sender.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: String,
    pub bytes: Vec<u8>,
}

/// In-process switchboard connecting any number of [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inboxes: Arc<RwLock<HashMap<String, mpsc::Sender<Envelope>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node. Returns its transport and the receiving end of its inbox.
    pub fn register(&self, node_id: impl Into<String>) -> (MemoryTransport, mpsc::Receiver<Envelope>) {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::channel(256);
        self.inboxes.write().insert(node_id.clone(), tx);
        let transport = MemoryTransport {
            hub: self.clone(),
            local_id: node_id,
        };
        (transport, rx)
    }

    /// Detach a node; later sends to it fail as unreachable.
    pub fn unregister(&self, node_id: &str) {
        self.inboxes.write().remove(node_id);
    }

    pub fn is_registered(&self, node_id: &str) -> bool {
        self.inboxes.read().contains_key(node_id)
    }
}

/// One node's handle on a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    local_id: String,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn send_to_peer(&self, node_id: &str, bytes: Vec<u8>) -> Result<()> {
        // Clone the sender out so the lock is not held across the await.
        let inbox = self.hub.inboxes.read().get(node_id).cloned();
        let inbox = inbox.ok_or_else(|| AtmoError::PeerUnreachable(node_id.to_string()))?;
        let len = bytes.len();
        inbox
            .send(Envelope {
                from: self.local_id.clone(),
                bytes,
            })
            .await
            .map_err(|_| AtmoError::PeerUnreachable(node_id.to_string()))?;
        debug!(from = %short_id(&self.local_id), to = %short_id(node_id), len, "delivered in-memory message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_is_stamped_with_sender() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.register("a");
        let (_b, mut b_rx) = hub.register("b");

        a.send_to_peer("b", b"hi".to_vec()).await.unwrap();
        let env = b_rx.recv().await.unwrap();
        assert_eq!(env.from, "a");
        assert_eq!(env.bytes, b"hi");
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unreachable() {
        let hub = MemoryHub::new();
        let (a, _rx) = hub.register("a");
        assert!(matches!(
            a.send_to_peer("ghost", vec![]).await,
            Err(AtmoError::PeerUnreachable(_))
        ));

        let (_b, _b_rx) = hub.register("b");
        hub.unregister("b");
        assert!(!hub.is_registered("b"));
        assert!(a.send_to_peer("b", vec![]).await.is_err());
    }
}
