use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use atmo_core::{AtmoError, Event, EventBus, Result, TokenRejection, short_id, unix_now};
use atmo_identity::{IdentityStore, PublicKey, TokenVerifier, TrustedIssuers};

use crate::capability::{CapabilityEntry, CapabilityTable, IngestOutcome};
use crate::load::{PlatformMetrics, estimate_load};
use crate::protocol::GossipMessage;
use crate::sweeper::tick_period;
use crate::transport::{Envelope, PeerTransport};

/// Static parameters of a mesh node.
#[derive(Debug, Clone)]
pub struct MeshSettings {
    pub name: String,
    pub mesh_id: String,
    pub max_peers: usize,
    /// Relayed entries beyond this distance are neither ingested nor forwarded.
    pub max_relay_hops: u32,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            name: "atmosphere-node".into(),
            mesh_id: String::new(),
            max_peers: 50,
            max_relay_hops: 4,
        }
    }
}

/// An admitted peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub name: String,
    pub public_key: Option<PublicKey>,
    /// Capabilities granted by the peer's membership token.
    pub granted: BTreeSet<String>,
    pub token_expires_at: i64,
    pub admitted_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// This node's view of the mesh: who is admitted, and what they offer.
///
/// No gossip is ingested from a peer until its membership token has been
/// verified against a trusted issuer for our mesh.
pub struct MeshNode {
    identity: Arc<IdentityStore>,
    settings: MeshSettings,
    verifier: TokenVerifier,
    trusted: TrustedIssuers,
    table: Arc<CapabilityTable>,
    transport: Arc<dyn PeerTransport>,
    events: EventBus,
    metrics: Option<Arc<dyn PlatformMetrics>>,
    /// Our own membership token, presented in every Hello.
    membership: RwLock<Option<String>>,
    peers: RwLock<HashMap<String, PeerInfo>>,
    /// Capabilities this node offers, by capability id.
    local: RwLock<HashMap<String, CapabilityEntry>>,
    sequence: AtomicU64,
}

impl MeshNode {
    pub fn new(
        identity: Arc<IdentityStore>,
        settings: MeshSettings,
        table: Arc<CapabilityTable>,
        transport: Arc<dyn PeerTransport>,
        trusted: TrustedIssuers,
        events: EventBus,
    ) -> Self {
        Self {
            verifier: TokenVerifier::new(settings.mesh_id.clone()),
            identity,
            settings,
            trusted,
            table,
            transport,
            events,
            metrics: None,
            membership: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            local: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Refresh local `load` from these metrics on every advert.
    pub fn with_metrics(mut self, metrics: Arc<dyn PlatformMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn node_id(&self) -> &str {
        self.identity.node_id()
    }

    pub fn mesh_id(&self) -> &str {
        &self.settings.mesh_id
    }

    pub fn table(&self) -> &Arc<CapabilityTable> {
        &self.table
    }

    pub fn trusted_issuers(&self) -> &TrustedIssuers {
        &self.trusted
    }

    pub fn set_membership_token(&self, encoded: impl Into<String>) {
        *self.membership.write() = Some(encoded.into());
    }

    pub fn membership_token(&self) -> Option<String> {
        self.membership.read().clone()
    }

    // ── Peers ──────────────────────────────────────────────────

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    pub fn is_admitted(&self, node_id: &str) -> bool {
        self.peers.read().contains_key(node_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Start the handshake with a peer the transport can reach.
    pub async fn connect(&self, node_id: &str) -> Result<()> {
        if self.membership.read().is_none() {
            warn!(peer = %short_id(node_id), "connecting without a membership token, the peer will refuse us");
        }
        self.send(node_id, &self.hello(false)).await
    }

    /// Forget a peer and everything it advertised.
    pub fn remove_peer(&self, node_id: &str, reason: &str) -> bool {
        if self.peers.write().remove(node_id).is_none() {
            return false;
        }
        let dropped = self.table.remove_owner(node_id);
        info!(peer = %short_id(node_id), reason, dropped, "mesh peer left");
        self.events.publish(Event::PeerLeft {
            node_id: node_id.to_string(),
            reason: reason.to_string(),
        });
        true
    }

    /// Say goodbye to every peer and drop them.
    pub async fn leave(&self, reason: &str) {
        let goodbye = GossipMessage::Goodbye {
            node_id: self.node_id().to_string(),
            reason: reason.to_string(),
        };
        let peers: Vec<String> = self.peers.write().drain().map(|(id, _)| id).collect();
        for peer in peers {
            if let Err(e) = self.send(&peer, &goodbye).await {
                debug!(peer = %short_id(&peer), error = %e, "goodbye not delivered");
            }
        }
    }

    fn hello(&self, reply: bool) -> GossipMessage {
        GossipMessage::Hello {
            node_id: self.node_id().to_string(),
            name: self.settings.name.clone(),
            public_key: self.identity.public_key().cloned(),
            token: self.membership_token(),
            reply,
        }
    }

    /// Verify a peer's Hello and record it. `Ok(true)` when newly admitted.
    fn admit(
        &self,
        node_id: &str,
        name: &str,
        public_key: Option<PublicKey>,
        token: Option<&str>,
    ) -> Result<bool> {
        if let Some(peer) = self.peers.write().get_mut(node_id) {
            peer.last_seen = Utc::now();
            return Ok(false);
        }

        let token = token.ok_or_else(|| AtmoError::PeerNotAdmitted("no membership token presented".into()))?;
        if let Some(ref key) = public_key
            && key.node_id() != node_id
        {
            return Err(AtmoError::PeerNotAdmitted(
                "public key does not belong to the claimed node id".into(),
            ));
        }

        let token = self.verifier.verify_trusted(token, &self.trusted).into_result()?;
        if let Some(ref subject) = token.subject_node_id
            && subject != node_id
        {
            return Err(AtmoError::token(TokenRejection::SubjectMismatch));
        }

        let now = Utc::now();
        {
            let mut peers = self.peers.write();
            if peers.len() >= self.settings.max_peers {
                return Err(AtmoError::PeerNotAdmitted(format!(
                    "peer limit of {} reached",
                    self.settings.max_peers
                )));
            }
            peers.insert(
                node_id.to_string(),
                PeerInfo {
                    node_id: node_id.to_string(),
                    name: name.to_string(),
                    public_key,
                    granted: token.capabilities.clone(),
                    token_expires_at: token.expires_at,
                    admitted_at: now,
                    last_seen: now,
                },
            );
        }

        info!(peer = %short_id(node_id), name, "admitted mesh peer");
        self.events.publish(Event::PeerAdmitted {
            node_id: node_id.to_string(),
            name: name.to_string(),
        });
        Ok(true)
    }

    fn touch(&self, node_id: &str) -> Result<()> {
        match self.peers.write().get_mut(node_id) {
            Some(peer) => {
                peer.last_seen = Utc::now();
                Ok(())
            }
            None => Err(AtmoError::PeerNotAdmitted(node_id.to_string())),
        }
    }

    // ── Incoming gossip ────────────────────────────────────────

    /// Handle bytes delivered by the transport.
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<()> {
        let message = GossipMessage::from_bytes(&envelope.bytes)?;
        if message.sender() != envelope.from {
            warn!(
                from = %short_id(&envelope.from),
                claimed = %short_id(message.sender()),
                "message sender does not match transport peer"
            );
            return Err(AtmoError::PeerNotAdmitted(format!(
                "{} sent a message claiming to be {}",
                envelope.from,
                message.sender()
            )));
        }
        self.handle_message(message).await
    }

    pub async fn handle_message(&self, message: GossipMessage) -> Result<()> {
        debug!(kind = message.kind(), from = %short_id(message.sender()), "gossip message");
        match message {
            GossipMessage::Hello {
                node_id,
                name,
                public_key,
                token,
                reply,
            } => {
                if node_id == self.node_id() {
                    return Ok(());
                }
                let admitted = self.admit(&node_id, &name, public_key, token.as_deref());
                let newly = match admitted {
                    Ok(newly) => newly,
                    Err(e) => {
                        warn!(peer = %short_id(&node_id), error = %e, "rejected mesh peer");
                        self.events.publish(Event::PeerRejected {
                            node_id: node_id.clone(),
                            reason: e.to_string(),
                        });
                        return Err(e);
                    }
                };
                if !reply {
                    self.send(&node_id, &self.hello(true)).await?;
                }
                if newly {
                    self.advertise_to(&node_id).await?;
                }
                Ok(())
            }
            GossipMessage::Capabilities { node_id, entries } => {
                self.ingest_advert(&node_id, entries).map(|_| ())
            }
            GossipMessage::Ping { node_id, timestamp } => {
                self.touch(&node_id)?;
                let pong = GossipMessage::Pong {
                    node_id: self.node_id().to_string(),
                    timestamp,
                };
                self.send(&node_id, &pong).await
            }
            GossipMessage::Pong { node_id, timestamp } => {
                self.touch(&node_id)?;
                debug!(peer = %short_id(&node_id), rtt_secs = unix_now() - timestamp, "pong");
                Ok(())
            }
            GossipMessage::Goodbye { node_id, reason } => {
                self.remove_peer(&node_id, &reason);
                Ok(())
            }
        }
    }

    /// Ingest a peer's advert. Returns how many entries changed the table.
    fn ingest_advert(&self, sender: &str, entries: Vec<serde_json::Value>) -> Result<usize> {
        self.touch(sender).inspect_err(|_| {
            debug!(peer = %short_id(sender), "ignoring capabilities from unadmitted node");
        })?;

        let mut changed = 0;
        for value in entries {
            let mut entry = match CapabilityEntry::from_json(value) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(peer = %short_id(sender), error = %e, "dropping malformed capability entry");
                    continue;
                }
            };
            if entry.owner_node_id == self.node_id() {
                continue;
            }
            let hops = entry.hop_count.saturating_add(1);
            if entry.owner_node_id != sender && hops > self.settings.max_relay_hops {
                debug!(capability_id = %entry.capability_id, hops, "relayed entry beyond hop budget");
                continue;
            }
            entry.hop_count = hops;
            match self.table.ingest(entry) {
                Ok(IngestOutcome::Inserted | IngestOutcome::Replaced) => changed += 1,
                Ok(IngestOutcome::Dropped) => {}
                Err(e) => warn!(peer = %short_id(sender), error = %e, "capability entry rejected"),
            }
        }
        debug!(peer = %short_id(sender), changed, "ingested capability advert");
        Ok(changed)
    }

    /// Direct ingestion hook for adverts arriving outside the gossip path.
    pub fn on_capability_advertisement(&self, entry: CapabilityEntry) -> Result<IngestOutcome> {
        self.table.ingest(entry)
    }

    // ── Local capabilities and adverts ─────────────────────────

    /// Offer a capability from this node. Owner fields are filled in.
    pub fn register_local(&self, mut entry: CapabilityEntry) -> Result<()> {
        entry.owner_node_id = self.node_id().to_string();
        entry.owner_node_name = self.settings.name.clone();
        entry.hop_count = 0;
        entry.last_seen = Utc::now();
        entry.sequence = self.next_sequence();
        let entry = entry.validate()?;
        info!(capability_id = %entry.capability_id, kind = %entry.capability_type, "registered local capability");
        self.local.write().insert(entry.capability_id.clone(), entry.clone());
        self.table.ingest(entry)?;
        Ok(())
    }

    pub fn unregister_local(&self, capability_id: &str) -> bool {
        let removed = self.local.write().remove(capability_id).is_some();
        if removed {
            self.table.remove(capability_id, self.node_id());
        }
        removed
    }

    pub fn local_capabilities(&self) -> Vec<CapabilityEntry> {
        let mut local: Vec<CapabilityEntry> = self.local.read().values().cloned().collect();
        local.sort_by(|a, b| a.capability_id.cmp(&b.capability_id));
        local
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Stamp local entries as fresh and put them back in our own table.
    fn refresh_local(&self) -> Vec<CapabilityEntry> {
        let load = self.metrics.as_deref().map(estimate_load);
        let now = Utc::now();
        let refreshed: Vec<CapabilityEntry> = {
            let mut local = self.local.write();
            local
                .values_mut()
                .map(|entry| {
                    entry.last_seen = now;
                    entry.sequence = self.next_sequence();
                    if let Some(load) = load {
                        entry.load = load;
                    }
                    entry.clone()
                })
                .collect()
        };
        for entry in &refreshed {
            if let Err(e) = self.table.ingest(entry.clone()) {
                warn!(capability_id = %entry.capability_id, error = %e, "local capability rejected");
            }
        }
        refreshed
    }

    /// Entries learned from others that may still travel one more hop.
    fn relayable(&self) -> Vec<CapabilityEntry> {
        self.table
            .snapshot()
            .into_iter()
            .filter(|e| e.owner_node_id != self.node_id() && e.hop_count < self.settings.max_relay_hops)
            .collect()
    }

    fn advert_for(&self, peer: &str, local: &[CapabilityEntry], relayed: &[CapabilityEntry]) -> GossipMessage {
        let entries = local
            .iter()
            .chain(relayed.iter().filter(|e| e.owner_node_id != peer))
            .filter_map(|e| serde_json::to_value(e).ok())
            .collect();
        GossipMessage::Capabilities {
            node_id: self.node_id().to_string(),
            entries,
        }
    }

    /// Send our current advert to one peer.
    pub async fn advertise_to(&self, peer: &str) -> Result<()> {
        let local = self.refresh_local();
        let relayed = self.relayable();
        let advert = self.advert_for(peer, &local, &relayed);
        self.send(peer, &advert).await
    }

    /// Refresh local entries and send adverts to every admitted peer.
    /// Returns how many peers were reached.
    pub async fn advertise(&self) -> usize {
        let local = self.refresh_local();
        let relayed = self.relayable();
        let peers: Vec<String> = self.peers.read().keys().cloned().collect();

        let mut reached = 0;
        for peer in &peers {
            let advert = self.advert_for(peer, &local, &relayed);
            match self.send(peer, &advert).await {
                Ok(()) => reached += 1,
                Err(e) => warn!(peer = %short_id(peer), error = %e, "advert not delivered"),
            }
        }
        debug!(local = local.len(), relayed = relayed.len(), reached, "advertised capabilities");
        reached
    }

    pub async fn ping(&self, node_id: &str) -> Result<()> {
        let ping = GossipMessage::Ping {
            node_id: self.node_id().to_string(),
            timestamp: unix_now(),
        };
        self.send(node_id, &ping).await
    }

    async fn send(&self, node_id: &str, message: &GossipMessage) -> Result<()> {
        let bytes = message.to_bytes()?;
        self.transport.send_to_peer(node_id, bytes).await
    }

    // ── Background tasks ───────────────────────────────────────

    /// Feed transport deliveries into the node until `cancel` fires.
    pub fn spawn_inbox(self: &Arc<Self>, mut inbox: mpsc::Receiver<Envelope>, cancel: CancellationToken) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = inbox.recv() => {
                        let Some(envelope) = received else { break };
                        let from = envelope.from.clone();
                        if let Err(e) = node.handle_envelope(envelope).await {
                            debug!(from = %short_id(&from), error = %e, "gossip message not handled");
                        }
                    }
                }
            }
            debug!(node_id = %short_id(node.node_id()), "mesh inbox closed");
        })
    }

    /// Re-advertise on a fixed interval until `cancel` fires.
    pub fn spawn_gossip(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let interval = tick_period(interval, "gossip");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        node.advertise().await;
                    }
                }
            }
        })
    }
}
