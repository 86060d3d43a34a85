use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use atmo_config::AtmoConfig;
use atmo_core::{AtmoError, CAP_FOUNDER, Event, EventBus, Result, TokenRejection, short_id};
use atmo_identity::{
    FileKeyStore, IdentityStore, IssuedToken, KeyAlgorithm, MembershipToken, PublicKey, TokenIssuer,
    TokenVerifier, TrustedIssuers, VerificationOutcome,
};
use atmo_mesh::{
    CapabilityEntry, CapabilityFilter, CapabilityTable, Envelope, IngestOutcome, MeshNode, MeshSettings,
    PeerTransport, spawn_sweeper,
};
use atmo_router::{RoutingDecision, SemanticRouter};

use crate::mailbox::{Mailbox, MailboxRecord, RecordStatus};
use crate::session::{SessionManager, SessionState};
use crate::store::{MemoryStore, ReplicatedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NodeState::Stopped => "stopped",
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
        })
    }
}

/// Moves a session still in flight to `Cancelled` when dropped.
struct InFlight<'a> {
    sessions: &'a SessionManager,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.sessions.state(&self.id).is_some_and(|s| !s.is_terminal()) {
            let result = self.sessions.transition_with(&self.id, SessionState::Cancelled, |s| {
                s.error = Some("request abandoned by caller".into())
            });
            if let Err(e) = result {
                debug!(session_id = %self.id, error = %e, "abandoned session not updated");
            }
        }
    }
}

/// One node of the mesh, as the application layer sees it.
pub struct AtmosphereNode {
    config: AtmoConfig,
    identity: Arc<IdentityStore>,
    trusted: TrustedIssuers,
    verifier: TokenVerifier,
    /// Present once this node has founded its mesh or holds a delegated grant.
    issuer: RwLock<Option<Arc<TokenIssuer>>>,
    mesh: Arc<MeshNode>,
    router: SemanticRouter,
    mailbox: Mailbox,
    sessions: SessionManager,
    events: EventBus,
    state: RwLock<NodeState>,
    inbox: Mutex<Option<mpsc::Receiver<Envelope>>>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AtmosphereNode {
    pub fn new(
        config: AtmoConfig,
        identity: Arc<IdentityStore>,
        store: Arc<dyn ReplicatedStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        for warning in config.validate().map_err(AtmoError::Config)? {
            warn!(field = %warning.field, "{}", warning.message);
        }

        let events = EventBus::default();
        let trusted = TrustedIssuers::from_config(&config.token.trusted_issuers);
        let table = Arc::new(CapabilityTable::new());
        let settings = MeshSettings {
            name: config.node.name.clone(),
            mesh_id: config.node.mesh_id.clone(),
            max_peers: config.node.max_peers,
            max_relay_hops: config.table.max_relay_hops,
        };
        let mesh = Arc::new(MeshNode::new(
            Arc::clone(&identity),
            settings,
            Arc::clone(&table),
            transport,
            trusted.clone(),
            events.clone(),
        ));

        Ok(Self {
            verifier: TokenVerifier::new(config.node.mesh_id.clone()),
            router: SemanticRouter::new(table, config.routing.clone()),
            mailbox: Mailbox::new(store, identity.node_id(), config.mailbox.poll_interval()),
            sessions: SessionManager::new(events.clone()),
            issuer: RwLock::new(None),
            state: RwLock::new(NodeState::Stopped),
            inbox: Mutex::new(None),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            config,
            identity,
            trusted,
            mesh,
            events,
        })
    }

    /// Load (or create) the identity in the configured key file and use an
    /// in-memory mailbox store.
    pub fn open(config: AtmoConfig, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        let algorithm: KeyAlgorithm = config.identity.algorithm.parse()?;
        let identity = Arc::new(IdentityStore::load_or_create(
            &FileKeyStore::new(config.key_file()),
            algorithm,
        ));
        Self::new(config, identity, Arc::new(MemoryStore::new()), transport)
    }

    /// Deliveries from the transport, consumed by the next `start`.
    pub fn attach_inbox(&self, inbox: mpsc::Receiver<Envelope>) {
        *self.inbox.lock() = Some(inbox);
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn node_id(&self) -> &str {
        self.identity.node_id()
    }

    pub fn mesh_id(&self) -> &str {
        &self.config.node.mesh_id
    }

    pub fn config(&self) -> &AtmoConfig {
        &self.config
    }

    pub fn identity(&self) -> &Arc<IdentityStore> {
        &self.identity
    }

    pub fn mesh(&self) -> &Arc<MeshNode> {
        &self.mesh
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn trusted_issuers(&self) -> &TrustedIssuers {
        &self.trusted
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn can_issue(&self) -> bool {
        self.issuer.read().is_some()
    }

    // ── Membership ─────────────────────────────────────────────

    /// Become the founder of the configured mesh: trust our own key and
    /// hold a founder token for ourselves.
    pub fn found_mesh(&self) -> Result<IssuedToken> {
        if self.mesh_id().trim().is_empty() {
            return Err(AtmoError::ConfigValidation {
                field: "node.mesh_id".into(),
                reason: "a mesh needs an id before it can be founded".into(),
            });
        }
        let key = self
            .identity
            .public_key()
            .cloned()
            .ok_or_else(|| AtmoError::Signing("an unsigned node cannot found a mesh".into()))?;

        let issuer = Arc::new(TokenIssuer::founder(Arc::clone(&self.identity), self.mesh_id()));
        let issued = issuer.try_issue(
            Some(self.node_id()),
            self.mesh_id(),
            [CAP_FOUNDER],
            Duration::from_secs(self.config.token.default_ttl_secs),
        )?;
        self.trusted.add(key);
        self.mesh.set_membership_token(issued.encoded.clone());
        *self.issuer.write() = Some(issuer);

        info!(mesh_id = %self.mesh_id(), node_id = %short_id(self.node_id()), "founded mesh");
        Ok(issued)
    }

    /// Adopt a membership token issued to this node by a trusted issuer.
    ///
    /// A token that grants `issuer` or `founder` also lets this node issue.
    pub fn join_with_token(&self, encoded: &str) -> Result<MembershipToken> {
        let token = self.verifier.verify_trusted(encoded, &self.trusted).into_result()?;
        if let Some(ref subject) = token.subject_node_id
            && subject != self.node_id()
        {
            return Err(AtmoError::token(TokenRejection::SubjectMismatch));
        }

        self.mesh.set_membership_token(encoded);
        if token.grants_issuance() && token.subject_node_id.as_deref() == Some(self.node_id()) {
            let issuer = TokenIssuer::delegated(Arc::clone(&self.identity), token.clone())?;
            *self.issuer.write() = Some(Arc::new(issuer));
        }
        info!(
            mesh_id = %token.mesh_id,
            issuer = %short_id(&token.issuer_id),
            expires_at = token.expires_at,
            "joined mesh"
        );
        Ok(token)
    }

    /// Mint a token for this mesh. `None` when this node has no key or no
    /// issuing authority; the reason is logged.
    pub fn issue_token<I, S>(
        &self,
        subject_node_id: Option<&str>,
        capabilities: I,
        ttl: Option<Duration>,
    ) -> Option<IssuedToken>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let issuer = self.issuer.read().clone();
        let Some(issuer) = issuer else {
            warn!(mesh_id = %self.mesh_id(), "token not issued: node holds no issuing authority");
            return None;
        };
        let ttl = ttl.unwrap_or(Duration::from_secs(self.config.token.default_ttl_secs));
        issuer.issue(subject_node_id, self.mesh_id(), capabilities, ttl)
    }

    /// Check a token for this mesh against the trusted issuer roster.
    pub fn verify_token(&self, encoded: &str) -> VerificationOutcome {
        self.verifier.verify_trusted(encoded, &self.trusted)
    }

    /// Check a token for this mesh against an explicit issuer key.
    pub fn verify_token_with(&self, encoded: &str, issuer_key: &PublicKey) -> VerificationOutcome {
        self.verifier.verify(encoded, issuer_key)
    }

    // ── Capabilities ───────────────────────────────────────────

    pub fn register_capability(&self, entry: CapabilityEntry) -> Result<()> {
        self.mesh.register_local(entry)
    }

    pub fn on_capability_advertisement(&self, entry: CapabilityEntry) -> Result<IngestOutcome> {
        self.mesh.on_capability_advertisement(entry)
    }

    pub fn capability_table_snapshot(&self) -> Vec<CapabilityEntry> {
        self.mesh.table().snapshot()
    }

    // ── Routing ────────────────────────────────────────────────

    /// Pick a capability for `query`. `None` when nothing is available.
    pub fn route(&self, query: &str, filter: &CapabilityFilter) -> Option<RoutingDecision> {
        let decision = self.router.route(query, filter)?;
        self.events.publish(Event::RouteDecided {
            query: query.to_string(),
            capability_id: decision.capability.capability_id.clone(),
            owner_node_id: decision.capability.owner_node_id.clone(),
            match_method: decision.match_method.to_string(),
            composite_score: decision.score_breakdown.composite_score,
        });
        Some(decision)
    }

    /// Route `query`, hand `payload` to the chosen capability, and wait for
    /// its response.
    ///
    /// Uses the configured default timeout when `timeout` is `None`. The
    /// session records the outcome; nothing is retried. Dropping the returned
    /// future leaves the session `Cancelled`, the same as firing `cancel`.
    pub async fn submit_and_await(
        &self,
        query: &str,
        filter: &CapabilityFilter,
        payload: Value,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<MailboxRecord> {
        let session_id = self.sessions.create(query);
        let _in_flight = InFlight {
            sessions: &self.sessions,
            id: session_id.clone(),
        };

        let Some(decision) = self.route(query, filter) else {
            let err = AtmoError::NoCandidateCapability(format!("nothing can serve '{query}'"));
            self.fail_session(&session_id, SessionState::Failed, &err);
            return Err(err);
        };
        let target = decision.capability.clone();
        self.sessions
            .transition_with(&session_id, SessionState::Routed, |s| s.decision = Some(decision))?;

        let request_id = match self.mailbox.submit(payload, &target).await {
            Ok(id) => id,
            Err(e) => {
                self.fail_session(&session_id, SessionState::Failed, &e);
                return Err(e);
            }
        };
        self.sessions.transition_with(&session_id, SessionState::Pending, |s| {
            s.request_id = Some(request_id.clone())
        })?;

        let timeout = timeout.unwrap_or(self.config.mailbox.default_timeout());
        match self.mailbox.await_response(&request_id, timeout, cancel).await {
            Ok(response) => {
                let next = match response.status {
                    RecordStatus::Failed => SessionState::Failed,
                    _ => SessionState::Completed,
                };
                let payload = response.payload.clone();
                self.sessions
                    .transition_with(&session_id, next, |s| s.response = Some(payload))?;
                Ok(response)
            }
            Err(e) => {
                let next = match e {
                    AtmoError::Timeout { .. } => SessionState::TimedOut,
                    AtmoError::Cancelled => SessionState::Cancelled,
                    _ => SessionState::Failed,
                };
                self.fail_session(&session_id, next, &e);
                Err(e)
            }
        }
    }

    fn fail_session(&self, session_id: &str, next: SessionState, err: &AtmoError) {
        debug!(session_id, state = %next, retryable = err.is_retryable(), error = %err, "session ended without a response");
        let message = err.to_string();
        if let Err(e) = self
            .sessions
            .transition_with(session_id, next, |s| s.error = Some(message))
        {
            warn!(session_id, error = %e, "session not updated");
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Spawn the sweeper, gossip, session cleanup and inbox tasks.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != NodeState::Stopped {
                return Err(AtmoError::InvalidState(format!("cannot start while {}", *state)));
            }
            *state = NodeState::Starting;
        }

        let cancel = CancellationToken::new();
        let table = Arc::clone(self.mesh.table());
        let mut tasks = vec![
            spawn_sweeper(
                table,
                self.config.table.sweep_interval(),
                self.config.table.staleness_ttl(),
                self.events.clone(),
                cancel.clone(),
            ),
            self.mesh
                .spawn_gossip(self.config.table.gossip_interval(), cancel.clone()),
            self.sessions.spawn_cleanup(
                self.config.table.sweep_interval(),
                self.config.mailbox.session_max_age(),
                cancel.clone(),
            ),
        ];
        let inbox = self.inbox.lock().take();
        match inbox {
            Some(inbox) => tasks.push(self.mesh.spawn_inbox(inbox, cancel.clone())),
            None => debug!("no transport inbox attached"),
        }
        *self.cancel.lock() = Some(cancel);
        *self.tasks.lock() = tasks;
        *self.state.write() = NodeState::Running;

        self.events.publish(Event::NodeStarted {
            node_id: self.node_id().to_string(),
            at: chrono::Utc::now(),
        });
        info!(
            node_id = %short_id(self.node_id()),
            name = %self.config.node.name,
            mesh_id = %self.mesh_id(),
            "node started"
        );
        Ok(())
    }

    /// Say goodbye to peers and stop background tasks.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != NodeState::Running {
                return Err(AtmoError::InvalidState(format!("cannot stop while {}", *state)));
            }
            *state = NodeState::Stopping;
        }

        self.mesh.leave("node stopping").await;
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        *self.state.write() = NodeState::Stopped;
        self.events.publish(Event::NodeStopped {
            node_id: self.node_id().to_string(),
        });
        info!(node_id = %short_id(self.node_id()), "node stopped");
        Ok(())
    }
}
