#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use atmo_config::AtmoConfig;
    use atmo_core::{AtmoError, Event, Result, TokenRejection};
    use atmo_identity::{IdentityStore, KeyAlgorithm, MemoryKeyStore};
    use atmo_mesh::{CapabilityEntry, CapabilityFilter, MemoryHub};
    use atmo_runtime::*;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn config(mesh_id: &str, name: &str) -> AtmoConfig {
        let mut config = AtmoConfig::default();
        config.node.mesh_id = mesh_id.into();
        config.node.name = name.into();
        config.mailbox.poll_interval_ms = 20;
        config
    }

    fn identity() -> Arc<IdentityStore> {
        Arc::new(IdentityStore::load_or_create(
            &MemoryKeyStore::new(),
            KeyAlgorithm::Ed25519,
        ))
    }

    fn node(config: AtmoConfig, identity: Arc<IdentityStore>, store: Arc<dyn ReplicatedStore>, hub: &MemoryHub) -> AtmosphereNode {
        let (transport, inbox) = hub.register(identity.node_id());
        let node = AtmosphereNode::new(config, identity, store, Arc::new(transport)).unwrap();
        node.attach_inbox(inbox);
        node
    }

    fn single(store: Arc<dyn ReplicatedStore>) -> AtmosphereNode {
        node(config("home", "solo"), identity(), store, &MemoryHub::new())
    }

    /// Answers every request addressed to `owner` by echoing its payload.
    fn spawn_responder(store: Arc<MemoryStore>, owner: &str) -> JoinHandle<()> {
        let owner = owner.to_string();
        let mailbox = Mailbox::new(store, owner.clone(), Duration::from_millis(10));
        tokio::spawn(async move {
            loop {
                for request in mailbox.pending_for(&owner).await.unwrap() {
                    mailbox
                        .respond(&request, json!({ "echo": request.payload.clone() }), RecordStatus::Completed)
                        .await
                        .unwrap();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    }

    struct BrokenStore;

    #[async_trait]
    impl ReplicatedStore for BrokenStore {
        async fn insert(&self, _collection: &str, _id: &str, _document: Value) -> Result<bool> {
            Err(AtmoError::Io(std::io::Error::other("disk full")))
        }

        async fn query(&self, _collection: &str) -> Result<Vec<Value>> {
            Ok(vec![])
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // ── Mailbox timing ─────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_await_times_out_after_window() {
        let store = Arc::new(MemoryStore::new());
        let mailbox = Mailbox::new(store.clone(), "node-a", Duration::from_millis(500));
        let id = mailbox
            .submit(json!("hi"), &CapabilityEntry::new("llm-1", "node-b", "llm"))
            .await
            .unwrap();

        let started = Instant::now();
        let err = mailbox
            .await_response(&id, Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(2), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2500), "returned late: {elapsed:?}");
        match err {
            AtmoError::Timeout { request_id, waited_ms } => {
                assert_eq!(request_id, id);
                assert!(waited_ms >= 2000);
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_waiting_and_keeps_request() {
        let store = Arc::new(MemoryStore::new());
        let mailbox = Mailbox::new(store.clone(), "node-a", Duration::from_millis(500));
        let id = mailbox
            .submit(json!("hi"), &CapabilityEntry::new("llm-1", "node-b", "llm"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = mailbox
            .await_response(&id, Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AtmoError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(store.get(REQUESTS, &id).is_some());
        assert_eq!(mailbox.pending_for("node-b").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_waits_for_cancel() {
        let store = Arc::new(MemoryStore::new());
        let mailbox = Mailbox::new(store.clone(), "node-a", Duration::from_millis(500));
        let id = mailbox
            .submit(json!("hi"), &CapabilityEntry::new("llm-1", "node-b", "llm"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = mailbox
            .await_response(&id, Duration::MAX, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AtmoError::Cancelled));
    }

    #[tokio::test]
    async fn test_response_written_later_is_picked_up() {
        let store = Arc::new(MemoryStore::new());
        let caller = Mailbox::new(store.clone(), "node-a", Duration::from_secs(10));
        let id = caller
            .submit(json!("hi"), &CapabilityEntry::new("llm-1", "node-b", "llm"))
            .await
            .unwrap();
        let responder = spawn_responder(store.clone(), "node-b");

        // The poll interval is long; the store notification wakes the waiter.
        let response = caller
            .await_response(&id, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        responder.abort();

        assert_eq!(response.request_id, id);
        assert_eq!(response.source_node_id, "node-b");
        assert_eq!(response.payload, json!({ "echo": "hi" }));
        assert!(caller.pending_for("node-b").await.unwrap().is_empty());
    }

    // ── Sessions through the node ──────────────────────────────

    #[tokio::test]
    async fn test_submit_and_await_completes() {
        let store = Arc::new(MemoryStore::new());
        let node = single(store.clone());
        let mut events = node.events().subscribe();
        node.on_capability_advertisement(
            CapabilityEntry::new("llm-1", "node-b", "llm")
                .with_tags(["chat"])
                .with_hop_count(1),
        )
        .unwrap();
        let responder = spawn_responder(store.clone(), "node-b");

        let response = node
            .submit_and_await(
                "chat",
                &CapabilityFilter::of_type("llm"),
                json!({ "prompt": "hello" }),
                Some(Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        responder.abort();

        assert_eq!(response.payload["echo"]["prompt"], "hello");
        let sessions = node.sessions().list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, SessionState::Completed);
        assert_eq!(
            sessions[0].decision.as_ref().unwrap().capability.capability_id,
            "llm-1"
        );
        assert_eq!(node.sessions().active_count(), 0);

        match events.recv().await.unwrap() {
            Event::RouteDecided { capability_id, match_method, .. } => {
                assert_eq!(capability_id, "llm-1");
                assert_eq!(match_method, "exact");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_candidate_fails_session() {
        let node = single(Arc::new(MemoryStore::new()));
        let err = node
            .submit_and_await(
                "chat",
                &CapabilityFilter::any(),
                json!({}),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AtmoError::NoCandidateCapability(_)));

        let session = &node.sessions().list()[0];
        assert_eq!(session.state, SessionState::Failed);
        assert!(session.error.is_some());
        assert!(node.route("chat", &CapabilityFilter::any()).is_none());
    }

    #[tokio::test]
    async fn test_mailbox_write_failure_fails_session() {
        let node = single(Arc::new(BrokenStore));
        node.on_capability_advertisement(CapabilityEntry::new("llm-1", "node-b", "llm"))
            .unwrap();
        let err = node
            .submit_and_await(
                "chat",
                &CapabilityFilter::any(),
                json!({}),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AtmoError::MailboxWrite(_)));
        assert_eq!(node.sessions().list()[0].state, SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out_session() {
        let node = single(Arc::new(MemoryStore::new()));
        node.on_capability_advertisement(CapabilityEntry::new("llm-1", "node-b", "llm"))
            .unwrap();
        let err = node
            .submit_and_await(
                "chat",
                &CapabilityFilter::any(),
                json!({}),
                Some(Duration::from_secs(2)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AtmoError::Timeout { .. }));
        let session = &node.sessions().list()[0];
        assert_eq!(session.state, SessionState::TimedOut);
        assert!(session.request_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_cancels_session() {
        let node = single(Arc::new(MemoryStore::new()));
        node.on_capability_advertisement(CapabilityEntry::new("llm-1", "node-b", "llm"))
            .unwrap();

        let cancel = CancellationToken::new();
        let waited = tokio::time::timeout(
            Duration::from_millis(100),
            node.submit_and_await(
                "chat",
                &CapabilityFilter::any(),
                json!({}),
                Some(Duration::from_secs(30)),
                &cancel,
            ),
        )
        .await;
        assert!(waited.is_err());

        let session = &node.sessions().list()[0];
        assert_eq!(session.state, SessionState::Cancelled);
        assert!(session.request_id.is_some());
        assert_eq!(node.sessions().active_count(), 0);
    }

    // ── Tokens through the node ────────────────────────────────

    #[tokio::test]
    async fn test_founder_issues_and_verifies() {
        let node = single(Arc::new(MemoryStore::new()));
        assert!(!node.can_issue());
        assert!(node.issue_token(Some("someone"), ["member"], None).is_none());

        node.found_mesh().unwrap();
        assert!(node.can_issue());
        let issued = node
            .issue_token(Some("someone"), ["member"], Some(Duration::from_secs(60)))
            .unwrap();
        let outcome = node.verify_token(&issued.encoded);
        assert!(outcome.valid, "{:?}", outcome.reason);
        assert!(outcome.token.unwrap().has_capability("member"));
        assert!(node.trusted_issuers().contains(node.node_id()));
    }

    #[tokio::test]
    async fn test_unsigned_node_cannot_found() {
        let unsigned = Arc::new(IdentityStore::load_or_create_with_schemes(
            &MemoryKeyStore::new(),
            &[],
        ));
        let node = node(
            config("home", "unsigned"),
            unsigned,
            Arc::new(MemoryStore::new()),
            &MemoryHub::new(),
        );
        assert!(matches!(node.found_mesh(), Err(AtmoError::Signing(_))));
        assert!(node.issue_token(None, ["member"], None).is_none());
    }

    #[tokio::test]
    async fn test_join_with_delegated_token() {
        let founder = single(Arc::new(MemoryStore::new()));
        founder.found_mesh().unwrap();
        let founder_key = founder.identity().public_key().unwrap().to_string();

        let mut deputy_config = config("home", "deputy");
        deputy_config.token.trusted_issuers = vec![founder_key];
        let deputy_identity = identity();
        let deputy = node(
            deputy_config,
            Arc::clone(&deputy_identity),
            Arc::new(MemoryStore::new()),
            &MemoryHub::new(),
        );

        let for_someone_else = founder.issue_token(Some("other-node"), ["issuer"], None).unwrap();
        assert!(matches!(
            deputy.join_with_token(&for_someone_else.encoded),
            Err(AtmoError::TokenInvalid {
                reason: TokenRejection::SubjectMismatch
            })
        ));

        let grant = founder
            .issue_token(Some(deputy.node_id()), ["issuer"], None)
            .unwrap();
        deputy.join_with_token(&grant.encoded).unwrap();
        assert!(deputy.can_issue());

        let minted = deputy.issue_token(None, ["member"], None).unwrap();
        let outcome = deputy.verify_token_with(&minted.encoded, deputy_identity.public_key().unwrap());
        assert!(outcome.valid);
        assert!(minted.token.expires_at <= grant.token.expires_at);
    }

    // ── Lifecycle ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let node = single(Arc::new(MemoryStore::new()));
        let mut events = node.events().subscribe();
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(node.stop().await.is_err());

        node.start().unwrap();
        assert_eq!(node.state(), NodeState::Running);
        assert!(matches!(node.start(), Err(AtmoError::InvalidState(_))));

        node.stop().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);

        let mut saw_started = false;
        let mut saw_stopped = false;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::NodeStarted { .. } => saw_started = true,
                Event::NodeStopped { .. } => saw_stopped = true,
                _ => {}
            }
        }
        assert!(saw_started && saw_stopped);
    }

    #[tokio::test]
    async fn test_zero_gossip_interval_is_rejected() {
        let mut config = config("home", "solo");
        config.table.gossip_interval_secs = 0;
        let (transport, _inbox) = MemoryHub::new().register("solo");
        let result = AtmosphereNode::new(
            config,
            identity(),
            Arc::new(MemoryStore::new()),
            Arc::new(transport),
        );
        assert!(matches!(result, Err(AtmoError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_node_prunes_finished_sessions() {
        let mut config = config("home", "solo");
        config.mailbox.session_max_age_secs = 0;
        let node = node(config, identity(), Arc::new(MemoryStore::new()), &MemoryHub::new());

        let finished = node.sessions().create("done");
        node.sessions().transition(&finished, SessionState::Failed).unwrap();
        let live = node.sessions().create("live");
        std::thread::sleep(Duration::from_millis(5));

        node.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(node.sessions().get(&finished).is_none());
        assert!(node.sessions().get(&live).is_some());
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_running_node_sweeps_stale_entries() {
        let node = single(Arc::new(MemoryStore::new()));
        node.on_capability_advertisement(
            CapabilityEntry::new("old", "node-b", "llm")
                .with_last_seen(chrono::Utc::now() - chrono::Duration::seconds(600)),
        )
        .unwrap();
        node.on_capability_advertisement(CapabilityEntry::new("new", "node-c", "llm"))
            .unwrap();

        node.start().unwrap();
        let snapshot_node = &node;
        eventually(|| snapshot_node.capability_table_snapshot().len() == 1).await;
        assert_eq!(node.capability_table_snapshot()[0].capability_id, "new");
        node.stop().await.unwrap();
    }

    // ── Two nodes ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_two_nodes_route_and_exchange_over_mesh() {
        let hub = MemoryHub::new();
        let replicated = Arc::new(MemoryStore::new());

        let a_identity = identity();
        let a = node(config("home", "laptop"), Arc::clone(&a_identity), replicated.clone(), &hub);
        a.found_mesh().unwrap();

        let mut b_config = config("home", "phone");
        b_config.token.trusted_issuers = vec![a_identity.public_key().unwrap().to_string()];
        let b = node(b_config, identity(), replicated.clone(), &hub);
        let membership = a.issue_token(Some(b.node_id()), ["member"], None).unwrap();
        b.join_with_token(&membership.encoded).unwrap();
        b.register_capability(CapabilityEntry::new("llm-1", "-", "llm").with_tags(["chat"]))
            .unwrap();

        a.start().unwrap();
        b.start().unwrap();
        a.mesh().connect(b.node_id()).await.unwrap();

        let b_id = b.node_id().to_string();
        eventually(|| {
            a.capability_table_snapshot()
                .iter()
                .any(|e| e.owner_node_id == b_id)
        })
        .await;
        let responder = spawn_responder(replicated.clone(), &b_id);

        let response = a
            .submit_and_await(
                "chat with me",
                &CapabilityFilter::of_type("llm"),
                json!("ping"),
                Some(Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        responder.abort();

        assert_eq!(response.source_node_id, b_id);
        assert_eq!(response.payload, json!({ "echo": "ping" }));
        let decision = a.sessions().list()[0].decision.clone().unwrap();
        assert_eq!(decision.capability.hop_count, 1);
        assert_eq!(decision.capability.owner_node_name, "phone");

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }
}
