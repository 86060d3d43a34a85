use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use atmo_core::{AtmoError, Event, EventBus, Result, to_chrono};
use atmo_mesh::tick_period;
use atmo_router::RoutingDecision;

/// Where a routed request is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Routed,
    /// Submitted; waiting for a response.
    Pending,
    Completed,
    TimedOut,
    Failed,
    /// The caller stopped waiting. The request itself stays submitted.
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Routed => "routed",
            SessionState::Pending => "pending",
            SessionState::Completed => "completed",
            SessionState::TimedOut => "timed_out",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::TimedOut | SessionState::Failed | SessionState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Routed | Failed | Cancelled)
                | (Routed, Pending | Failed | Cancelled)
                | (Pending, Completed | TimedOut | Failed | Cancelled)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request, from routing to its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingSession {
    pub id: String,
    pub query: String,
    pub state: SessionState,
    pub decision: Option<RoutingDecision>,
    pub request_id: Option<String>,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoutingSession {
    pub fn new(query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            query: query.into(),
            state: SessionState::Idle,
            decision: None,
            request_id: None,
            response: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(AtmoError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Tracks routing sessions and publishes their state changes.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, RoutingSession>>>,
    events: EventBus,
}

impl SessionManager {
    pub fn new(events: EventBus) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Start a new idle session. Returns its id.
    pub fn create(&self, query: impl Into<String>) -> String {
        let session = RoutingSession::new(query);
        let id = session.id.clone();
        self.sessions.write().insert(id.clone(), session);
        id
    }

    pub fn get(&self, id: &str) -> Option<RoutingSession> {
        self.sessions.read().get(id).cloned()
    }

    pub fn state(&self, id: &str) -> Option<SessionState> {
        self.sessions.read().get(id).map(|s| s.state)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Move a session to `next`, applying `update` in the same step.
    pub fn transition_with(
        &self,
        id: &str,
        next: SessionState,
        update: impl FnOnce(&mut RoutingSession),
    ) -> Result<()> {
        {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| AtmoError::InvalidState(format!("unknown session {id}")))?;
            session.transition(next)?;
            update(session);
        }
        debug!(session_id = id, state = %next, "session state changed");
        self.events.publish(Event::SessionStateChanged {
            session_id: id.to_string(),
            state: next.to_string(),
        });
        Ok(())
    }

    pub fn transition(&self, id: &str, next: SessionState) -> Result<()> {
        self.transition_with(id, next, |_| {})
    }

    /// Sessions not yet in a terminal state.
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| !s.state.is_terminal())
            .count()
    }

    pub fn list(&self) -> Vec<RoutingSession> {
        let mut all: Vec<_> = self.sessions.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Drop terminal sessions last updated more than `max_age` ago.
    /// An age reaching past the representable past keeps everything.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let Some(cutoff) = Utc::now().checked_sub_signed(to_chrono(max_age)) else {
            return 0;
        };
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !(s.state.is_terminal() && s.updated_at < cutoff));
        before - sessions.len()
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `cancel` fires.
    pub fn spawn_cleanup(
        &self,
        interval: Duration,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let interval = tick_period(interval, "session cleanup");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = manager.cleanup(max_age);
                        if removed > 0 {
                            debug!(removed, remaining = manager.len(), "pruned finished sessions");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut s = RoutingSession::new("chat");
        for next in [SessionState::Routed, SessionState::Pending, SessionState::Completed] {
            s.transition(next).unwrap();
        }
        assert!(s.state.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut s = RoutingSession::new("chat");
        s.transition(SessionState::Failed).unwrap();
        let err = s.transition(SessionState::Routed).unwrap_err();
        assert_eq!(err.to_string(), "invalid session transition: failed -> routed");
    }

    #[test]
    fn test_cannot_skip_routing() {
        let mut s = RoutingSession::new("chat");
        assert!(s.transition(SessionState::Pending).is_err());
        assert!(s.transition(SessionState::TimedOut).is_err());
        assert_eq!(s.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_manager_publishes_and_counts() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let mgr = SessionManager::new(events);
        let a = mgr.create("one");
        let _b = mgr.create("two");
        assert_eq!(mgr.active_count(), 2);

        mgr.transition(&a, SessionState::Failed).unwrap();
        assert_eq!(mgr.active_count(), 1);
        match rx.recv().await.unwrap() {
            Event::SessionStateChanged { session_id, state } => {
                assert_eq!(session_id, a);
                assert_eq!(state, "failed");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_cleanup_only_drops_old_terminal_sessions() {
        let mgr = SessionManager::new(EventBus::default());
        let done = mgr.create("done");
        let live = mgr.create("live");
        mgr.transition(&done, SessionState::Cancelled).unwrap();

        assert_eq!(mgr.cleanup(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.cleanup(Duration::ZERO), 1);
        assert!(mgr.get(&done).is_none());
        assert!(mgr.get(&live).is_some());
    }

    #[test]
    fn test_cleanup_with_unbounded_age_keeps_everything() {
        let mgr = SessionManager::new(EventBus::default());
        let done = mgr.create("done");
        mgr.transition(&done, SessionState::Failed).unwrap();
        assert_eq!(mgr.cleanup(Duration::MAX), 0);
        assert_eq!(mgr.state(&done), Some(SessionState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_prunes_until_cancelled() {
        let mgr = SessionManager::new(EventBus::default());
        let done = mgr.create("done");
        mgr.transition(&done, SessionState::Completed).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let cancel = CancellationToken::new();
        let handle = mgr.spawn_cleanup(Duration::from_secs(30), Duration::ZERO, cancel.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(mgr.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
