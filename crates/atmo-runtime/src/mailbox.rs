use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use atmo_core::{AtmoError, Result, short_id};
use atmo_mesh::CapabilityEntry;

use crate::store::ReplicatedStore;

pub const REQUESTS: &str = "requests";
pub const RESPONSES: &str = "responses";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Completed,
    Failed,
}

/// A request or response in the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxRecord {
    pub id: String,
    /// For a request, its own id; for a response, the request it answers.
    pub request_id: String,
    pub payload: Value,
    pub target_project_path: String,
    pub status: RecordStatus,
    pub timestamp: DateTime<Utc>,
    pub source_node_id: String,
}

impl MailboxRecord {
    /// Owner node id encoded in the target path.
    pub fn target_node(&self) -> &str {
        self.target_project_path
            .split('/')
            .next()
            .unwrap_or_default()
    }

    fn from_document(doc: Value) -> Option<Self> {
        match serde_json::from_value(doc) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(error = %e, "skipping malformed mailbox record");
                None
            }
        }
    }
}

/// `"<owner_node_id>/<type>/<capability_id>"`.
pub fn target_project_path(target: &CapabilityEntry) -> String {
    format!(
        "{}/{}/{}",
        target.owner_node_id, target.capability_type, target.capability_id
    )
}

/// Request/response exchange over a [`ReplicatedStore`].
#[derive(Clone)]
pub struct Mailbox {
    store: Arc<dyn ReplicatedStore>,
    node_id: String,
    poll_interval: Duration,
}

impl Mailbox {
    pub fn new(store: Arc<dyn ReplicatedStore>, node_id: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            poll_interval,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn write(&self, collection: &str, record: &MailboxRecord) -> Result<()> {
        let doc = serde_json::to_value(record)?;
        match self.store.insert(collection, &record.id, doc).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AtmoError::MailboxWrite(format!(
                "{collection} record {} already exists",
                record.id
            ))),
            Err(e @ AtmoError::MailboxWrite(_)) => Err(e),
            Err(e) => Err(AtmoError::MailboxWrite(e.to_string())),
        }
    }

    async fn records(&self, collection: &str) -> Result<Vec<MailboxRecord>> {
        Ok(self
            .store
            .query(collection)
            .await?
            .into_iter()
            .filter_map(MailboxRecord::from_document)
            .collect())
    }

    /// Write a pending request addressed to `target`'s owner. Returns the request id.
    pub async fn submit(&self, payload: Value, target: &CapabilityEntry) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let record = MailboxRecord {
            id: id.clone(),
            request_id: id.clone(),
            payload,
            target_project_path: target_project_path(target),
            status: RecordStatus::Pending,
            timestamp: Utc::now(),
            source_node_id: self.node_id.clone(),
        };
        self.write(REQUESTS, &record).await?;
        info!(
            request_id = %id,
            target = %record.target_project_path,
            "request submitted"
        );
        Ok(id)
    }

    /// The earliest visible response to `request_id`, if any.
    pub async fn find_response(&self, request_id: &str) -> Result<Option<MailboxRecord>> {
        Ok(self
            .records(RESPONSES)
            .await?
            .into_iter()
            .filter(|r| r.request_id == request_id)
            .min_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id))))
    }

    /// Wait for the response to `request_id`.
    ///
    /// Polls every `poll_interval`, waking early when the store reports new
    /// documents. Gives up with [`AtmoError::Timeout`] once `timeout` has
    /// elapsed, or [`AtmoError::Cancelled`] when `cancel` fires. A timeout too
    /// large to represent never elapses, so only `cancel` ends that wait. The
    /// request record stays in the log either way.
    pub async fn await_response(
        &self,
        request_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<MailboxRecord> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        let notifier = self.store.change_notifier();

        loop {
            if cancel.is_cancelled() {
                debug!(request_id, "await cancelled");
                return Err(AtmoError::Cancelled);
            }
            // Registered before looking, so an insert racing the lookup still wakes us.
            let mut changed = std::pin::pin!(notifier.as_deref().map(Notify::notified));
            if let Some(waiter) = changed.as_mut().as_pin_mut() {
                waiter.enable();
            }
            if let Some(response) = self.find_response(request_id).await? {
                debug!(
                    request_id,
                    from = %short_id(&response.source_node_id),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "response received"
                );
                return Ok(response);
            }

            let now = Instant::now();
            if let Some(deadline) = deadline
                && now >= deadline
            {
                let waited_ms = now.duration_since(started).as_millis() as u64;
                warn!(request_id, waited_ms, "no response before timeout");
                return Err(AtmoError::Timeout {
                    request_id: request_id.to_string(),
                    waited_ms,
                });
            }

            let wait = match deadline {
                Some(deadline) => self.poll_interval.min(deadline - now),
                None => self.poll_interval,
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = async {
                    match changed.as_mut().as_pin_mut() {
                        Some(waiter) => waiter.await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }
    }

    /// Requests addressed to `node_id` that have no response yet, oldest first.
    pub async fn pending_for(&self, node_id: &str) -> Result<Vec<MailboxRecord>> {
        let answered: HashSet<String> = self
            .records(RESPONSES)
            .await?
            .into_iter()
            .map(|r| r.request_id)
            .collect();
        let mut pending: Vec<MailboxRecord> = self
            .records(REQUESTS)
            .await?
            .into_iter()
            .filter(|r| r.target_node() == node_id && !answered.contains(&r.request_id))
            .collect();
        pending.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        Ok(pending)
    }

    /// Answer `request` from this node.
    pub async fn respond(
        &self,
        request: &MailboxRecord,
        payload: Value,
        status: RecordStatus,
    ) -> Result<MailboxRecord> {
        let record = MailboxRecord {
            id: Uuid::new_v4().to_string(),
            request_id: request.request_id.clone(),
            payload,
            target_project_path: request.target_project_path.clone(),
            status,
            timestamp: Utc::now(),
            source_node_id: self.node_id.clone(),
        };
        self.write(RESPONSES, &record).await?;
        debug!(request_id = %record.request_id, status = ?status, "response written");
        Ok(record)
    }
}
