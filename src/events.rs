//! Event catalog and in-memory fan-out to live listeners.
//!
//! Every delivered message is a JSON object `{"event": <name>, "data": {...}}`.
//! Delivery is best-effort: a listener whose send fails is dropped after the
//! delivery pass, and never stops the others from receiving the event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::{Comment, Issue};

// ── Event catalog ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    #[serde(rename = "issue:created")]
    IssueCreated { project: String, issue: Issue },

    #[serde(rename = "issue:updated")]
    IssueUpdated { project: String, issue: Issue },

    #[serde(rename = "comment:created", rename_all = "camelCase")]
    CommentCreated {
        project: String,
        issue_number: i64,
        comment: Comment,
    },

    #[serde(rename = "amplifier:started", rename_all = "camelCase")]
    AmplifierStarted { project: String, issue_number: i64 },

    #[serde(rename = "amplifier:completed", rename_all = "camelCase")]
    AmplifierCompleted {
        project: String,
        issue_number: i64,
        comment_id: i64,
    },

    #[serde(rename = "amplifier:failed", rename_all = "camelCase")]
    AmplifierFailed {
        project: String,
        issue_number: i64,
        error: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IssueCreated { .. } => "issue:created",
            Self::IssueUpdated { .. } => "issue:updated",
            Self::CommentCreated { .. } => "comment:created",
            Self::AmplifierStarted { .. } => "amplifier:started",
            Self::AmplifierCompleted { .. } => "amplifier:completed",
            Self::AmplifierFailed { .. } => "amplifier:failed",
        }
    }
}

// ── Listeners ────────────────────────────────────────────────────────

/// A live connection that can receive serialized events.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn send(&self, message: &str) -> anyhow::Result<()>;
}

/// Identifies a registered listener for [`Broadcaster::disconnect`].
pub type ListenerId = u64;

/// Listener backed by a bounded mpsc channel.
///
/// A full or closed channel counts as a failed delivery, so a consumer that
/// stops draining is dropped instead of stalling every broadcast.
pub struct ChannelListener {
    tx: mpsc::Sender<String>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// A listener plus the receiving end to drain it from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Listener for ChannelListener {
    async fn send(&self, message: &str) -> anyhow::Result<()> {
        self.tx
            .try_send(message.to_string())
            .map_err(|e| anyhow::anyhow!("listener channel unavailable: {}", e))
    }
}

// ── Broadcaster ──────────────────────────────────────────────────────

/// Owns the set of live listeners and fans events out to them.
///
/// Constructed once at startup and shared by `Arc`.
#[derive(Default)]
pub struct Broadcaster {
    listeners: Mutex<Vec<(ListenerId, Arc<dyn Listener>)>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Arc<dyn Listener>)>> {
        // The vector is never left half-updated, so a poisoned lock is still usable
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener. Delivery follows registration order.
    pub fn connect(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners().push((id, listener));
        tracing::debug!(listener = id, "listener connected");
        id
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn disconnect(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if removed {
            tracing::debug!(listener = id, "listener disconnected");
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Serialize and deliver a catalog event. Returns the number of
    /// listeners that received it.
    pub async fn broadcast(&self, event: &Event) -> usize {
        match serde_json::to_string(event) {
            Ok(message) => self.deliver(&message).await,
            Err(e) => {
                tracing::error!(event = event.name(), error = %e, "failed to serialize event");
                0
            }
        }
    }

    /// Deliver an arbitrary `{event, data}` pair.
    pub async fn broadcast_json(&self, event: &str, data: serde_json::Value) -> usize {
        let message = serde_json::json!({ "event": event, "data": data }).to_string();
        self.deliver(&message).await
    }

    async fn deliver(&self, message: &str) -> usize {
        // Snapshot so the lock is never held across a send
        let snapshot: Vec<(ListenerId, Arc<dyn Listener>)> = self.listeners().clone();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, listener) in &snapshot {
            match listener.send(message).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(listener = id, error = %e, "dropping listener after failed send");
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            self.disconnect(id);
        }
        delivered
    }
}
