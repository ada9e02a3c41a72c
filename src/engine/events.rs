// Lifecycle events and their fan-out to host subscribers.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::downloader::{BundleRecord, DownloadProgress};
use crate::error::{ErrorKind, UpdateError};

/// One observable step of an update cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    Error { kind: ErrorKind, message: String },
    /// Checked, nothing new. Never surrounded by start/finish events.
    NotAvailable,
    DownloadStart,
    DownloadProgress(DownloadProgress),
    DownloadFinished(BundleRecord),
}

impl UpdateEvent {
    pub fn error(err: &UpdateError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Stable tag name of the variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Error { .. } => "Error",
            Self::NotAvailable => "NotAvailable",
            Self::DownloadStart => "DownloadStart",
            Self::DownloadProgress(_) => "DownloadProgress",
            Self::DownloadFinished(_) => "DownloadFinished",
        }
    }

    /// True for events that end a cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Error { .. } | Self::NotAvailable | Self::DownloadFinished(_)
        )
    }

    /// Body sent to script-side listeners on [`UPDATES_EVENT_NAME`](crate::config::UPDATES_EVENT_NAME).
    pub fn to_host_payload(&self) -> Value {
        match self {
            Self::Error { kind, message } => json!({
                "type": "error",
                "kind": kind,
                "message": message,
            }),
            Self::NotAvailable => json!({ "type": "noUpdateAvailable" }),
            Self::DownloadStart => json!({ "type": "downloadStart" }),
            Self::DownloadProgress(progress) => json!({
                "type": "downloadProgress",
                "bytesReceived": progress.bytes_received,
                "bytesExpected": progress.bytes_expected,
            }),
            Self::DownloadFinished(record) => json!({
                "type": "downloadFinished",
                "manifest": record.manifest(),
                "contentHash": record.content_hash(),
                "downloadedAt": record.downloaded_at(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end handed to a subscriber. Dropping it unsubscribes lazily.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<UpdateEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<UpdateEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<UpdateEvent> {
        self.rx.try_recv().ok()
    }
}

/// Best-effort, per-subscriber ordered publisher. No buffering for late subscribers.
pub struct EventBroadcaster {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<UpdateEvent>)>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push((id, tx));
        debug!("event subscriber {:?} added", id);
        Subscription { id, rx }
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn publish(&self, event: UpdateEvent) {
        let mut subscribers = self.subscribers.lock();
        // Publishing under the lock keeps every subscriber's order identical.
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        debug!(
            "published {} to {} subscribers",
            event.tag(),
            subscribers.len()
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
