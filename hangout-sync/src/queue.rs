//! Offline queue for sends made while the backend is unreachable.
//!
//! Chat messages and notifications that fail to reach the backend are kept
//! here and replayed later, oldest first.
//!
//! ```text
//!  save_message ──► insert ──ok──► Confirmed
//!        │            │
//!     offline       error
//!        ▼            ▼
//!  ┌────────────────────────┐  persisted on every mutation
//!  │ DurableQueue           │ ───────────────────────────► LocalStore["offline_queue"]
//!  │  [ e1 | e2 | e3 ... ]  │
//!  └───────────┬────────────┘
//!              │ drain (online / subscribed / interval)
//!              ▼
//!     deliver FIFO, failures back to the tail
//! ```

use hangout_core::{ChatMessage, Notification};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::local::{load_json, save_json, LocalStore};

/// One queued send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QueueEntry {
    Message {
        payload: ChatMessage,
        #[serde(rename = "enqueuedAt")]
        enqueued_at: i64,
    },
    Notification {
        payload: Notification,
        #[serde(rename = "enqueuedAt")]
        enqueued_at: i64,
    },
}

impl QueueEntry {
    pub fn message(message: ChatMessage) -> Self {
        QueueEntry::Message { payload: message, enqueued_at: hangout_core::now_millis() }
    }

    pub fn notification(notification: Notification) -> Self {
        QueueEntry::Notification { payload: notification, enqueued_at: hangout_core::now_millis() }
    }

    /// Message id, used for dedup. Notifications have none.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            QueueEntry::Message { payload, .. } => Some(&payload.id),
            QueueEntry::Notification { .. } => None,
        }
    }

    pub fn enqueued_at(&self) -> i64 {
        match self {
            QueueEntry::Message { enqueued_at, .. } | QueueEntry::Notification { enqueued_at, .. } => {
                *enqueued_at
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    /// A message with the same id is already queued.
    Duplicate,
    Full,
}

/// Bounded FIFO of queued sends, deduplicated by message id.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    entries: VecDeque<QueueEntry>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Rebuild from persisted entries, keeping the first of any duplicate ids.
    pub fn from_entries(entries: Vec<QueueEntry>, max_size: usize) -> Self {
        let mut queue = Self::new(max_size);
        for entry in entries {
            queue.enqueue(entry);
        }
        queue
    }

    pub fn enqueue(&mut self, entry: QueueEntry) -> EnqueueOutcome {
        if let Some(id) = entry.message_id() {
            if self.contains_message(id) {
                return EnqueueOutcome::Duplicate;
            }
        }
        if self.entries.len() >= self.max_size {
            return EnqueueOutcome::Full;
        }
        self.entries.push_back(entry);
        EnqueueOutcome::Added
    }

    /// Remove and return every entry, oldest first.
    pub fn take_all(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }

    pub fn contains_message(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.message_id() == Some(id))
    }

    pub fn pending_messages(&self) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                QueueEntry::Message { payload, .. } => Some(payload.clone()),
                QueueEntry::Notification { .. } => None,
            })
            .collect()
    }

    pub fn entries(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

/// [`OfflineQueue`] written through to a [`LocalStore`] on every mutation,
/// with a watch channel for "queue changed" observers.
pub struct DurableQueue {
    queue: Mutex<OfflineQueue>,
    store: Arc<dyn LocalStore>,
    key: String,
    changes: watch::Sender<Vec<QueueEntry>>,
}

impl DurableQueue {
    /// Load the persisted queue. A corrupt or unreadable blob is logged and
    /// replaced by an empty queue.
    pub fn load(store: Arc<dyn LocalStore>, key: impl Into<String>, capacity: usize) -> Self {
        let key = key.into();
        let entries = match load_json::<Vec<QueueEntry>>(store.as_ref(), &key) {
            Ok(Some(entries)) => entries,
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("Discarding unreadable offline queue '{key}': {e}");
                Vec::new()
            }
        };
        let queue = OfflineQueue::from_entries(entries, capacity);
        if !queue.is_empty() {
            log::info!("Restored {} queued sends", queue.len());
        }
        let (changes, _) = watch::channel(queue.entries());
        Self {
            queue: Mutex::new(queue),
            store,
            key,
            changes,
        }
    }

    pub async fn enqueue(&self, entry: QueueEntry) -> EnqueueOutcome {
        let mut queue = self.queue.lock().await;
        let outcome = queue.enqueue(entry);
        match outcome {
            EnqueueOutcome::Added => self.persist(&queue),
            EnqueueOutcome::Duplicate => log::debug!("Send already queued, skipping"),
            EnqueueOutcome::Full => {
                log::warn!("Offline queue full ({} entries), dropping send", queue.capacity())
            }
        }
        self.changes.send_replace(queue.entries());
        outcome
    }

    /// Empty the queue (memory and persisted copy) and return its contents.
    pub async fn take_all(&self) -> Vec<QueueEntry> {
        let mut queue = self.queue.lock().await;
        let entries = queue.take_all();
        self.persist(&queue);
        entries
    }

    /// Publish the current contents to watchers.
    pub async fn notify(&self) {
        let queue = self.queue.lock().await;
        self.changes.send_replace(queue.entries());
    }

    pub async fn snapshot(&self) -> Vec<QueueEntry> {
        self.queue.lock().await.entries()
    }

    pub async fn is_pending(&self, message_id: &str) -> bool {
        self.queue.lock().await.contains_message(message_id)
    }

    pub async fn pending_messages(&self) -> Vec<ChatMessage> {
        self.queue.lock().await.pending_messages()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<QueueEntry>> {
        self.changes.subscribe()
    }

    fn persist(&self, queue: &OfflineQueue) {
        if let Err(e) = save_json(self.store.as_ref(), &self.key, &queue.entries()) {
            log::warn!("Failed to persist offline queue: {e}");
        }
    }
}
