//! The sync facade.
//!
//! [`SyncService`] is the single entry point feature code talks to. It owns
//! the realtime channel, the offline queue, the stroke buffer and the
//! presence view, and it is the error boundary for the backend: sends fall
//! back to the queue, fetches fall back to empty values, and nothing above it
//! ever sees a [`StoreError`].
//!
//! ```text
//!  feature code ──► SyncService ──► RealtimeChannel ──► RealtimeTransport
//!                       │  │
//!                       │  └──► RowStore (messages, presence, scores, ...)
//!                       ▼
//!                  DurableQueue ──► LocalStore
//! ```

use hangout_core::{
    merge_timeline, ChatMessage, DrawingAction, Identity, MissYouKind, MissYouSignal, Notification,
    PayloadError, PresenceRecord, PresenceRow, PresenceStatus, PresenceView, ScoreRow, StrokeRecord,
    TimelineEntry, Topic, TopicEvent,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::backend::{tables, Filter, Query, RowStore, StoreError};
use crate::channel::{
    ChannelEvent, RealtimeChannel, RealtimeTransport, RowChangeKind, Subscription,
};
use crate::config::SyncConfig;
use crate::connectivity::NetworkMonitor;
use crate::heartbeat::HeartbeatHandle;
use crate::local::LocalStore;
use crate::queue::{DurableQueue, EnqueueOutcome, QueueEntry};
use crate::strokes::StrokeBuffer;

/// What happened to a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The backend accepted the row.
    Confirmed,
    /// Kept in the offline queue for a later drain.
    Queued,
    /// The offline queue is full and the send was lost.
    Dropped,
}

/// Result of one offline queue drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub requeued: usize,
}

/// How long `shutdown` waits for queued presence rows to reach the backend.
const PRESENCE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Single task that persists presence rows in the order they were produced.
struct PresenceWriter {
    rows: mpsc::UnboundedSender<PresenceRecord>,
    task: JoinHandle<()>,
}

struct ServiceInner {
    config: SyncConfig,
    store: Arc<dyn RowStore>,
    channel: RealtimeChannel,
    queue: DurableQueue,
    strokes: StrokeBuffer,
    network: NetworkMonitor,
    presence: Arc<StdRwLock<PresenceView>>,
    presence_writer: StdMutex<Option<PresenceWriter>>,
    drain_lock: Mutex<()>,
    drains: broadcast::Sender<DrainReport>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Cheap to clone; every clone drives the same service.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn RowStore>,
        transport: Arc<dyn RealtimeTransport>,
        local: Arc<dyn LocalStore>,
        network: NetworkMonitor,
    ) -> Self {
        let channel = RealtimeChannel::new(config.channel_name.clone(), transport, config.backoff.clone());
        let queue = DurableQueue::load(local, config.queue_key.clone(), config.queue_capacity);
        let strokes = StrokeBuffer::new(store.clone(), network.clone(), config.stroke_flush_interval);
        let (drains, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(ServiceInner {
                config,
                store,
                channel,
                queue,
                strokes,
                network,
                presence: Arc::new(StdRwLock::new(PresenceView::new())),
                presence_writer: StdMutex::new(None),
                drain_lock: Mutex::new(()),
                drains,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.inner.channel
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Join the channel and spawn the drain triggers. Idempotent.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let view = self.inner.presence.clone();
        let from_broadcast = self.inner.channel.subscribe(Topic::Presence, move |event| {
            if let TopicEvent::Presence(record) = event {
                fold_presence(&view, record.clone());
            }
        });
        let view = self.inner.presence.clone();
        let from_sync = self.inner.channel.on_presence_sync(move |records| {
            for record in records {
                fold_presence(&view, record.clone());
            }
        });
        self.inner.subscriptions.lock().await.extend([from_broadcast, from_sync]);

        // Subscribe before starting the channel so the first Subscribed is seen.
        let mut events = self.inner.channel.events();
        let mut tasks = Vec::new();

        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Subscribed) => {
                        service.process_offline_queue().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => log::warn!("Missed {n} channel events"),
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        let service = self.clone();
        let mut online = self.inner.network.subscribe();
        tasks.push(tokio::spawn(async move {
            while online.changed().await.is_ok() {
                let is_online = *online.borrow_and_update();
                if is_online {
                    service.process_offline_queue().await;
                }
            }
        }));

        if let Some(every) = self.inner.config.queue_retry_interval {
            let service = self.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                loop {
                    ticker.tick().await;
                    service.process_offline_queue().await;
                }
            }));
        }

        self.inner.tasks.lock().await.extend(tasks);
        self.inner.channel.start().await;
        log::info!("Sync service started on channel {}", self.inner.channel.name());
    }

    /// Flush buffered strokes and presence rows, then stop every
    /// background task.
    pub async fn shutdown(&self) {
        self.inner.strokes.flush_now().await;
        self.flush_presence().await;
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        for subscription in self.inner.subscriptions.lock().await.drain(..) {
            subscription.unsubscribe();
        }
        self.inner.channel.stop().await;
        self.inner.started.store(false, Ordering::SeqCst);
        log::info!("Sync service stopped");
    }

    // ─── Broadcast ────────────────────────────────────────────────────

    /// Broadcast `event`. Theme, music and game documents are also written to
    /// `sync_state` so late joiners can fetch the latest value.
    pub async fn publish(&self, event: &TopicEvent) -> Result<(), PayloadError> {
        self.inner.channel.publish(event).await?;
        let topic = event.topic();
        if topic.is_persisted_document() {
            let row = json!({ "key": topic.as_str(), "data": event.data()? });
            if let Err(e) = self.inner.store.upsert(tables::SYNC_STATE, row, "key").await {
                log::warn!("Failed to persist {topic} state: {e}");
            }
        }
        Ok(())
    }

    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(&TopicEvent) + Send + Sync + 'static,
    {
        self.inner.channel.subscribe(topic, callback)
    }

    /// Inserted and updated rows of `messages`, decoded.
    pub fn subscribe_messages<F>(&self, callback: F) -> Subscription
    where
        F: Fn(RowChangeKind, &ChatMessage) + Send + Sync + 'static,
    {
        self.inner.channel.subscribe_rows(tables::MESSAGES, move |change| {
            if change.kind == RowChangeKind::Delete {
                return;
            }
            let Some(row) = &change.new else {
                return;
            };
            match serde_json::from_value::<ChatMessage>(row.clone()) {
                Ok(message) => callback(change.kind, &message),
                Err(e) => log::warn!("Skipping malformed message row: {e}"),
            }
        })
    }

    // ─── Fetches ──────────────────────────────────────────────────────

    /// Latest persisted theme, music or game document.
    pub async fn fetch_sync_state(&self, topic: Topic) -> Option<TopicEvent> {
        let filter = Filter::new().eq("key", topic.as_str());
        let row = match self.inner.store.select_one(tables::SYNC_STATE, &filter).await {
            Ok(row) => row,
            Err(StoreError::NotFound { .. }) => return None,
            Err(e) => {
                log::warn!("Failed to fetch {topic} state: {e}");
                return None;
            }
        };
        let data = row.get("data").cloned().unwrap_or(Value::Null);
        match TopicEvent::from_data(topic, data).and_then(|event| event.validate().map(|_| event)) {
            Ok(event) => Some(event),
            Err(e) => {
                log::warn!("Ignoring stored {topic} state: {e}");
                None
            }
        }
    }

    /// Oldest messages first, up to `message_fetch_limit`.
    pub async fn fetch_messages(&self) -> Vec<ChatMessage> {
        let query = Query::new()
            .order_by("timestamp", true)
            .limit(self.inner.config.message_fetch_limit);
        self.fetch_rows(tables::MESSAGES, &query).await
    }

    pub async fn fetch_scores(&self) -> Vec<ScoreRow> {
        self.fetch_rows(tables::SCORES, &Query::new()).await
    }

    pub async fn fetch_strokes(&self) -> Vec<StrokeRecord> {
        self.fetch_rows(tables::STROKES, &Query::new().order_by("timestamp", true)).await
    }

    /// Notifications addressed to `identity`, newest first.
    pub async fn fetch_notifications(&self, identity: Identity) -> Vec<Notification> {
        let query = Query::new()
            .filter(Filter::new().eq("recipient", identity.as_str()))
            .order_by("timestamp", false);
        self.fetch_rows(tables::NOTIFICATIONS, &query).await
    }

    /// Persisted presence of both participants. Also folded into the view.
    pub async fn fetch_presence(&self) -> Vec<PresenceRecord> {
        let rows: Vec<PresenceRow> = self.fetch_rows(tables::PRESENCE, &Query::new()).await;
        let records: Vec<PresenceRecord> = rows.iter().map(PresenceRow::to_record).collect();
        for record in &records {
            fold_presence(&self.inner.presence, record.clone());
        }
        records
    }

    async fn fetch_rows<T: DeserializeOwned>(&self, table: &str, query: &Query) -> Vec<T> {
        match self.inner.store.select(table, query).await {
            Ok(rows) => decode_rows(table, rows),
            Err(e) => {
                log::warn!("Failed to fetch {table}: {e}");
                Vec::new()
            }
        }
    }

    // ─── Sends ────────────────────────────────────────────────────────

    /// Insert `message`, or queue it when offline or on any failure.
    pub async fn save_message(&self, message: &ChatMessage) -> SendOutcome {
        let entry = QueueEntry::message(message.clone());
        if !self.inner.network.is_online() {
            return self.queue(entry).await;
        }
        match self.deliver(&entry).await {
            Ok(()) => SendOutcome::Confirmed,
            Err(e) => {
                log::warn!("Saving message {} failed, queued for retry: {e}", message.id);
                self.queue(entry).await
            }
        }
    }

    pub async fn send_notification(&self, sender: Identity, recipient: Identity, kind: &str) -> SendOutcome {
        let notification = Notification::new(sender, recipient, kind, hangout_core::now_millis());
        let entry = QueueEntry::notification(notification);
        if !self.inner.network.is_online() {
            return self.queue(entry).await;
        }
        match self.deliver(&entry).await {
            Ok(()) => SendOutcome::Confirmed,
            Err(e) => {
                log::warn!("Sending notification failed, queued for retry: {e}");
                self.queue(entry).await
            }
        }
    }

    /// Nudge the other participant. `MissYou` also leaves a notification.
    pub async fn send_miss_you(&self, sender: Identity, kind: MissYouKind) -> Result<(), PayloadError> {
        let signal = MissYouSignal { sender, timestamp: hangout_core::now_millis(), kind };
        self.publish(&TopicEvent::MissYou(signal)).await?;
        if kind == MissYouKind::MissYou {
            self.send_notification(sender, sender.peer(), &Notification::missing_you_text(sender))
                .await;
        }
        Ok(())
    }

    /// Toggle `user`'s `emoji` on `message` and write the reactions back.
    ///
    /// Returns `true` if the reaction was added. The local copy is updated
    /// even if the write fails.
    pub async fn toggle_reaction(&self, message: &mut ChatMessage, emoji: &str, user: Identity) -> bool {
        let added = message.reactions.toggle(emoji, user);
        let patch = json!({ "reactions": message.reactions });
        let filter = Filter::new().eq("id", message.id.as_str());
        match self.inner.store.update(tables::MESSAGES, patch, &filter).await {
            Ok(0) => log::warn!("Reaction target {} not found", message.id),
            Ok(_) => {}
            Err(e) => log::warn!("Failed to save reaction on {}: {e}", message.id),
        }
        added
    }

    /// Buffer a canvas action for the next batch write.
    pub async fn save_stroke(&self, action: DrawingAction) -> Result<(), PayloadError> {
        action
            .validate()
            .map_err(|reason| PayloadError::Invalid { topic: Topic::Drawing, reason })?;
        self.inner.strokes.push(action).await;
        Ok(())
    }

    async fn queue(&self, entry: QueueEntry) -> SendOutcome {
        match self.inner.queue.enqueue(entry).await {
            EnqueueOutcome::Added | EnqueueOutcome::Duplicate => SendOutcome::Queued,
            EnqueueOutcome::Full => SendOutcome::Dropped,
        }
    }

    async fn deliver(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        match entry {
            QueueEntry::Message { payload, .. } => {
                let row = serde_json::to_value(payload)?;
                match self.inner.store.insert(tables::MESSAGES, vec![row]).await {
                    // An earlier attempt got through but its reply was lost.
                    Err(StoreError::Conflict(_)) => Ok(()),
                    other => other,
                }
            }
            QueueEntry::Notification { payload, .. } => {
                let row = serde_json::to_value(payload)?;
                self.inner.store.insert(tables::NOTIFICATIONS, vec![row]).await
            }
        }
    }

    // ─── Offline queue ────────────────────────────────────────────────

    /// Replay queued sends in order. Failures go back to the tail.
    ///
    /// Skipped while offline or when the queue is empty. Concurrent calls
    /// run one after another.
    pub async fn process_offline_queue(&self) -> DrainReport {
        let _drain = self.inner.drain_lock.lock().await;
        if !self.inner.network.is_online() || self.inner.queue.is_empty().await {
            return DrainReport::default();
        }

        let entries = self.inner.queue.take_all().await;
        log::info!("Draining {} queued sends", entries.len());
        let mut report = DrainReport::default();
        for entry in entries {
            match self.deliver(&entry).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::debug!("Queued send still failing: {e}");
                    if self.inner.queue.enqueue(entry).await != EnqueueOutcome::Full {
                        report.requeued += 1;
                    }
                }
            }
        }
        self.inner.queue.notify().await;
        if report.requeued > 0 {
            log::warn!("{} sends still pending after drain", report.requeued);
        }
        let _ = self.inner.drains.send(report);
        report
    }

    pub async fn queue_snapshot(&self) -> Vec<QueueEntry> {
        self.inner.queue.snapshot().await
    }

    pub fn queue_changes(&self) -> watch::Receiver<Vec<QueueEntry>> {
        self.inner.queue.subscribe()
    }

    /// Reports of drains that had something to deliver.
    pub fn drain_reports(&self) -> broadcast::Receiver<DrainReport> {
        self.inner.drains.subscribe()
    }

    pub async fn is_pending(&self, message_id: &str) -> bool {
        self.inner.queue.is_pending(message_id).await
    }

    pub async fn pending_messages(&self) -> Vec<ChatMessage> {
        self.inner.queue.pending_messages().await
    }

    /// Confirmed and still-queued messages as one timeline.
    pub async fn timeline(&self, confirmed: &[ChatMessage]) -> Vec<TimelineEntry> {
        merge_timeline(confirmed, &self.inner.queue.pending_messages().await)
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Publish our presence on every path peers read it from.
    ///
    /// The table write runs in the background and only while online. Writes
    /// reach the backend in call order.
    pub async fn update_presence(&self, identity: Identity, status: PresenceStatus) {
        let record = PresenceRecord::new(identity, status, hangout_core::now_millis());
        fold_presence(&self.inner.presence, record.clone());
        self.inner.channel.track(&record).await;
        if let Err(e) = self.inner.channel.publish(&TopicEvent::Presence(record.clone())).await {
            log::warn!("Presence broadcast refused: {e}");
        }

        if self.inner.network.is_online() {
            self.persist_presence(record);
        }
    }

    fn persist_presence(&self, record: PresenceRecord) {
        let mut writer = match self.inner.presence_writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if writer.as_ref().map_or(true, |w| w.rows.is_closed()) {
            let (rows, pending) = mpsc::unbounded_channel();
            let task = tokio::spawn(write_presence_rows(self.inner.store.clone(), pending));
            *writer = Some(PresenceWriter { rows, task });
        }
        if let Some(writer) = writer.as_ref() {
            if writer.rows.send(record).is_err() {
                log::warn!("Presence writer stopped, row dropped");
            }
        }
    }

    /// Wait for queued presence rows, bounded by [`PRESENCE_FLUSH_TIMEOUT`].
    async fn flush_presence(&self) {
        let writer = match self.inner.presence_writer.lock() {
            Ok(mut writer) => writer.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(PresenceWriter { rows, task }) = writer else {
            return;
        };
        drop(rows);
        if tokio::time::timeout(PRESENCE_FLUSH_TIMEOUT, task).await.is_err() {
            log::warn!("Presence rows still pending at shutdown");
        }
    }

    pub fn presence_view(&self) -> PresenceView {
        match self.inner.presence.read() {
            Ok(view) => view.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Start the presence heartbeat for `identity`.
    pub fn start_heartbeat(&self, identity: Identity) -> HeartbeatHandle {
        HeartbeatHandle::spawn(self.clone(), identity, self.inner.config.heartbeat_interval)
    }

    // ─── Scores ───────────────────────────────────────────────────────

    /// Add `delta` to `identity`'s score and broadcast the new total.
    ///
    /// Each attempt reads the row and writes it back only if its `version`
    /// is unchanged. A row without a version is guarded on its score. Returns the new total, or `None` if the backend failed
    /// or every attempt lost a race.
    pub async fn update_score(&self, identity: Identity, delta: i64) -> Option<i64> {
        let attempts = self.inner.config.score_cas_attempts.max(1);
        for attempt in 1..=attempts {
            match self.try_update_score(identity, delta).await {
                Ok(Some(row)) => {
                    let event = TopicEvent::Scores(row.to_update());
                    if let Err(e) = self.inner.channel.publish(&event).await {
                        log::warn!("Score broadcast refused: {e}");
                    }
                    return Some(row.score);
                }
                Ok(None) => log::debug!("Score update for {identity} lost race {attempt}/{attempts}"),
                Err(e) => {
                    log::warn!("Failed to update score for {identity}: {e}");
                    return None;
                }
            }
        }
        log::warn!("Gave up updating score for {identity} after {attempts} attempts");
        None
    }

    /// One compare-and-swap round. `Ok(None)` means another writer won.
    async fn try_update_score(&self, identity: Identity, delta: i64) -> Result<Option<ScoreRow>, StoreError> {
        let now = hangout_core::now_millis();
        let by_user = Filter::new().eq("user_id", identity.as_str());
        match self.inner.store.select_one(tables::SCORES, &by_user).await {
            Ok(row) => {
                let current: ScoreRow = serde_json::from_value(row)?;
                let next = current.bumped(delta, now);
                let patch = json!({
                    "score": next.score,
                    "version": next.version,
                    "updated_at": next.updated_at,
                });
                let guard = if current.is_unversioned() {
                    by_user.is_null("version").eq("score", current.score)
                } else {
                    by_user.eq("version", current.version)
                };
                let updated = self.inner.store.update(tables::SCORES, patch, &guard).await?;
                Ok((updated > 0).then_some(next))
            }
            Err(StoreError::NotFound { .. }) => {
                let first = ScoreRow::first(identity, delta, now);
                let row = serde_json::to_value(&first)?;
                match self.inner.store.insert(tables::SCORES, vec![row]).await {
                    Ok(()) => Ok(Some(first)),
                    Err(StoreError::Conflict(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

fn fold_presence(view: &StdRwLock<PresenceView>, record: PresenceRecord) {
    let mut view = match view.write() {
        Ok(view) => view,
        Err(poisoned) => poisoned.into_inner(),
    };
    view.apply(record);
}

async fn write_presence_rows(store: Arc<dyn RowStore>, mut records: mpsc::UnboundedReceiver<PresenceRecord>) {
    let mut written: HashMap<Identity, i64> = HashMap::new();
    while let Some(record) = records.recv().await {
        if written.get(&record.user).is_some_and(|&seen| seen > record.last_seen) {
            log::debug!("Skipping stale presence row for {}", record.user);
            continue;
        }
        let row = match serde_json::to_value(record.to_row()) {
            Ok(row) => row,
            Err(e) => {
                log::warn!("Could not encode presence row: {e}");
                continue;
            }
        };
        match store.upsert(tables::PRESENCE, row, "user_id").await {
            Ok(()) => {
                written.insert(record.user, record.last_seen);
            }
            Err(e) => log::warn!("Failed to persist presence: {e}"),
        }
    }
}

fn decode_rows<T: DeserializeOwned>(table: &str, rows: Vec<Value>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(row) => Some(row),
            Err(e) => {
                log::warn!("Skipping malformed {table} row: {e}");
                None
            }
        })
        .collect()
}
