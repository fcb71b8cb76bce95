//! Realtime channel adapter.
//!
//! One [`RealtimeChannel`] per client keeps a single subscription to the
//! shared channel alive and fans inbound traffic out to listeners:
//!
//! ```text
//!                        ┌──────────────────────────────┐
//!  RealtimeTransport ──► │ supervisor task              │
//!  (Phoenix / hub)       │  ReconnectMachine            │
//!                        │  dispatch in arrival order   │
//!                        └──────┬─────────┬─────────┬───┘
//!                               │         │         │
//!                       topic registry  rows    presence sync
//!                        (TopicEvent)  (RowChange) (Vec<PresenceRecord>)
//! ```
//!
//! Channel errors never reach callers. A dropped session is retried with
//! bounded exponential backoff, and after the configured number of failed
//! attempts the channel parks in `GaveUp` until [`RealtimeChannel::reconnect`].
//!
//! Callbacks run on the supervisor task and must not block.

pub mod frame;
pub mod memory;
pub mod phoenix;
pub mod reconnect;
pub mod registry;
pub mod transport;

pub use memory::MemoryHub;
pub use phoenix::PhoenixTransport;
pub use reconnect::{ConnectionState, ReconnectMachine};
pub use registry::Subscription;
pub use transport::{ChannelError, Inbound, Outbound, RealtimeTransport, RowChange, RowChangeKind, Session};

use hangout_core::{PayloadError, PresenceRecord, Topic, TopicEvent, BROADCAST_EVENT};
use futures_util::FutureExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::config::BackoffConfig;
use registry::Registry;

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Emitted once per transition into `Connected`.
    Subscribed,
    Disconnected,
    GaveUp { attempts: u32 },
}

struct ChannelInner {
    name: String,
    transport: Arc<dyn RealtimeTransport>,
    backoff: BackoffConfig,
    topics: Arc<Registry<Topic, TopicEvent>>,
    rows: Arc<Registry<String, RowChange>>,
    presence: Arc<Registry<(), Vec<PresenceRecord>>>,
    outbound: RwLock<Option<mpsc::Sender<Outbound>>>,
    /// Re-sent after every reconnect.
    tracked: RwLock<Option<(String, serde_json::Value)>>,
    status: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ChannelEvent>,
    restart: Notify,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    pub fn new(name: impl Into<String>, transport: Arc<dyn RealtimeTransport>, backoff: BackoffConfig) -> Self {
        let (status, _) = watch::channel(ConnectionState::Idle);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                transport,
                backoff,
                topics: Arc::new(Registry::new()),
                rows: Arc::new(Registry::new()),
                presence: Arc::new(Registry::new()),
                outbound: RwLock::new(None),
                tracked: RwLock::new(None),
                status,
                events,
                restart: Notify::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawn the supervisor. Calling it again while running is a no-op.
    pub async fn start(&self) {
        let mut supervisor = self.inner.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *supervisor = Some(tokio::spawn(supervise(self.inner.clone())));
    }

    /// Stop the supervisor and drop the live session.
    pub async fn stop(&self) {
        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            handle.abort();
        }
        *self.inner.outbound.write().await = None;
        self.inner.status.send_replace(ConnectionState::Idle);
    }

    /// Skip the current backoff wait, or leave `GaveUp` and start over.
    /// Does nothing in any other state.
    pub fn reconnect(&self) {
        match self.status() {
            ConnectionState::Backoff { .. } | ConnectionState::GaveUp => self.inner.restart.notify_one(),
            state => log::debug!("Channel {} ignoring reconnect while {state:?}", self.inner.name),
        }
    }

    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(&TopicEvent) + Send + Sync + 'static,
    {
        let id = self.inner.topics.register(topic, Arc::new(callback));
        Subscription::new(&self.inner.topics, topic, id)
    }

    pub fn subscribe_rows<F>(&self, table: &str, callback: F) -> Subscription
    where
        F: Fn(&RowChange) + Send + Sync + 'static,
    {
        let id = self.inner.rows.register(table.to_string(), Arc::new(callback));
        Subscription::new(&self.inner.rows, table.to_string(), id)
    }

    pub fn on_presence_sync<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Vec<PresenceRecord>) + Send + Sync + 'static,
    {
        let id = self.inner.presence.register((), Arc::new(callback));
        Subscription::new(&self.inner.presence, (), id)
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        self.inner.topics.count(&topic)
    }

    /// Validate and broadcast `event`.
    ///
    /// Only an invalid payload is an error. When there is no live session
    /// the event is dropped; broadcasts are fire-and-forget.
    pub async fn publish(&self, event: &TopicEvent) -> Result<(), PayloadError> {
        let payload = event.to_wire()?;
        let sender = self.inner.outbound.read().await.clone();
        match sender {
            Some(tx) => {
                let message = Outbound::Broadcast { event: BROADCAST_EVENT.to_string(), payload };
                if tx.send(message).await.is_err() {
                    log::warn!("Broadcast of {} failed, channel will reconnect", event.topic());
                }
            }
            None => log::debug!("Channel not connected, dropping {} broadcast", event.topic()),
        }
        Ok(())
    }

    /// Replace this client's tracked presence entry.
    pub async fn track(&self, record: &PresenceRecord) {
        let meta = match serde_json::to_value(record) {
            Ok(meta) => meta,
            Err(e) => {
                log::warn!("Could not encode presence: {e}");
                return;
            }
        };
        let key = record.user.to_string();
        *self.inner.tracked.write().await = Some((key.clone(), meta.clone()));
        let sender = self.inner.outbound.read().await.clone();
        if let Some(tx) = sender {
            let _ = tx.send(Outbound::Track { key, meta }).await;
        }
    }

    pub fn status(&self) -> ConnectionState {
        *self.inner.status.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }
}

impl ChannelInner {
    fn set_status(&self, state: ConnectionState) {
        self.status.send_replace(state);
    }

    fn dispatch(&self, inbound: Inbound) {
        match inbound {
            Inbound::Broadcast { event, payload } => {
                if event != BROADCAST_EVENT {
                    log::debug!("Ignoring broadcast event '{event}'");
                    return;
                }
                match TopicEvent::from_wire(&payload) {
                    Ok(event) => {
                        self.topics.dispatch(&event.topic(), &event);
                    }
                    Err(e) => log::warn!("Dropping broadcast: {e}"),
                }
            }
            Inbound::RowChange(change) => {
                self.rows.dispatch(&change.table, &change);
            }
            Inbound::PresenceSync(records) => {
                self.presence.dispatch(&(), &records);
            }
        }
    }
}

async fn supervise(inner: Arc<ChannelInner>) {
    let mut machine = ReconnectMachine::new(inner.backoff.clone());
    machine.start();

    loop {
        inner.set_status(machine.state());
        match inner.transport.connect(&inner.name).await {
            Ok(Session { outbound, mut inbound }) => {
                inner.set_status(machine.on_connected());
                log::info!("Channel {} subscribed", inner.name);
                // A reconnect request that raced the previous wait is stale now.
                let _ = inner.restart.notified().now_or_never();

                let tracked = inner.tracked.read().await.clone();
                if let Some((key, meta)) = tracked {
                    let _ = outbound.send(Outbound::Track { key, meta }).await;
                }
                *inner.outbound.write().await = Some(outbound);
                let _ = inner.events.send(ChannelEvent::Subscribed);

                while let Some(message) = inbound.recv().await {
                    inner.dispatch(message);
                }

                *inner.outbound.write().await = None;
                let _ = inner.events.send(ChannelEvent::Disconnected);
                log::warn!("Channel {} disconnected", inner.name);
                machine.on_disconnected();
            }
            Err(e) => {
                log::warn!(
                    "Channel {} connect attempt {} failed: {e}",
                    inner.name,
                    machine.failures() + 1
                );
                machine.on_failure();
            }
        }

        inner.set_status(machine.state());
        match machine.state() {
            ConnectionState::Backoff { attempt, delay } => {
                log::debug!("Channel {} retry {attempt} in {delay:?}", inner.name);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.restart.notified() => {}
                }
                machine.retry();
            }
            ConnectionState::GaveUp => {
                let attempts = machine.failures();
                log::error!("Channel {} gave up after {attempts} attempts", inner.name);
                let _ = inner.events.send(ChannelEvent::GaveUp { attempts });
                inner.restart.notified().await;
                log::info!("Channel {} restarting", inner.name);
                machine.reset();
                machine.start();
            }
            ConnectionState::Idle | ConnectionState::Connecting | ConnectionState::Connected => {
                machine.reset();
                machine.start();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangout_core::{Identity, PresenceStatus, ThemeState};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn wait_for(events: &mut broadcast::Receiver<ChannelEvent>, wanted: ChannelEvent) {
        timeout(Duration::from_secs(2), async {
            loop {
                if events.recv().await.ok() == Some(wanted.clone()) {
                    return;
                }
            }
        })
        .await
        .expect("channel event not seen");
    }

    fn channel(hub: &MemoryHub) -> RealtimeChannel {
        RealtimeChannel::new("hangout_sync", Arc::new(hub.clone()), BackoffConfig::for_testing())
    }

    #[tokio::test]
    async fn test_publish_reaches_peer_subscribers() {
        let hub = MemoryHub::default();
        let (a, b) = (channel(&hub), channel(&hub));
        let (mut ea, mut eb) = (a.events(), b.events());
        a.start().await;
        b.start().await;
        wait_for(&mut ea, ChannelEvent::Subscribed).await;
        wait_for(&mut eb, ChannelEvent::Subscribed).await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        b.subscribe(Topic::Theme, move |e| sink.lock().unwrap().push(e.clone()));

        let event = TopicEvent::Theme(ThemeState { accent: "#123456".into() });
        a.publish(&event).await.unwrap();

        timeout(Duration::from_secs(1), async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![event]);
    }

    #[tokio::test]
    async fn test_invalid_publish_is_rejected() {
        let hub = MemoryHub::default();
        let a = channel(&hub);
        let bad = TopicEvent::Theme(ThemeState { accent: "nope".into() });
        assert!(a.publish(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_inbound_is_dropped() {
        let hub = MemoryHub::default();
        let a = channel(&hub);
        let mut events = a.events();
        a.start().await;
        wait_for(&mut events, ChannelEvent::Subscribed).await;

        let count = Arc::new(StdMutex::new(0));
        let sink = count.clone();
        a.subscribe(Topic::Music, move |_| *sink.lock().unwrap() += 1);

        hub.inject_broadcast("state_change", json!({ "type": "music", "data": { "isPlaying": 3 } }));
        hub.inject_broadcast("state_change", json!({ "type": "music", "data": { "isPlaying": true } }));

        timeout(Duration::from_secs(1), async {
            while *count.lock().unwrap() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let hub = MemoryHub::default();
        let a = channel(&hub);
        let mut events = a.events();
        a.start().await;
        wait_for(&mut events, ChannelEvent::Subscribed).await;

        hub.drop_connections();
        wait_for(&mut events, ChannelEvent::Disconnected).await;
        wait_for(&mut events, ChannelEvent::Subscribed).await;
        assert_eq!(hub.connect_count(), 2);
        assert!(a.status().is_connected());
    }

    #[tokio::test]
    async fn test_gives_up_then_reconnects_on_request() {
        let hub = MemoryHub::default();
        hub.set_reachable(false);
        let a = channel(&hub);
        let mut events = a.events();
        a.start().await;
        wait_for(&mut events, ChannelEvent::GaveUp { attempts: 4 }).await;
        assert_eq!(a.status(), ConnectionState::GaveUp);

        hub.set_reachable(true);
        a.reconnect();
        wait_for(&mut events, ChannelEvent::Subscribed).await;
    }

    #[tokio::test]
    async fn test_reconnect_while_connected_keeps_backoff() {
        let hub = MemoryHub::default();
        let backoff = BackoffConfig {
            base: Duration::from_millis(300),
            max: Duration::from_millis(300),
            max_attempts: 4,
        };
        let a = RealtimeChannel::new("hangout_sync", Arc::new(hub.clone()), backoff);
        let mut events = a.events();
        a.start().await;
        wait_for(&mut events, ChannelEvent::Subscribed).await;

        a.reconnect();
        assert!(a.status().is_connected());

        hub.drop_connections();
        wait_for(&mut events, ChannelEvent::Disconnected).await;
        let dropped_at = tokio::time::Instant::now();
        wait_for(&mut events, ChannelEvent::Subscribed).await;
        assert!(dropped_at.elapsed() >= Duration::from_millis(250));
        assert_eq!(hub.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = MemoryHub::default();
        let a = channel(&hub);
        let sub = a.subscribe(Topic::Game, |_| {});
        assert_eq!(a.listener_count(Topic::Game), 1);
        sub.unsubscribe();
        assert_eq!(a.listener_count(Topic::Game), 0);
    }

    #[tokio::test]
    async fn test_track_survives_reconnect() {
        let hub = MemoryHub::default();
        let a = channel(&hub);
        let mut events = a.events();
        a.start().await;
        wait_for(&mut events, ChannelEvent::Subscribed).await;
        a.track(&PresenceRecord::new(Identity::Anvi, PresenceStatus::Online, 1)).await;

        hub.drop_connections();
        wait_for(&mut events, ChannelEvent::Subscribed).await;
        timeout(Duration::from_secs(1), async {
            while hub.presence().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hub.presence()[0].user, Identity::Anvi);
    }
}
