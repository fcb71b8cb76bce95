//! In-process realtime hub.
//!
//! Every [`MemoryHub::connect`] gets its own session on one shared tokio
//! broadcast bus, the same fan-out shape the hosted channel has: broadcasts
//! reach every other session (never the sender), row changes and presence
//! syncs reach everyone. Tests use it as a second peer and to force drops.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use super::transport::{
    presence_from_metas, ChannelError, Inbound, Outbound, RealtimeTransport, RowChange, Session,
};
use hangout_core::PresenceRecord;

#[derive(Debug, Clone)]
enum HubBody {
    Broadcast { event: String, payload: Value },
    RowChange(RowChange),
    PresenceChanged,
}

#[derive(Debug, Clone)]
struct HubFrame {
    /// Sending session, `None` for frames injected by the hub itself.
    origin: Option<Uuid>,
    body: HubBody,
}

struct HubInner {
    bus: broadcast::Sender<HubFrame>,
    /// Tracked presence: key → (owning session, meta).
    presence: Mutex<BTreeMap<String, (Uuid, Value)>>,
    reachable: AtomicBool,
    generation: watch::Sender<u64>,
    connects: AtomicU64,
    live: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MemoryHub {
    /// `capacity` frames are buffered per session before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity);
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(HubInner {
                bus,
                presence: Mutex::new(BTreeMap::new()),
                reachable: AtomicBool::new(true),
                generation,
                connects: AtomicU64::new(0),
                live: AtomicUsize::new(0),
            }),
        }
    }

    /// While unreachable, `connect` fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Close every live session, as a network blip would.
    pub fn drop_connections(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
    }

    /// Deliver a broadcast to every session as if a peer had sent it.
    pub fn inject_broadcast(&self, event: &str, payload: Value) {
        let _ = self.inner.bus.send(HubFrame {
            origin: None,
            body: HubBody::Broadcast { event: event.to_string(), payload },
        });
    }

    pub fn emit_row_change(&self, change: RowChange) {
        let _ = self.inner.bus.send(HubFrame { origin: None, body: HubBody::RowChange(change) });
    }

    /// Total successful connects since creation.
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn presence(&self) -> Vec<PresenceRecord> {
        let presence = self.inner.presence.lock().unwrap_or_else(|p| p.into_inner());
        presence
            .iter()
            .flat_map(|(key, (_, meta))| presence_from_metas(key, std::slice::from_ref(meta)))
            .collect()
    }

    fn leave(&self, session: Uuid) {
        let removed = {
            let mut presence = self.inner.presence.lock().unwrap_or_else(|p| p.into_inner());
            let before = presence.len();
            presence.retain(|_, (owner, _)| *owner != session);
            presence.len() != before
        };
        if removed {
            let _ = self.inner.bus.send(HubFrame { origin: None, body: HubBody::PresenceChanged });
        }
    }

    async fn run_session(
        self,
        id: Uuid,
        mut bus_rx: broadcast::Receiver<HubFrame>,
        mut out_rx: mpsc::Receiver<Outbound>,
        in_tx: mpsc::Sender<Inbound>,
    ) {
        let mut generation = self.inner.generation.subscribe();

        loop {
            tokio::select! {
                frame = bus_rx.recv() => {
                    let inbound = match frame {
                        Ok(HubFrame { origin, body: HubBody::Broadcast { event, payload } }) => {
                            if origin == Some(id) {
                                continue;
                            }
                            Inbound::Broadcast { event, payload }
                        }
                        Ok(HubFrame { body: HubBody::RowChange(change), .. }) => Inbound::RowChange(change),
                        Ok(HubFrame { body: HubBody::PresenceChanged, .. }) => {
                            Inbound::PresenceSync(self.presence())
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Hub session {id} lagged, {n} frames dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if in_tx.send(inbound).await.is_err() {
                        break;
                    }
                }
                message = out_rx.recv() => match message {
                    Some(Outbound::Broadcast { event, payload }) => {
                        let _ = self.inner.bus.send(HubFrame {
                            origin: Some(id),
                            body: HubBody::Broadcast { event, payload },
                        });
                    }
                    Some(Outbound::Track { key, meta }) => {
                        {
                            let mut presence = self.inner.presence.lock().unwrap_or_else(|p| p.into_inner());
                            presence.insert(key, (id, meta));
                        }
                        let _ = self.inner.bus.send(HubFrame { origin: None, body: HubBody::PresenceChanged });
                    }
                    None => break,
                },
                changed = generation.changed() => {
                    if changed.is_ok() {
                        log::debug!("Hub session {id} dropped");
                    }
                    break;
                }
            }
        }

        self.leave(id);
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RealtimeTransport for MemoryHub {
    async fn connect(&self, channel: &str) -> Result<Session, ChannelError> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(ChannelError::Unreachable(format!("hub for '{channel}' is offline")));
        }
        let id = Uuid::new_v4();
        let bus_rx = self.inner.bus.subscribe();
        let (out_tx, out_rx) = mpsc::channel(256);
        let (in_tx, in_rx) = mpsc::channel(256);

        // Late joiners see the current presence set first.
        let _ = in_tx.try_send(Inbound::PresenceSync(self.presence()));

        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(self.clone().run_session(id, bus_rx, out_rx, in_tx));

        Ok(Session { outbound: out_tx, inbound: in_rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    async fn next(session: &mut Session) -> Inbound {
        timeout(Duration::from_secs(1), session.inbound.recv())
            .await
            .expect("timed out")
            .expect("session closed")
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let hub = MemoryHub::default();
        let mut a = hub.connect("c").await.unwrap();
        let mut b = hub.connect("c").await.unwrap();
        // initial presence syncs
        next(&mut a).await;
        next(&mut b).await;

        a.outbound
            .send(Outbound::Broadcast { event: "state_change".into(), payload: json!({ "n": 1 }) })
            .await
            .unwrap();
        assert_eq!(
            next(&mut b).await,
            Inbound::Broadcast { event: "state_change".into(), payload: json!({ "n": 1 }) }
        );
        assert!(timeout(Duration::from_millis(50), a.inbound.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_connect_fails() {
        let hub = MemoryHub::default();
        hub.set_reachable(false);
        assert!(matches!(hub.connect("c").await, Err(ChannelError::Unreachable(_))));
        assert_eq!(hub.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_connections_closes_sessions() {
        let hub = MemoryHub::default();
        let mut a = hub.connect("c").await.unwrap();
        next(&mut a).await;
        hub.drop_connections();
        let closed = timeout(Duration::from_secs(1), async {
            while a.inbound.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_track_produces_presence_sync() {
        let hub = MemoryHub::default();
        let mut a = hub.connect("c").await.unwrap();
        next(&mut a).await;
        let meta = json!({ "user": "Zxhan", "isOnline": true, "status": "online", "lastSeen": 9 });
        a.outbound.send(Outbound::Track { key: "Zxhan".into(), meta }).await.unwrap();
        match next(&mut a).await {
            Inbound::PresenceSync(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].last_seen, 9);
            }
            other => panic!("Expected presence sync, got {other:?}"),
        }
        assert_eq!(hub.presence().len(), 1);
    }
}
