//! Websocket transport speaking the Phoenix channel protocol.
//!
//! ```text
//!            mpsc<Outbound>              ws text frames
//!  channel ─────────────────► writer task ──────────────► server
//!                               │  heartbeat every N s
//!                               │
//!  channel ◄───────────────── reader task ◄────────────── server
//!            mpsc<Inbound>
//! ```
//!
//! The two tasks share a shutdown flag so that either side failing ends the
//! whole session, which the supervisor observes as the inbound channel
//! closing. A heartbeat still unanswered when the next one is due also ends
//! the session, so a socket that stays open but goes silent is replaced.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use super::frame::{to_inbound, topic_for, PhoenixFrame, PresenceSet, PHOENIX_TOPIC};
use super::transport::{ChannelError, Inbound, Outbound, RealtimeTransport, Session};
use crate::backend::tables;
use crate::config::SyncConfig;

pub struct PhoenixTransport {
    url: String,
    presence_key: String,
    tables: Vec<String>,
    heartbeat_interval: Duration,
    join_timeout: Duration,
    refs: Arc<AtomicU64>,
}

impl PhoenixTransport {
    pub fn new(url: impl Into<String>, presence_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            presence_key: presence_key.into(),
            tables: vec![tables::MESSAGES.to_string()],
            heartbeat_interval: Duration::from_secs(25),
            join_timeout: Duration::from_secs(10),
            refs: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn from_config(config: &SyncConfig, presence_key: impl Into<String>) -> Self {
        Self::new(config.realtime_url(), presence_key)
            .with_heartbeat_interval(config.socket_heartbeat_interval)
    }

    /// Tables whose row changes are requested on join.
    pub fn with_tables(mut self, tables: &[&str]) -> Self {
        self.tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    fn next_ref(refs: &AtomicU64) -> String {
        refs.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

#[async_trait]
impl RealtimeTransport for PhoenixTransport {
    async fn connect(&self, channel: &str) -> Result<Session, ChannelError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| ChannelError::Unreachable(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let topic = topic_for(channel);
        let join_ref = PhoenixTransport::next_ref(&self.refs);
        let tables: Vec<&str> = self.tables.iter().map(String::as_str).collect();
        let join = PhoenixFrame::join(&topic, &self.presence_key, &tables, &join_ref);
        ws_writer
            .send(Message::Text(join.encode()?.into()))
            .await
            .map_err(|_| ChannelError::ConnectionClosed)?;

        // Wait for the join acknowledgement.
        let joined = timeout(self.join_timeout, async {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let Ok(frame) = PhoenixFrame::decode(text.as_str()) else {
                            continue;
                        };
                        match frame.reply_status(&join_ref) {
                            Some("ok") => return Ok(()),
                            Some(_) => return Err(ChannelError::JoinRejected(frame.payload.to_string())),
                            None => {}
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            Err(ChannelError::ConnectionClosed)
        })
        .await;
        match joined {
            Ok(Ok(())) => log::info!("Joined {topic}"),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ChannelError::Timeout),
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(256);
        let (in_tx, in_rx) = mpsc::channel::<Inbound>(256);
        let (shutdown_tx, mut writer_shutdown) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let mut reader_shutdown = shutdown_tx.subscribe();
        let pending_heartbeat: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        // Writer task: outgoing frames and socket heartbeats
        let refs = self.refs.clone();
        let period = self.heartbeat_interval;
        let writer_topic = topic.clone();
        let writer_done = shutdown_tx.clone();
        let unanswered = pending_heartbeat.clone();
        tokio::spawn(async move {
            let mut heartbeat = interval_at(Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let frame = tokio::select! {
                    message = out_rx.recv() => match message {
                        Some(message) => PhoenixFrame::outbound(
                            &writer_topic,
                            &message,
                            &PhoenixTransport::next_ref(&refs),
                            &join_ref,
                        ),
                        None => {
                            let _ = ws_writer.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    _ = heartbeat.tick() => {
                        let reference = PhoenixTransport::next_ref(&refs);
                        let mut pending = unanswered.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(missed) = pending.replace(reference.clone()) {
                            log::warn!("Heartbeat {missed} unanswered, closing session");
                            break;
                        }
                        PhoenixFrame::heartbeat(&reference)
                    }
                    _ = writer_shutdown.changed() => break,
                };
                let Ok(text) = frame.encode() else {
                    continue;
                };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    log::warn!("Websocket write failed, closing session");
                    break;
                }
            }
            writer_done.send_replace(true);
        });

        // Reader task: decode frames for our topic
        tokio::spawn(async move {
            let mut presence = PresenceSet::new();
            loop {
                let msg = tokio::select! {
                    msg = ws_reader.next() => msg,
                    _ = reader_shutdown.changed() => break,
                };
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let frame = match PhoenixFrame::decode(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::debug!("Ignoring undecodable frame: {e}");
                        continue;
                    }
                };
                if frame.topic == PHOENIX_TOPIC {
                    let mut pending = pending_heartbeat.lock().unwrap_or_else(|e| e.into_inner());
                    let answered = pending.as_deref().is_some_and(|r| frame.reply_status(r).is_some());
                    if answered {
                        *pending = None;
                    }
                    continue;
                }
                if frame.topic != topic {
                    continue;
                }
                match to_inbound(&frame, &mut presence) {
                    Ok(Some(inbound)) => {
                        if in_tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("Channel {topic} ended by server: {e}");
                        break;
                    }
                }
            }
            shutdown_tx.send_replace(true);
        });

        Ok(Session { outbound: out_tx, inbound: in_rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let transport = PhoenixTransport::from_config(&SyncConfig::for_testing(), "Anvi");
        assert!(transport.url.starts_with("ws://127.0.0.1:54321/realtime/v1/websocket"));
        assert_eq!(transport.presence_key, "Anvi");
        assert_eq!(transport.tables, vec!["messages".to_string()]);
    }

    #[test]
    fn test_refs_increase() {
        let refs = AtomicU64::new(1);
        assert_eq!(PhoenixTransport::next_ref(&refs), "1");
        assert_eq!(PhoenixTransport::next_ref(&refs), "2");
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport = PhoenixTransport::new(format!("ws://127.0.0.1:{port}/socket"), "Anvi");
        assert!(matches!(transport.connect("c").await, Err(ChannelError::Unreachable(_))));
    }
}
