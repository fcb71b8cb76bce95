//! Transport seam between the channel supervisor and a concrete connection.
//!
//! A transport turns "connect to channel X" into a [`Session`]: a sender for
//! outgoing frames and a receiver of decoded inbound frames. The session is
//! over when the inbound receiver closes.

use async_trait::async_trait;
use hangout_core::PresenceRecord;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChangeKind {
    Insert,
    Update,
    Delete,
}

impl RowChangeKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(RowChangeKind::Insert),
            "UPDATE" => Some(RowChangeKind::Update),
            "DELETE" => Some(RowChangeKind::Delete),
            _ => None,
        }
    }
}

/// A row-level change notification from the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub table: String,
    pub kind: RowChangeKind,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Broadcast { event: String, payload: Value },
    /// Replace this client's tracked presence entry.
    Track { key: String, meta: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Broadcast { event: String, payload: Value },
    RowChange(RowChange),
    /// Full tracked-presence set after a join, leave or update.
    PresenceSync(Vec<PresenceRecord>),
}

pub struct Session {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<Inbound>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// Could not open a connection.
    Unreachable(String),
    /// Connected, but the channel join was refused.
    JoinRejected(String),
    Timeout,
    ConnectionClosed,
    ProtocolError(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Unreachable(e) => write!(f, "Realtime endpoint unreachable: {e}"),
            ChannelError::JoinRejected(e) => write!(f, "Channel join rejected: {e}"),
            ChannelError::Timeout => write!(f, "Timed out waiting for channel"),
            ChannelError::ConnectionClosed => write!(f, "Connection closed"),
            ChannelError::ProtocolError(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Connect and join `channel`. Resolves once the join is acknowledged.
    async fn connect(&self, channel: &str) -> Result<Session, ChannelError>;
}

/// Decode the presence metas of one tracked key, skipping malformed ones.
pub(crate) fn presence_from_metas(key: &str, metas: &[Value]) -> Vec<PresenceRecord> {
    metas
        .iter()
        .filter_map(|meta| match serde_json::from_value::<PresenceRecord>(meta.clone()) {
            Ok(record) => Some(record),
            Err(e) => {
                log::debug!("Ignoring presence meta for '{key}': {e}");
                None
            }
        })
        .collect()
}
