//! Phoenix channel frames as spoken by the realtime websocket (`vsn=1.0.0`).
//!
//! Every frame is a JSON object:
//!
//! ```text
//! { "topic": "realtime:hangout_sync", "event": "broadcast",
//!   "payload": { ... }, "ref": "3", "join_ref": "1" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::transport::{presence_from_metas, ChannelError, Inbound, Outbound, RowChange, RowChangeKind};

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_CLOSE: &str = "phx_close";
pub const HEARTBEAT: &str = "heartbeat";
pub const BROADCAST: &str = "broadcast";
pub const PRESENCE: &str = "presence";
pub const PRESENCE_STATE: &str = "presence_state";
pub const PRESENCE_DIFF: &str = "presence_diff";
pub const POSTGRES_CHANGES: &str = "postgres_changes";

/// Topic used for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

/// Channel name to wire topic.
pub fn topic_for(channel: &str) -> String {
    format!("realtime:{channel}")
}

impl PhoenixFrame {
    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::ProtocolError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(text).map_err(|e| ChannelError::ProtocolError(e.to_string()))
    }

    /// Join `topic` with broadcast, presence and row-change subscriptions.
    pub fn join(topic: &str, presence_key: &str, tables: &[&str], reference: &str) -> Self {
        let changes: Vec<Value> = tables
            .iter()
            .map(|t| json!({ "event": "*", "schema": "public", "table": t }))
            .collect();
        Self {
            topic: topic.to_string(),
            event: PHX_JOIN.to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false, "ack": false },
                    "presence": { "key": presence_key },
                    "postgres_changes": changes,
                }
            }),
            reference: Some(reference.to_string()),
            join_ref: Some(reference.to_string()),
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    pub fn outbound(topic: &str, message: &Outbound, reference: &str, join_ref: &str) -> Self {
        let (event, payload) = match message {
            Outbound::Broadcast { event, payload } => (
                BROADCAST,
                json!({ "type": BROADCAST, "event": event, "payload": payload }),
            ),
            Outbound::Track { meta, .. } => (
                PRESENCE,
                json!({ "type": PRESENCE, "event": "track", "payload": meta }),
            ),
        };
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    /// `Some(status)` if this is a reply to `reference`.
    pub fn reply_status(&self, reference: &str) -> Option<&str> {
        if self.event != PHX_REPLY || self.reference.as_deref() != Some(reference) {
            return None;
        }
        self.payload.get("status").and_then(Value::as_str)
    }
}

/// Presence set folded from `presence_state` and `presence_diff` frames.
#[derive(Debug, Default)]
pub struct PresenceSet {
    entries: HashMap<String, Vec<Value>>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn metas(value: &Value) -> Vec<Value> {
        value
            .get("metas")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    pub fn apply_state(&mut self, payload: &Value) {
        self.entries.clear();
        if let Some(map) = payload.as_object() {
            for (key, value) in map {
                self.entries.insert(key.clone(), Self::metas(value));
            }
        }
    }

    /// Fold a diff: joined metas are added under their key, departed metas
    /// are removed by `phx_ref`, and a key with no metas left disappears.
    pub fn apply_diff(&mut self, payload: &Value) {
        if let Some(joins) = payload.get("joins").and_then(Value::as_object) {
            for (key, value) in joins {
                let joined = Self::metas(value);
                let metas = self.entries.entry(key.clone()).or_default();
                metas.retain(|m| !joined.iter().any(|j| same_meta(m, j)));
                metas.extend(joined);
            }
        }
        if let Some(leaves) = payload.get("leaves").and_then(Value::as_object) {
            for (key, value) in leaves {
                let left = Self::metas(value);
                let Some(metas) = self.entries.get_mut(key) else {
                    continue;
                };
                metas.retain(|m| !left.iter().any(|l| same_meta(m, l)));
                if metas.is_empty() {
                    self.entries.remove(key);
                }
            }
        }
    }

    pub fn records(&self) -> Vec<hangout_core::PresenceRecord> {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        keys.into_iter()
            .flat_map(|k| presence_from_metas(k, &self.entries[k]))
            .collect()
    }
}

/// Metas are identified by `phx_ref`; metas without one compare whole.
fn same_meta(a: &Value, b: &Value) -> bool {
    match (a.get("phx_ref"), b.get("phx_ref")) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Translate a frame for our channel topic into an [`Inbound`] event.
///
/// Returns `Ok(None)` for frames that carry nothing for subscribers
/// (replies, unknown events) and `Err(ConnectionClosed)` when the server
/// closes or errors the channel.
pub fn to_inbound(frame: &PhoenixFrame, presence: &mut PresenceSet) -> Result<Option<Inbound>, ChannelError> {
    match frame.event.as_str() {
        BROADCAST => {
            let event = frame.payload.get("event").and_then(Value::as_str).unwrap_or_default();
            let payload = frame.payload.get("payload").cloned().unwrap_or(Value::Null);
            Ok(Some(Inbound::Broadcast { event: event.to_string(), payload }))
        }
        POSTGRES_CHANGES => Ok(row_change(&frame.payload).map(Inbound::RowChange)),
        PRESENCE_STATE => {
            presence.apply_state(&frame.payload);
            Ok(Some(Inbound::PresenceSync(presence.records())))
        }
        PRESENCE_DIFF => {
            presence.apply_diff(&frame.payload);
            Ok(Some(Inbound::PresenceSync(presence.records())))
        }
        PHX_CLOSE | PHX_ERROR => Err(ChannelError::ConnectionClosed),
        _ => Ok(None),
    }
}

fn row_change(payload: &Value) -> Option<RowChange> {
    let data = payload.get("data")?;
    let table = data.get("table")?.as_str()?.to_string();
    let kind = RowChangeKind::parse(data.get("type")?.as_str()?)?;
    let non_empty = |v: Option<&Value>| {
        v.filter(|v| v.as_object().map(|o| !o.is_empty()).unwrap_or(!v.is_null()))
            .cloned()
    };
    Some(RowChange {
        table,
        kind,
        new: non_empty(data.get("record")),
        old: non_empty(data.get("old_record")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_frame_shape() {
        let frame = PhoenixFrame::join("realtime:hangout_sync", "Anvi", &["messages"], "1");
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "phx_join");
        assert_eq!(value["ref"], "1");
        assert_eq!(value["payload"]["config"]["presence"]["key"], "Anvi");
        assert_eq!(value["payload"]["config"]["postgres_changes"][0]["table"], "messages");
    }

    #[test]
    fn test_outbound_broadcast_frame() {
        let out = Outbound::Broadcast {
            event: "state_change".into(),
            payload: json!({ "type": "theme", "data": { "accent": "#fff" } }),
        };
        let frame = PhoenixFrame::outbound("realtime:x", &out, "5", "1");
        assert_eq!(frame.event, "broadcast");
        assert_eq!(frame.payload["event"], "state_change");
        assert_eq!(frame.payload["payload"]["type"], "theme");
    }

    #[test]
    fn test_reply_status() {
        let frame = PhoenixFrame::decode(
            r#"{"topic":"realtime:x","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1"}"#,
        )
        .unwrap();
        assert_eq!(frame.reply_status("1"), Some("ok"));
        assert_eq!(frame.reply_status("2"), None);
    }

    #[test]
    fn test_inbound_broadcast() {
        let frame = PhoenixFrame {
            topic: "realtime:x".into(),
            event: BROADCAST.into(),
            payload: json!({ "type": "broadcast", "event": "state_change", "payload": { "type": "music" } }),
            reference: None,
            join_ref: None,
        };
        let inbound = to_inbound(&frame, &mut PresenceSet::new()).unwrap();
        assert_eq!(
            inbound,
            Some(Inbound::Broadcast { event: "state_change".into(), payload: json!({ "type": "music" }) })
        );
    }

    #[test]
    fn test_inbound_row_change() {
        let frame = PhoenixFrame {
            topic: "realtime:x".into(),
            event: POSTGRES_CHANGES.into(),
            payload: json!({
                "ids": [1],
                "data": { "schema": "public", "table": "messages", "type": "INSERT",
                          "record": { "id": "m1" }, "old_record": {} }
            }),
            reference: None,
            join_ref: None,
        };
        match to_inbound(&frame, &mut PresenceSet::new()).unwrap() {
            Some(Inbound::RowChange(change)) => {
                assert_eq!(change.table, "messages");
                assert_eq!(change.kind, RowChangeKind::Insert);
                assert_eq!(change.new, Some(json!({ "id": "m1" })));
                assert_eq!(change.old, None);
            }
            other => panic!("Expected row change, got {other:?}"),
        }
    }

    #[test]
    fn test_presence_state_and_diff() {
        let meta = json!({ "user": "Anvi", "isOnline": true, "status": "online", "lastSeen": 5, "phx_ref": "a" });
        let mut set = PresenceSet::new();
        set.apply_state(&json!({ "Anvi": { "metas": [meta] } }));
        assert_eq!(set.records().len(), 1);
        set.apply_diff(&json!({ "joins": {}, "leaves": { "Anvi": { "metas": [{ "phx_ref": "a" }] } } }));
        assert!(set.records().is_empty());
    }

    #[test]
    fn test_presence_leave_keeps_other_tabs() {
        let tab = |r: &str, seen: i64| {
            json!({ "user": "Anvi", "isOnline": true, "status": "online", "lastSeen": seen, "phx_ref": r })
        };
        let mut set = PresenceSet::new();
        set.apply_state(&json!({ "Anvi": { "metas": [tab("a", 5)] } }));
        set.apply_diff(&json!({ "joins": { "Anvi": { "metas": [tab("b", 6)] } }, "leaves": {} }));
        assert_eq!(set.entries["Anvi"].len(), 2);

        set.apply_diff(&json!({ "joins": {}, "leaves": { "Anvi": { "metas": [tab("a", 5)] } } }));
        let records = set.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user, hangout_core::Identity::Anvi);
        assert_eq!(records[0].last_seen, 6);

        set.apply_diff(&json!({ "joins": {}, "leaves": { "Anvi": { "metas": [tab("b", 6)] } } }));
        assert!(set.records().is_empty());
    }

    #[test]
    fn test_close_frame_ends_session() {
        let frame = PhoenixFrame {
            topic: "realtime:x".into(),
            event: PHX_CLOSE.into(),
            payload: json!({}),
            reference: None,
            join_ref: None,
        };
        assert_eq!(to_inbound(&frame, &mut PresenceSet::new()), Err(ChannelError::ConnectionClosed));
    }
}
