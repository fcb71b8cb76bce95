//! Typed topic events and boundary validation.
//!
//! Everything that travels over the shared realtime channel is a
//! [`TopicEvent`]. On the wire it is the broadcast payload
//!
//! ```text
//! { "type": "<topic>", "data": <topic payload> }
//! ```
//!
//! sent under the broadcast event name [`BROADCAST_EVENT`]. Payloads are
//! checked when published and again when received, so a malformed event
//! from a stale or buggy peer never reaches subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::drawing::DrawingAction;
use crate::identity::Identity;
use crate::media::{GameState, MusicState, ThemeState};
use crate::presence::PresenceRecord;
use crate::score::ScoreUpdate;

/// Broadcast event name every topic event is sent under.
pub const BROADCAST_EVENT: &str = "state_change";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Theme,
    Music,
    Game,
    Presence,
    Drawing,
    Scores,
    MissYou,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Topic::Theme,
        Topic::Music,
        Topic::Game,
        Topic::Presence,
        Topic::Drawing,
        Topic::Scores,
        Topic::MissYou,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Theme => "theme",
            Topic::Music => "music",
            Topic::Game => "game",
            Topic::Presence => "presence",
            Topic::Drawing => "drawing",
            Topic::Scores => "scores",
            Topic::MissYou => "missyou",
        }
    }

    /// Topics whose latest value is also kept in `sync_state` for late joiners.
    pub fn is_persisted_document(self) -> bool {
        matches!(self, Topic::Theme | Topic::Music | Topic::Game)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PayloadError::UnknownTopic(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissYouKind {
    /// Shake the peer's screen.
    Shake,
    /// Shake plus a persisted notification.
    MissYou,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissYouSignal {
    pub sender: Identity,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: MissYouKind,
}

/// One event on the shared channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum TopicEvent {
    Theme(ThemeState),
    Music(MusicState),
    Game(GameState),
    Presence(PresenceRecord),
    Drawing(DrawingAction),
    Scores(ScoreUpdate),
    MissYou(MissYouSignal),
}

impl TopicEvent {
    pub fn topic(&self) -> Topic {
        match self {
            TopicEvent::Theme(_) => Topic::Theme,
            TopicEvent::Music(_) => Topic::Music,
            TopicEvent::Game(_) => Topic::Game,
            TopicEvent::Presence(_) => Topic::Presence,
            TopicEvent::Drawing(_) => Topic::Drawing,
            TopicEvent::Scores(_) => Topic::Scores,
            TopicEvent::MissYou(_) => Topic::MissYou,
        }
    }

    /// Check value-level constraints the type system cannot express.
    pub fn validate(&self) -> Result<(), PayloadError> {
        let result = match self {
            TopicEvent::Theme(theme) => theme.validate(),
            TopicEvent::Music(music) => music.validate(),
            TopicEvent::Game(game) => game.validate(),
            TopicEvent::Presence(record) if record.last_seen < 0 => {
                Err("lastSeen is negative".to_string())
            }
            TopicEvent::Drawing(action) => action.validate(),
            TopicEvent::MissYou(signal) if signal.timestamp < 0 => {
                Err("timestamp is negative".to_string())
            }
            _ => Ok(()),
        };
        result.map_err(|reason| PayloadError::Invalid { topic: self.topic(), reason })
    }

    /// The payload alone, as sent in the `data` field.
    pub fn data(&self) -> Result<Value, PayloadError> {
        let encoded = match self {
            TopicEvent::Theme(v) => serde_json::to_value(v),
            TopicEvent::Music(v) => serde_json::to_value(v),
            TopicEvent::Game(v) => serde_json::to_value(v),
            TopicEvent::Presence(v) => serde_json::to_value(v),
            TopicEvent::Drawing(v) => serde_json::to_value(v),
            TopicEvent::Scores(v) => serde_json::to_value(v),
            TopicEvent::MissYou(v) => serde_json::to_value(v),
        };
        encoded.map_err(|e| PayloadError::Malformed { topic: self.topic(), reason: e.to_string() })
    }

    /// Validate and encode as a `{type, data}` broadcast payload.
    pub fn to_wire(&self) -> Result<Value, PayloadError> {
        self.validate()?;
        serde_json::to_value(self)
            .map_err(|e| PayloadError::Malformed { topic: self.topic(), reason: e.to_string() })
    }

    /// Decode and validate a `{type, data}` broadcast payload.
    pub fn from_wire(payload: &Value) -> Result<Self, PayloadError> {
        let name = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| PayloadError::UnknownTopic(payload.get("type").map(|t| t.to_string()).unwrap_or_default()))?;
        let topic: Topic = name.parse()?;
        let data = payload.get("data").cloned().unwrap_or(Value::Null);
        let event = Self::from_data(topic, data)?;
        event.validate()?;
        Ok(event)
    }

    /// Decode a bare payload for a known topic, e.g. a `sync_state.data` cell.
    pub fn from_data(topic: Topic, data: Value) -> Result<Self, PayloadError> {
        fn decode<T: serde::de::DeserializeOwned>(topic: Topic, data: Value) -> Result<T, PayloadError> {
            serde_json::from_value(data)
                .map_err(|e| PayloadError::Malformed { topic, reason: e.to_string() })
        }
        Ok(match topic {
            Topic::Theme => TopicEvent::Theme(decode(topic, data)?),
            Topic::Music => TopicEvent::Music(decode(topic, data)?),
            Topic::Game => TopicEvent::Game(decode(topic, data)?),
            Topic::Presence => TopicEvent::Presence(decode(topic, data)?),
            Topic::Drawing => TopicEvent::Drawing(decode(topic, data)?),
            Topic::Scores => TopicEvent::Scores(decode(topic, data)?),
            Topic::MissYou => TopicEvent::MissYou(decode(topic, data)?),
        })
    }
}

/// Why a topic payload was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    UnknownTopic(String),
    /// The JSON does not have the shape the topic requires.
    Malformed { topic: Topic, reason: String },
    /// Well-formed but violates a value constraint.
    Invalid { topic: Topic, reason: String },
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::UnknownTopic(name) => write!(f, "Unknown topic: {name}"),
            PayloadError::Malformed { topic, reason } => {
                write!(f, "Malformed {topic} payload: {reason}")
            }
            PayloadError::Invalid { topic, reason } => {
                write!(f, "Invalid {topic} payload: {reason}")
            }
        }
    }
}

impl std::error::Error for PayloadError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceStatus;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let event = TopicEvent::Theme(ThemeState { accent: "#ff0000".into() });
        let wire = event.to_wire().unwrap();
        assert_eq!(wire, json!({ "type": "theme", "data": { "accent": "#ff0000" } }));
    }

    #[test]
    fn test_from_wire_round_trip() {
        let event = TopicEvent::Presence(PresenceRecord::new(Identity::Anvi, PresenceStatus::Away, 42));
        let wire = event.to_wire().unwrap();
        assert_eq!(wire["data"]["status"], "away");
        assert_eq!(TopicEvent::from_wire(&wire).unwrap(), event);
    }

    #[test]
    fn test_unknown_topic() {
        let err = TopicEvent::from_wire(&json!({ "type": "weather", "data": {} })).unwrap_err();
        assert_eq!(err, PayloadError::UnknownTopic("weather".into()));
    }

    #[test]
    fn test_malformed_payload() {
        let err = TopicEvent::from_wire(&json!({ "type": "music", "data": { "isPlaying": "yes" } }))
            .unwrap_err();
        assert!(matches!(err, PayloadError::Malformed { topic: Topic::Music, .. }));
    }

    #[test]
    fn test_invalid_payload_rejected_on_publish() {
        let event = TopicEvent::Theme(ThemeState { accent: "blue".into() });
        assert!(matches!(event.to_wire(), Err(PayloadError::Invalid { topic: Topic::Theme, .. })));
    }

    #[test]
    fn test_missyou_signal() {
        let wire = json!({
            "type": "missyou",
            "data": { "sender": "Zxhan", "timestamp": 1, "type": "shake" }
        });
        match TopicEvent::from_wire(&wire).unwrap() {
            TopicEvent::MissYou(signal) => {
                assert_eq!(signal.sender, Identity::Zxhan);
                assert_eq!(signal.kind, MissYouKind::Shake);
            }
            other => panic!("Expected missyou, got {other:?}"),
        }
    }

    #[test]
    fn test_persisted_documents() {
        let persisted: Vec<_> = Topic::ALL.into_iter().filter(|t| t.is_persisted_document()).collect();
        assert_eq!(persisted, vec![Topic::Theme, Topic::Music, Topic::Game]);
    }

    #[test]
    fn test_topic_parse() {
        assert_eq!("missyou".parse::<Topic>().unwrap(), Topic::MissYou);
        assert!("MISSYOU".parse::<Topic>().is_err());
    }
}
