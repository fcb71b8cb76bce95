//! Chat messages, emoji reactions and the pending/confirmed timeline.
//!
//! Field names follow the `messages` table columns, so a `ChatMessage`
//! serializes directly into an insertable row.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::identity::Identity;

const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Voice,
}

impl MessageKind {
    /// Advisory lifetime stamped into `expiresAt`. Nothing prunes on it yet.
    pub fn lifetime_ms(self) -> i64 {
        match self {
            MessageKind::Text => 48 * HOUR_MS,
            MessageKind::Image => 12 * HOUR_MS,
            MessageKind::Voice => 24 * HOUR_MS,
        }
    }
}

/// Emoji → users who reacted with it.
///
/// An emoji key is present only while at least one user holds it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reactions(BTreeMap<String, Vec<Identity>>);

impl Reactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle `user`'s membership for `emoji`.
    ///
    /// Returns `true` if the reaction was added, `false` if it was removed.
    pub fn toggle(&mut self, emoji: &str, user: Identity) -> bool {
        let users = self.0.entry(emoji.to_string()).or_default();
        let added = if let Some(pos) = users.iter().position(|u| *u == user) {
            users.remove(pos);
            false
        } else {
            users.push(user);
            true
        };
        if users.is_empty() {
            self.0.remove(emoji);
        }
        added
    }

    /// Users currently holding `emoji`.
    pub fn users(&self, emoji: &str) -> &[Identity] {
        self.0.get(emoji).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, emoji: &str) -> bool {
        self.0.contains_key(emoji)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Identity])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender: Identity,
    /// Text, or the encoded audio clip for voice notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Encoded image data for image messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: i64,
    pub expires_at: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub reactions: Reactions,
}

impl ChatMessage {
    pub fn new(
        sender: Identity,
        kind: MessageKind,
        content: Option<String>,
        image: Option<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: Self::generate_id(),
            sender,
            content,
            image,
            kind,
            timestamp,
            expires_at: timestamp + kind.lifetime_ms(),
            reactions: Reactions::new(),
        }
    }

    pub fn text(sender: Identity, text: impl Into<String>) -> Self {
        Self::new(sender, MessageKind::Text, Some(text.into()), None, crate::now_millis())
    }

    pub fn image(sender: Identity, data: impl Into<String>) -> Self {
        Self::new(sender, MessageKind::Image, None, Some(data.into()), crate::now_millis())
    }

    /// Voice notes carry the encoded clip in `content`.
    pub fn voice(sender: Identity, audio: impl Into<String>) -> Self {
        Self::new(sender, MessageKind::Voice, Some(audio.into()), None, crate::now_millis())
    }

    /// Random, collision-improbable client-side id.
    pub fn generate_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A message as shown to the user, flagged while it still sits in the
/// offline queue.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub message: ChatMessage,
    pub pending: bool,
}

/// Fold remotely confirmed messages and still-queued ones into a single
/// timeline, deduplicated by id and sorted by timestamp.
///
/// A message present in both lists is shown as confirmed.
pub fn merge_timeline(confirmed: &[ChatMessage], pending: &[ChatMessage]) -> Vec<TimelineEntry> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(confirmed.len() + pending.len());
    let mut entries = Vec::with_capacity(confirmed.len() + pending.len());

    for message in confirmed {
        if seen.insert(message.id.as_str()) {
            entries.push(TimelineEntry { message: message.clone(), pending: false });
        }
    }
    for message in pending {
        if seen.insert(message.id.as_str()) {
            entries.push(TimelineEntry { message: message.clone(), pending: true });
        }
    }

    entries.sort_by(|a, b| {
        a.message
            .timestamp
            .cmp(&b.message.timestamp)
            .then_with(|| a.message.id.cmp(&b.message.id))
    });
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_at(id: &str, ts: i64) -> ChatMessage {
        let mut m = ChatMessage::new(Identity::Anvi, MessageKind::Text, Some(id.into()), None, ts);
        m.id = id.to_string();
        m
    }

    #[test]
    fn test_reaction_toggle_twice_removes_user_and_key() {
        let mut reactions = Reactions::new();
        assert!(reactions.toggle("🔥", Identity::Anvi));
        assert_eq!(reactions.users("🔥"), &[Identity::Anvi]);

        assert!(!reactions.toggle("🔥", Identity::Anvi));
        assert!(reactions.users("🔥").is_empty());
        assert!(!reactions.contains("🔥"));
        assert!(reactions.is_empty());
    }

    #[test]
    fn test_reaction_toggle_keeps_other_user() {
        let mut reactions = Reactions::new();
        reactions.toggle("❤️", Identity::Anvi);
        reactions.toggle("❤️", Identity::Zxhan);
        reactions.toggle("❤️", Identity::Anvi);

        assert_eq!(reactions.users("❤️"), &[Identity::Zxhan]);
        assert_eq!(reactions.len(), 1);
    }

    #[test]
    fn test_expiry_per_kind() {
        let text = ChatMessage::new(Identity::Anvi, MessageKind::Text, Some("hi".into()), None, 0);
        let image = ChatMessage::new(Identity::Anvi, MessageKind::Image, None, Some("b64".into()), 0);
        let voice = ChatMessage::new(Identity::Anvi, MessageKind::Voice, Some("ogg".into()), None, 0);

        assert_eq!(text.expires_at, 48 * HOUR_MS);
        assert_eq!(image.expires_at, 12 * HOUR_MS);
        assert_eq!(voice.expires_at, 24 * HOUR_MS);
        assert!(image.is_expired(12 * HOUR_MS));
        assert!(!text.is_expired(12 * HOUR_MS));
    }

    #[test]
    fn test_row_shape_matches_table_columns() {
        let mut m = msg_at("abc", 10);
        m.reactions.toggle("✨", Identity::Zxhan);
        let value = serde_json::to_value(&m).unwrap();

        assert_eq!(value["id"], "abc");
        assert_eq!(value["type"], "text");
        assert_eq!(value["expiresAt"], 10 + 48 * HOUR_MS);
        assert_eq!(value["reactions"]["✨"][0], "Zxhan");
        assert!(value.get("image").is_none());
    }

    #[test]
    fn test_null_reactions_from_backend() {
        let row = serde_json::json!({
            "id": "x1",
            "sender": "Anvi",
            "content": "hey",
            "type": "text",
            "timestamp": 5,
            "expiresAt": 6,
            "reactions": null
        });
        let m: ChatMessage = serde_json::from_value(row).unwrap();
        assert!(m.reactions.is_empty());
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(ChatMessage::generate_id(), ChatMessage::generate_id());
    }

    #[test]
    fn test_merge_timeline_dedups_and_sorts() {
        let confirmed = vec![msg_at("b", 20), msg_at("a", 10)];
        let pending = vec![msg_at("c", 15), msg_at("b", 20)];

        let timeline = merge_timeline(&confirmed, &pending);
        let ids: Vec<&str> = timeline.iter().map(|e| e.message.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);

        let flags: Vec<bool> = timeline.iter().map(|e| e.pending).collect();
        assert_eq!(flags, vec![false, true, false]);
    }
}
