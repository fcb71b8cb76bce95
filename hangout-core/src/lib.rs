//! # hangout-core: Domain model for the two-person hangout
//!
//! Pure data types shared by the sync layer and its consumers. Nothing in
//! this crate touches the network or the disk.
//!
//! ## Architecture
//!
//! ```text
//!  feature code (chat, canvas, games, music, presence)
//!        │
//!        ▼
//!  ┌──────────────┐   validate    ┌──────────────┐
//!  │ TopicEvent   │ ────────────► │ wire payload │  { "type", "data" }
//!  │ (sum type)   │ ◄──────────── │ (JSON)       │
//!  └──────────────┘   decode      └──────────────┘
//!        │
//!        ├── ChatMessage / Reactions / timeline merge
//!        ├── PresenceRecord / PresenceView (last write wins)
//!        ├── DrawingAction / StrokeRecord
//!        └── ThemeState / MusicState / GameState
//! ```
//!
//! ## Modules
//!
//! - [`identity`]: the two fixed participants
//! - [`event`]: typed topic events and boundary validation
//! - [`message`]: chat messages, reactions, pending/confirmed timeline
//! - [`presence`]: presence records and the last-write-wins view
//! - [`drawing`]: canvas actions and persisted stroke records
//! - [`media`]: theme, music and game documents
//! - [`score`]: per-user score rows
//! - [`notification`]: persisted nudges between the two users

pub mod identity;
pub mod event;
pub mod message;
pub mod presence;
pub mod drawing;
pub mod media;
pub mod score;
pub mod notification;

pub use identity::Identity;
pub use event::{MissYouKind, MissYouSignal, PayloadError, Topic, TopicEvent, BROADCAST_EVENT};
pub use message::{merge_timeline, ChatMessage, MessageKind, Reactions, TimelineEntry};
pub use presence::{PresenceRecord, PresenceRow, PresenceStatus, PresenceView};
pub use drawing::{DrawingAction, StrokeKind, StrokeRecord, CANVAS_MARGIN};
pub use media::{GameState, MusicState, ThemeState, TicTacToeMark, WordState, WordStatus};
pub use score::{ScoreRow, ScoreUpdate};
pub use notification::Notification;

use std::time::SystemTime;

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
