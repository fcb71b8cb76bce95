//! Per-user game scores.

use serde::{Deserialize, Deserializer, Serialize};

use crate::identity::Identity;

/// A row of the `scores` table.
///
/// `version` is bumped on every write so that concurrent increments can be
/// applied with compare-and-swap instead of read-modify-write. Rows written
/// before the column existed read as version 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub user_id: Identity,
    pub score: i64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub version: i64,
    #[serde(default)]
    pub updated_at: i64,
}

fn null_as_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or(0))
}

impl ScoreRow {
    /// Whether the row predates versioning.
    pub fn is_unversioned(&self) -> bool {
        self.version == 0
    }

    pub fn first(user: Identity, score: i64, now_ms: i64) -> Self {
        Self { user_id: user, score, version: 1, updated_at: now_ms }
    }

    /// The row that replaces `self` after adding `delta`.
    pub fn bumped(&self, delta: i64, now_ms: i64) -> Self {
        Self {
            user_id: self.user_id,
            score: self.score + delta,
            version: self.version + 1,
            updated_at: now_ms,
        }
    }

    pub fn to_update(&self) -> ScoreUpdate {
        ScoreUpdate { user: self.user_id, score: self.score }
    }
}

/// Broadcast payload of the `scores` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub user: Identity,
    pub score: i64,
}
