//! Synchronized documents: theme, music playback and the current game.
//!
//! These are "current value" documents. Each publish replaces the previous
//! one both live and in the `sync_state` table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::identity::Identity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeState {
    pub accent: String,
}

impl ThemeState {
    /// Accent must be a `#rgb` or `#rrggbb` hex color.
    pub fn validate(&self) -> Result<(), String> {
        let hex = self
            .accent
            .strip_prefix('#')
            .ok_or_else(|| format!("accent {:?} is not a hex color", self.accent))?;
        if !(hex.len() == 3 || hex.len() == 6) || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("accent {:?} is not a hex color", self.accent));
        }
        Ok(())
    }
}

/// Shared music player state.
///
/// A bare play/pause toggle only carries `isPlaying`; a new track carries
/// everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MusicState {
    pub is_playing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub added_by: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
}

impl MusicState {
    pub fn playing(yt_id: impl Into<String>, title: impl Into<String>, added_by: Identity, start_time: i64) -> Self {
        Self {
            is_playing: true,
            yt_id: Some(yt_id.into()),
            title: Some(title.into()),
            added_by: Some(added_by),
            start_time: Some(start_time),
        }
    }

    /// Video ids are 11 characters of `[A-Za-z0-9_-]`. An empty id means
    /// nothing is loaded.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(id) = self.yt_id.as_deref().filter(|id| !id.is_empty()) {
            let ok = id.len() == 11
                && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !ok {
                return Err(format!("video id {id:?} is malformed"));
            }
        }
        Ok(())
    }
}

/// One placed tic-tac-toe mark, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicTacToeMark {
    pub index: usize,
    pub symbol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordStatus {
    Setting,
    Guessing,
    Won,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordState {
    pub word: String,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub guesses: Vec<String>,
    /// Empty while nobody has set a word yet.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub setter: Option<Identity>,
    pub status: WordStatus,
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<Identity>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(name) => name.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruthOrDare {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRound {
    pub status: String,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub scores: BTreeMap<String, i64>,
}

/// The game currently on screen, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GameState {
    #[serde(rename_all = "camelCase")]
    TicTacToe {
        board: Vec<Option<String>>,
        x_is_next: bool,
        #[serde(default)]
        history: Vec<TicTacToeMark>,
    },
    #[serde(rename = "connect4")]
    ConnectFour {
        board: Vec<Vec<Option<Identity>>>,
        turn: Identity,
    },
    Rps {
        state: BTreeMap<Identity, Option<String>>,
    },
    Word {
        state: WordState,
    },
    TruthOrDare {
        active: TruthOrDare,
    },
    Reaction {
        state: ReactionRound,
    },
}

pub const TIC_TAC_TOE_CELLS: usize = 9;
pub const CONNECT_FOUR_ROWS: usize = 6;
pub const CONNECT_FOUR_COLS: usize = 7;

impl GameState {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            GameState::TicTacToe { board, history, .. } => {
                if board.len() != TIC_TAC_TOE_CELLS {
                    return Err(format!("tictactoe board has {} cells", board.len()));
                }
                let bad_cell = board
                    .iter()
                    .flatten()
                    .find(|s| s.as_str() != "X" && s.as_str() != "O");
                if let Some(cell) = bad_cell {
                    return Err(format!("tictactoe cell {cell:?} is not X or O"));
                }
                if let Some(mark) = history.iter().find(|m| m.index >= TIC_TAC_TOE_CELLS) {
                    return Err(format!("tictactoe history index {} out of range", mark.index));
                }
                Ok(())
            }
            GameState::ConnectFour { board, .. } => {
                if board.len() != CONNECT_FOUR_ROWS
                    || board.iter().any(|row| row.len() != CONNECT_FOUR_COLS)
                {
                    return Err("connect4 board must be 6x7".into());
                }
                Ok(())
            }
            GameState::Word { state } => {
                if state.status != WordStatus::Setting && state.word.trim().is_empty() {
                    return Err("word game in progress without a word".into());
                }
                Ok(())
            }
            GameState::Rps { .. } | GameState::TruthOrDare { .. } | GameState::Reaction { .. } => Ok(()),
        }
    }
}
