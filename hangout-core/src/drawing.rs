//! Shared canvas actions and their persisted stroke records.
//!
//! Coordinates are normalized to the sender's canvas size so both peers can
//! replay strokes at their own resolution.

use serde::{Deserialize, Serialize};

use crate::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrokeKind {
    Draw,
    Stamp,
    Clear,
}

/// One atomic action on the drawing surface, as broadcast on `drawing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DrawingAction {
    /// A line segment from the last synced point to (`x`, `y`).
    Draw {
        user: Identity,
        x: f64,
        y: f64,
        #[serde(rename = "lastX")]
        last_x: f64,
        #[serde(rename = "lastY")]
        last_y: f64,
        color: String,
        size: f64,
        tool: String,
    },
    /// An emoji stamped at (`x`, `y`).
    Stamp {
        user: Identity,
        x: f64,
        y: f64,
        emoji: String,
        size: f64,
    },
    /// Wipe the whole canvas.
    Clear { user: Identity },
}

impl DrawingAction {
    pub fn kind(&self) -> StrokeKind {
        match self {
            DrawingAction::Draw { .. } => StrokeKind::Draw,
            DrawingAction::Stamp { .. } => StrokeKind::Stamp,
            DrawingAction::Clear { .. } => StrokeKind::Clear,
        }
    }

    pub fn user(&self) -> Identity {
        match self {
            DrawingAction::Draw { user, .. }
            | DrawingAction::Stamp { user, .. }
            | DrawingAction::Clear { user } => *user,
        }
    }

    /// Whether this action originated from `identity`.
    ///
    /// Consumers skip their own actions when they round-trip back.
    pub fn is_from(&self, identity: Identity) -> bool {
        self.user() == identity
    }

    /// Reject coordinates outside the canvas, empty colors/emoji and
    /// non-positive sizes.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            DrawingAction::Draw { x, y, last_x, last_y, color, size, tool, .. } => {
                if ![*x, *y, *last_x, *last_y].into_iter().all(on_canvas) {
                    return Err(format!("draw coordinates ({x}, {y}) from ({last_x}, {last_y}) are off the canvas"));
                }
                if color.trim().is_empty() {
                    return Err("draw color is empty".into());
                }
                if tool.trim().is_empty() {
                    return Err("draw tool is empty".into());
                }
                if !(size.is_finite() && *size > 0.0) {
                    return Err(format!("draw size {size} must be positive"));
                }
                Ok(())
            }
            DrawingAction::Stamp { x, y, emoji, size, .. } => {
                if !(on_canvas(*x) && on_canvas(*y)) {
                    return Err(format!("stamp coordinates ({x}, {y}) are off the canvas"));
                }
                if emoji.is_empty() {
                    return Err("stamp emoji is empty".into());
                }
                if !(size.is_finite() && *size > 0.0) {
                    return Err(format!("stamp size {size} must be positive"));
                }
                Ok(())
            }
            DrawingAction::Clear { .. } => Ok(()),
        }
    }
}

/// How far past an edge a normalized coordinate may land. Pointer events
/// overshoot slightly when a stroke leaves the canvas.
pub const CANVAS_MARGIN: f64 = 0.05;

fn on_canvas(v: f64) -> bool {
    v.is_finite() && (-CANVAS_MARGIN..=1.0 + CANVAS_MARGIN).contains(&v)
}

/// A row of the append-only `strokes` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeRecord {
    #[serde(rename = "type")]
    pub kind: StrokeKind,
    pub user: Identity,
    pub payload: DrawingAction,
    pub timestamp: i64,
}

impl StrokeRecord {
    pub fn from_action(action: DrawingAction, timestamp: i64) -> Self {
        Self {
            kind: action.kind(),
            user: action.user(),
            payload: action,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(user: Identity) -> DrawingAction {
        DrawingAction::Draw {
            user,
            x: 0.5,
            y: 0.25,
            last_x: 0.4,
            last_y: 0.2,
            color: "#ff3366".into(),
            size: 4.0,
            tool: "pen".into(),
        }
    }

    #[test]
    fn test_draw_wire_shape() {
        let v = serde_json::to_value(segment(Identity::Anvi)).unwrap();
        assert_eq!(v["type"], "draw");
        assert_eq!(v["user"], "Anvi");
        assert_eq!(v["lastX"], 0.4);
        assert_eq!(v["tool"], "pen");
    }

    #[test]
    fn test_clear_parses_from_minimal_payload() {
        let action: DrawingAction =
            serde_json::from_value(serde_json::json!({ "type": "clear", "user": "Zxhan" })).unwrap();
        assert_eq!(action, DrawingAction::Clear { user: Identity::Zxhan });
        assert_eq!(action.kind(), StrokeKind::Clear);
    }

    #[test]
    fn test_self_filter() {
        let action = segment(Identity::Zxhan);
        assert!(action.is_from(Identity::Zxhan));
        assert!(!action.is_from(Identity::Anvi));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut bad = segment(Identity::Anvi);
        if let DrawingAction::Draw { ref mut x, .. } = bad {
            *x = f64::NAN;
        }
        assert!(bad.validate().is_err());

        let stamp = DrawingAction::Stamp {
            user: Identity::Anvi,
            x: 0.1,
            y: 0.1,
            emoji: String::new(),
            size: 3.0,
        };
        assert!(stamp.validate().is_err());
        assert!(segment(Identity::Anvi).validate().is_ok());
    }

    #[test]
    fn test_validate_canvas_range() {
        let stamp = |x: f64| DrawingAction::Stamp {
            user: Identity::Zxhan,
            x,
            y: 0.5,
            emoji: "⭐".into(),
            size: 3.0,
        };
        assert!(stamp(0.0).validate().is_ok());
        assert!(stamp(1.0).validate().is_ok());
        assert!(stamp(1.03).validate().is_ok());
        assert!(stamp(-0.02).validate().is_ok());
        assert!(stamp(1.5).validate().is_err());
        assert!(stamp(-0.2).validate().is_err());
        assert!(stamp(640.0).validate().is_err());

        let mut stroke = segment(Identity::Anvi);
        if let DrawingAction::Draw { ref mut last_y, .. } = stroke {
            *last_y = 2.0;
        }
        assert!(stroke.validate().is_err());
    }

    #[test]
    fn test_stroke_record_row() {
        let record = StrokeRecord::from_action(segment(Identity::Anvi), 77);
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["type"], "draw");
        assert_eq!(v["user"], "Anvi");
        assert_eq!(v["timestamp"], 77);
        assert_eq!(v["payload"]["type"], "draw");
    }
}
