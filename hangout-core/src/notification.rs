//! Persisted nudges from one participant to the other.

use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// A row of the `notifications` table.
///
/// `kind` is free text shown to the recipient, e.g. "Anvi was missing u".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub sender: Identity,
    pub recipient: Identity,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
}

impl Notification {
    pub fn new(sender: Identity, recipient: Identity, kind: impl Into<String>, timestamp: i64) -> Self {
        Self { sender, recipient, kind: kind.into(), timestamp }
    }

    /// The text sent along with a "miss you" nudge.
    pub fn missing_you_text(sender: Identity) -> String {
        format!("{sender} was missing u")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_shape() {
        let n = Notification::new(Identity::Anvi, Identity::Zxhan, "hi", 5);
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["type"], "hi");
        assert_eq!(v["recipient"], "Zxhan");
    }

    #[test]
    fn test_missing_you_text() {
        assert_eq!(Notification::missing_you_text(Identity::Anvi), "Anvi was missing u");
    }
}
