//! Presence records and the last-write-wins presence view.
//!
//! Each client owns exactly one record (its own identity) and rewrites it on
//! lifecycle events. Peers learn about it three ways: tracked presence, the
//! `presence` broadcast, and the persisted `presence` table for late joiners.
//! Because those paths race, every consumer folds records through
//! [`PresenceView`], which keeps the record with the greatest `lastSeen`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    pub fn is_online(self) -> bool {
        matches!(self, PresenceStatus::Online)
    }
}

/// Presence as broadcast between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user: Identity,
    pub is_online: bool,
    pub status: PresenceStatus,
    pub last_seen: i64,
}

impl PresenceRecord {
    pub fn new(user: Identity, status: PresenceStatus, last_seen: i64) -> Self {
        Self {
            user,
            is_online: status.is_online(),
            status,
            last_seen,
        }
    }

    pub fn to_row(&self) -> PresenceRow {
        PresenceRow {
            user_id: self.user,
            is_online: self.is_online,
            status: Some(self.status),
            last_seen: self.last_seen,
        }
    }
}

/// Presence as stored in the `presence` table.
///
/// Older rows have no `status` column; it is derived from `is_online`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRow {
    pub user_id: Identity,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
    #[serde(default)]
    pub last_seen: i64,
}

impl PresenceRow {
    pub fn to_record(&self) -> PresenceRecord {
        let status = self.status.unwrap_or(if self.is_online {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        });
        PresenceRecord {
            user: self.user_id,
            is_online: self.is_online,
            status,
            last_seen: self.last_seen,
        }
    }
}

/// Latest known presence per identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceView {
    records: BTreeMap<Identity, PresenceRecord>,
}

impl PresenceView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a record. Records older than the one held are ignored.
    ///
    /// Returns `true` if the view changed. Equal timestamps let the later
    /// arrival win.
    pub fn apply(&mut self, record: PresenceRecord) -> bool {
        match self.records.get(&record.user) {
            Some(current) if record.last_seen < current.last_seen => false,
            Some(current) if *current == record => false,
            _ => {
                self.records.insert(record.user, record);
                true
            }
        }
    }

    pub fn get(&self, user: Identity) -> Option<&PresenceRecord> {
        self.records.get(&user)
    }

    pub fn is_online(&self, user: Identity) -> bool {
        self.records.get(&user).map(|r| r.is_online).unwrap_or(false)
    }

    pub fn records(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_updates_keep_latest() {
        let t1 = PresenceRecord::new(Identity::Anvi, PresenceStatus::Offline, 100);
        let t2 = PresenceRecord::new(Identity::Anvi, PresenceStatus::Online, 200);

        let mut view = PresenceView::new();
        assert!(view.apply(t2.clone()));
        assert!(!view.apply(t1));

        assert_eq!(view.get(Identity::Anvi), Some(&t2));
        assert!(view.is_online(Identity::Anvi));
    }

    #[test]
    fn test_in_order_updates_replace() {
        let mut view = PresenceView::new();
        view.apply(PresenceRecord::new(Identity::Zxhan, PresenceStatus::Online, 1));
        view.apply(PresenceRecord::new(Identity::Zxhan, PresenceStatus::Away, 2));

        let record = view.get(Identity::Zxhan).unwrap();
        assert_eq!(record.status, PresenceStatus::Away);
        assert!(!record.is_online);
    }

    #[test]
    fn test_identities_tracked_independently() {
        let mut view = PresenceView::new();
        view.apply(PresenceRecord::new(Identity::Zxhan, PresenceStatus::Online, 50));
        view.apply(PresenceRecord::new(Identity::Anvi, PresenceStatus::Online, 10));
        assert_eq!(view.len(), 2);
        assert!(view.is_online(Identity::Anvi));
    }

    #[test]
    fn test_duplicate_record_reports_no_change() {
        let mut view = PresenceView::new();
        let r = PresenceRecord::new(Identity::Anvi, PresenceStatus::Online, 7);
        assert!(view.apply(r.clone()));
        assert!(!view.apply(r));
    }

    #[test]
    fn test_legacy_row_without_status() {
        let row: PresenceRow = serde_json::from_value(serde_json::json!({
            "user_id": "Zxhan",
            "is_online": false,
            "last_seen": 9
        }))
        .unwrap();
        let record = row.to_record();
        assert_eq!(record.status, PresenceStatus::Offline);
        assert_eq!(record.last_seen, 9);
    }

    #[test]
    fn test_wire_shape() {
        let r = PresenceRecord::new(Identity::Anvi, PresenceStatus::Away, 42);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["user"], "Anvi");
        assert_eq!(v["isOnline"], false);
        assert_eq!(v["status"], "away");
        assert_eq!(v["lastSeen"], 42);
    }
}
