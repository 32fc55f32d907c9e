/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The wire unit handed between replicas (spec §3, §6). Self-describing via
//! `serde_json`, the option the spec explicitly allows ("implementations
//! may choose a self-describing encoding... provided both sides agree").

use crate::record_id::RecordId;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// A single change: either a column edit or (when `column_name` is absent) a
/// record-level tombstone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub record_id: RecordId,
    pub column_name: Option<String>,
    pub value: Option<Value>,
    pub column_version: u64,
    pub db_version: u64,
    pub node_id: u64,
    /// Local sync cursor only; never compared across replicas.
    pub local_db_version: u64,
    /// Transient, not persisted — reserved for future wire flags.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub flags: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl Change {
    pub fn is_tombstone(&self) -> bool {
        self.column_name.is_none()
    }

    /// Encode a single change as a JSON wire string.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_wire(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Encode a sequence of changes as a JSON array, the unit exchanged
    /// between `changes_since` and `merge` per spec §6.
    pub fn encode_sequence(changes: &[Change]) -> serde_json::Result<String> {
        serde_json::to_string(changes)
    }

    pub fn decode_sequence(s: &str) -> serde_json::Result<Vec<Change>> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_change_round_trips_through_json() {
        let change = Change {
            record_id: RecordId::Integer(1),
            column_name: Some("name".into()),
            value: Some(Value::Text("Alice".into())),
            column_version: 1,
            db_version: 1,
            node_id: 42,
            local_db_version: 1,
            flags: 0,
        };
        let wire = change.to_wire().unwrap();
        let back = Change::from_wire(&wire).unwrap();
        assert_eq!(change, back);
        assert!(!back.is_tombstone());
    }

    #[test]
    fn tombstone_has_no_column_name_or_value() {
        let change = Change {
            record_id: RecordId::Blob([9u8; 16]),
            column_name: None,
            value: None,
            column_version: 0,
            db_version: 5,
            node_id: 7,
            local_db_version: 9,
            flags: 0,
        };
        assert!(change.is_tombstone());
        let wire = change.to_wire().unwrap();
        let back = Change::from_wire(&wire).unwrap();
        assert_eq!(change, back);
    }

    #[test]
    fn blob_values_round_trip_losslessly() {
        let change = Change {
            record_id: RecordId::Integer(1),
            column_name: Some("avatar".into()),
            value: Some(Value::Blob(vec![0, 1, 2, 255, 254])),
            column_version: 3,
            db_version: 3,
            node_id: 1,
            local_db_version: 3,
            flags: 0,
        };
        let encoded = Change::encode_sequence(&[change.clone()]).unwrap();
        let decoded = Change::decode_sequence(&encoded).unwrap();
        assert_eq!(decoded, vec![change]);
    }
}
