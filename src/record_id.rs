/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The two record-id shapes a tracked table may use: a 64-bit integer
//! rowid, or a 16-byte opaque blob stored in a column named `id`.
//!
//! Represented as a tagged sum rather than via a trait object, per the
//! "generic record-id shape" design note: the shape is fixed once per
//! engine instance and every bind/read path dispatches on the variant
//! directly instead of paying for indirection on every row.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordId {
    Integer(i64),
    Blob([u8; 16]),
}

/// Which record-id shape an engine instance was constructed with. Fixed for
/// the lifetime of the engine (spec §3: "The shape is fixed per engine
/// instance").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordIdShape {
    Integer,
    Blob,
}

impl RecordId {
    pub fn shape(&self) -> RecordIdShape {
        match self {
            RecordId::Integer(_) => RecordIdShape::Integer,
            RecordId::Blob(_) => RecordIdShape::Blob,
        }
    }

    /// The SQL identifier used to reference this record's id column in
    /// triggers and queries: `rowid` for integer mode, `id` for blob mode.
    pub fn id_column(shape: RecordIdShape) -> &'static str {
        match shape {
            RecordIdShape::Integer => "rowid",
            RecordIdShape::Blob => "id",
        }
    }

    pub fn from_sql_ref(shape: RecordIdShape, raw: ValueRef<'_>) -> FromSqlResult<Self> {
        match (shape, raw) {
            (RecordIdShape::Integer, ValueRef::Integer(i)) => Ok(RecordId::Integer(i)),
            (RecordIdShape::Blob, ValueRef::Blob(b)) if b.len() == 16 => {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(b);
                Ok(RecordId::Blob(buf))
            }
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Integer(i) => write!(f, "{i}"),
            RecordId::Blob(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl ToSql for RecordId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            RecordId::Integer(i) => ToSqlOutput::from(*i),
            RecordId::Blob(b) => ToSqlOutput::from(b.to_vec()),
        })
    }
}

impl FromSql for RecordId {
    fn column_result(raw: ValueRef<'_>) -> FromSqlResult<Self> {
        match raw {
            ValueRef::Integer(i) => Ok(RecordId::Integer(i)),
            ValueRef::Blob(b) if b.len() == 16 => {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(b);
                Ok(RecordId::Blob(buf))
            }
            ValueRef::Blob(_) => Err(FromSqlError::InvalidType),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_column_matches_shape() {
        assert_eq!(RecordId::id_column(RecordIdShape::Integer), "rowid");
        assert_eq!(RecordId::id_column(RecordIdShape::Blob), "id");
    }

    #[test]
    fn blob_round_trips_via_to_sql_and_from_sql_ref() {
        let id = RecordId::Blob([7u8; 16]);
        let sql_out = id.to_sql().unwrap();
        // exercised indirectly through sqlite in integration tests; here we
        // just assert the shape tag survives a display round trip.
        assert_eq!(format!("{id}").len(), 32);
        drop(sql_out);
    }
}
