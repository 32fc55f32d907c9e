/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A tagged database value that round-trips through both `rusqlite` bind/
//! read paths and a self-describing wire form. The user column's declared
//! type is advisory only: this type carries its own tag, matching SQLite's
//! own manifest typing.

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    #[serde(with = "blob_base64")]
    Blob(Vec<u8>),
}

impl Value {
    pub fn from_sql_ref(raw: ValueRef<'_>) -> Self {
        match raw {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Real(r) => ToSqlOutput::from(*r),
            Value::Text(t) => ToSqlOutput::from(t.as_str()),
            Value::Blob(b) => ToSqlOutput::from(b.as_slice()),
        })
    }
}

impl FromSql for Value {
    fn column_result(raw: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(Value::from_sql_ref(raw))
    }
}

// PartialEq on f64 in a derive is fine for our purposes (we never NaN-compare
// production values; this type only ever carries what SQLite itself stored).
impl Eq for Value {}

#[allow(clippy::derived_hash_with_manual_eq)]
impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Integer(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            Value::Real(r) => {
                2u8.hash(state);
                r.to_bits().hash(state);
            }
            Value::Text(t) => {
                3u8.hash(state);
                t.hash(state);
            }
            Value::Blob(b) => {
                4u8.hash(state);
                b.hash(state);
            }
        }
    }
}

// Blob bytes have no native JSON representation, so the wire form carries
// them base64-encoded, same as sync15's BSO payloads (bso_record.rs) and
// the key material in key_bundle.rs.
mod blob_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
