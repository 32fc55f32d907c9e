/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Tombstone compaction (spec §4.6). Bounded deletion of tombstones older
//! than a caller-supplied acknowledgement watermark. The engine enforces no
//! policy about what a safe watermark is — that's the caller's job.

use crate::error::{Error, Result};
use crate::schema::ShadowNames;
use rusqlite::Connection;

pub fn compact(conn: &Connection, names: &ShadowNames, watermark: u64) -> Result<usize> {
    conn.execute(
        &format!("DELETE FROM {} WHERE db_version < ?", names.tombstones),
        rusqlite::params![watermark as i64],
    )
    .map_err(|e| Error::execution("compact tombstones", e))
}
