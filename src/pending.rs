/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Post-commit promotion (spec §4.2). Drains the pending buffer populated
//! by triggers, advancing the per-table logical clock and writing version /
//! tombstone rows. Runs in its own short transaction immediately after the
//! user's write transaction has committed and control has returned to the
//! engine — see `hooks.rs` for why this can't run from inside the raw
//! SQLite commit-hook callback itself.

use crate::conn_ext::ConnExt;
use crate::error::{Error, Result};
use crate::schema::{op, ShadowNames};
use crate::value::Value;
use rusqlite::Connection;

struct PendingRow {
    operation: i64,
    record_id: Value,
    column_name: String,
}

/// Drain every row currently in `pending`, in insertion order, advancing the
/// clock once per row. Returns the new clock value.
pub fn drain_pending(conn: &Connection, names: &ShadowNames, node_id: u64) -> Result<u64> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| Error::execution("BEGIN IMMEDIATE (drain)", e))?;

    match drain_pending_inner(conn, names, node_id) {
        Ok(k) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| Error::execution("COMMIT (drain)", e))?;
            Ok(k)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn drain_pending_inner(conn: &Connection, names: &ShadowNames, node_id: u64) -> Result<u64> {
    let mut k: u64 = conn
        .query_one_i64(&format!("SELECT time FROM {}", names.clock))
        .map_err(|e| Error::execution("read clock", e))? as u64;

    let rows = {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT operation, record_id, column_name FROM {} ORDER BY seq ASC",
                names.pending
            ))
            .map_err(|e| Error::prepare("select pending", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PendingRow {
                    operation: row.get(0)?,
                    record_id: row.get(1)?,
                    column_name: row.get(2)?,
                })
            })
            .map_err(|e| Error::execution("scan pending", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::execution("scan pending", e))?;
        rows
    };

    log::trace!("draining {} pending row(s) for {}", rows.len(), names.pending);
    for row in rows {
        if row.operation == op::DELETE {
            k = k
                .checked_add(1)
                .ok_or(Error::ClockOverflow)?;
            log::debug!("promoting tombstone for record {:?} at db_version {k}", row.record_id);
            conn.execute(
                &format!(
                    "INSERT INTO {tombstones} (record_id, db_version, node_id, local_db_version)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(record_id) DO UPDATE SET
                        db_version = excluded.db_version,
                        node_id = excluded.node_id,
                        local_db_version = excluded.local_db_version",
                    tombstones = names.tombstones
                ),
                rusqlite::params![row.record_id, k as i64, node_id as i64, k as i64],
            )
            .map_err(|e| Error::execution("upsert tombstone", e))?;
        } else {
            let existing: Option<i64> = conn
                .try_query_row(
                    &format!(
                        "SELECT column_version FROM {versions} WHERE record_id = ? AND column_name = ?",
                        versions = names.versions
                    ),
                    &[&row.record_id, &row.column_name],
                    |r| r.get(0),
                )
                .map_err(|e| Error::execution("read column_version", e))?;
            let new_version = existing.unwrap_or(0) + 1;
            k = k
                .checked_add(1)
                .ok_or(Error::ClockOverflow)?;
            log::debug!(
                "promoting column `{}` of record {:?} to column_version {new_version} at db_version {k}",
                row.column_name,
                row.record_id
            );
            conn.execute(
                &format!(
                    "INSERT INTO {versions} (record_id, column_name, column_version, db_version, node_id, local_db_version)
                     VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT(record_id, column_name) DO UPDATE SET
                        column_version = excluded.column_version,
                        db_version = excluded.db_version,
                        node_id = excluded.node_id,
                        local_db_version = excluded.local_db_version",
                    versions = names.versions
                ),
                rusqlite::params![row.record_id, row.column_name, new_version, k as i64, node_id as i64, k as i64],
            )
            .map_err(|e| Error::execution("upsert version", e))?;
        }
    }

    conn.execute(&format!("DELETE FROM {}", names.pending), [])
        .map_err(|e| Error::execution("truncate pending", e))?;
    conn.execute(
        &format!("UPDATE {} SET time = ?", names.clock),
        rusqlite::params![k as i64],
    )
    .map_err(|e| Error::execution("advance clock", e))?;

    Ok(k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_id::RecordIdShape;
    use crate::schema::{install_shadow_tables, ShadowNames};
    use crate::triggers::create_triggers;

    fn setup() -> (Connection, ShadowNames) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT)")
            .unwrap();
        let names = ShadowNames::for_table("users");
        install_shadow_tables(&conn, &names).unwrap();
        conn.execute(&format!("INSERT INTO {} (time) VALUES (0)", names.clock), [])
            .unwrap();
        create_triggers(
            &conn,
            "users",
            RecordIdShape::Integer,
            &names,
            &["name".to_string(), "email".to_string()],
        )
        .unwrap();
        (conn, names)
    }

    #[test]
    fn drain_promotes_insert_columns_and_advances_clock() {
        let (conn, names) = setup();
        conn.execute(
            "INSERT INTO users (name, email) VALUES ('Alice', 'alice@x')",
            [],
        )
        .unwrap();
        let k = drain_pending(&conn, &names, 1).unwrap();
        assert_eq!(k, 2);
        let pending_count: i64 = conn
            .query_one_i64(&format!("SELECT COUNT(*) FROM {}", names.pending))
            .unwrap();
        assert_eq!(pending_count, 0);
        let versions_count: i64 = conn
            .query_one_i64(&format!("SELECT COUNT(*) FROM {}", names.versions))
            .unwrap();
        assert_eq!(versions_count, 2);
    }

    #[test]
    fn drain_increments_column_version_on_repeat_writes() {
        let (conn, names) = setup();
        conn.execute(
            "INSERT INTO users (name, email) VALUES ('Alice', 'alice@x')",
            [],
        )
        .unwrap();
        drain_pending(&conn, &names, 1).unwrap();
        conn.execute("UPDATE users SET email = 'a2@x' WHERE id = 1", [])
            .unwrap();
        drain_pending(&conn, &names, 1).unwrap();
        let version: i64 = conn
            .query_row_and_then(
                &format!(
                    "SELECT column_version FROM {} WHERE record_id = 1 AND column_name = 'email'",
                    names.versions
                ),
                &[],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn drain_writes_tombstone_on_delete() {
        let (conn, names) = setup();
        conn.execute(
            "INSERT INTO users (name, email) VALUES ('Alice', 'alice@x')",
            [],
        )
        .unwrap();
        drain_pending(&conn, &names, 1).unwrap();
        conn.execute("DELETE FROM users WHERE id = 1", []).unwrap();
        drain_pending(&conn, &names, 1).unwrap();
        let tombstones: i64 = conn
            .query_one_i64(&format!("SELECT COUNT(*) FROM {}", names.tombstones))
            .unwrap();
        assert_eq!(tombstones, 1);
    }

    #[test]
    fn drain_reports_clock_overflow_without_truncating_pending() {
        let (conn, names) = setup();
        conn.execute(
            "INSERT INTO users (name, email) VALUES ('Alice', 'alice@x')",
            [],
        )
        .unwrap();
        // -1 stored in an INTEGER column reinterprets as u64::MAX once read
        // back and cast, simulating a clock already at the top of its range.
        conn.execute(&format!("UPDATE {} SET time = -1", names.clock), [])
            .unwrap();

        let err = drain_pending(&conn, &names, 1).unwrap_err();
        assert!(matches!(err, Error::ClockOverflow));

        let pending_count: i64 = conn
            .query_one_i64(&format!("SELECT COUNT(*) FROM {}", names.pending))
            .unwrap();
        assert_eq!(pending_count, 2, "a failed drain must roll back and leave pending intact");
    }
}
