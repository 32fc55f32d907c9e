/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Shadow-schema installer (spec §4.1). Creates the five per-table shadow
//! tables and their indices. Grounded on the table/trigger DDL style of
//! `components/places/src/db/schema.rs`: plain `&str`/`String` constants
//! built with `format!`, executed with `execute_batch`.

use crate::conn_ext::ConnExt;
use crate::error::{Error, Result};
use rusqlite::Connection;

/// Shadow tables must fit a fixed prefix plus a bounded suffix budget.
pub const MAX_TABLE_NAME_LEN: usize = 23;
const SHADOW_PREFIX: &str = "crdt";

pub fn validate_table_name(table: &str) -> Result<()> {
    if table.is_empty()
        || !table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(Error::InvalidName(table.to_string()));
    }
    if table.len() > MAX_TABLE_NAME_LEN {
        return Err(Error::NameTooLong {
            name: table.to_string(),
            len: table.len(),
        });
    }
    Ok(())
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    conn.query_row_and_then(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
        &[&table],
        |row| row.get::<_, i64>(0),
    )
    .map(|_| true)
    .or_else(|err| match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(false),
        other => Err(Error::execution("sqlite_master lookup", other)),
    })
}

/// The five shadow table names for a given user table, e.g. `crdt_users_versions`.
#[derive(Clone, Debug)]
pub struct ShadowNames {
    pub versions: String,
    pub tombstones: String,
    pub clock: String,
    pub pending: String,
    pub types: String,
}

impl ShadowNames {
    pub fn for_table(table: &str) -> Self {
        ShadowNames {
            versions: format!("{SHADOW_PREFIX}_{table}_versions"),
            tombstones: format!("{SHADOW_PREFIX}_{table}_tombstones"),
            clock: format!("{SHADOW_PREFIX}_{table}_clock"),
            pending: format!("{SHADOW_PREFIX}_{table}_pending"),
            types: format!("{SHADOW_PREFIX}_{table}_types"),
        }
    }
}

/// Operation codes recorded by triggers into `pending`. Values themselves
/// are arbitrary (spec §4.1): they just need to be mutually distinguishable.
pub mod op {
    pub const INSERT: i64 = 0;
    pub const UPDATE: i64 = 1;
    pub const DELETE: i64 = 2;
}

fn create_versions_sql(names: &ShadowNames) -> String {
    // record_id declares BLOB affinity so SQLite stores either record-id
    // shape (INTEGER or BLOB) without attempting a lossy conversion.
    format!(
        "CREATE TABLE IF NOT EXISTS {versions} (
            record_id BLOB NOT NULL,
            column_name TEXT NOT NULL,
            column_version INTEGER NOT NULL,
            db_version INTEGER NOT NULL,
            node_id INTEGER NOT NULL,
            local_db_version INTEGER NOT NULL,
            PRIMARY KEY (record_id, column_name)
        ) WITHOUT ROWID",
        versions = names.versions,
    )
}

fn create_versions_index_sql(names: &ShadowNames) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {versions}_local_db_version
         ON {versions} (local_db_version)",
        versions = names.versions,
    )
}

fn create_tombstones_sql(names: &ShadowNames) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {tombstones} (
            record_id BLOB NOT NULL PRIMARY KEY,
            db_version INTEGER NOT NULL,
            node_id INTEGER NOT NULL,
            local_db_version INTEGER NOT NULL
        ) WITHOUT ROWID",
        tombstones = names.tombstones,
    )
}

fn create_tombstones_index_sql(names: &ShadowNames) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {tombstones}_local_db_version
         ON {tombstones} (local_db_version)",
        tombstones = names.tombstones,
    )
}

fn create_clock_sql(names: &ShadowNames) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {clock} (time INTEGER NOT NULL)",
        clock = names.clock,
    )
}

fn create_pending_sql(names: &ShadowNames) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {pending} (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            operation INTEGER NOT NULL,
            record_id BLOB NOT NULL,
            column_name TEXT NOT NULL
        )",
        pending = names.pending,
    )
}

fn create_types_sql(names: &ShadowNames) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {types} (
            column_name TEXT NOT NULL PRIMARY KEY,
            type_tag TEXT NOT NULL
        )",
        types = names.types,
    )
}

/// Idempotently create the five shadow tables and their indices for `table`.
/// Does not touch the clock row's value or the types cache contents; callers
/// seed those separately (engine::enable does both atomically).
pub fn install_shadow_tables(conn: &Connection, names: &ShadowNames) -> Result<()> {
    let statements = [
        create_versions_sql(names),
        create_versions_index_sql(names),
        create_tombstones_sql(names),
        create_tombstones_index_sql(names),
        create_clock_sql(names),
        create_pending_sql(names),
        create_types_sql(names),
    ];
    for sql in &statements {
        conn.execute_batch(sql)
            .map_err(|e| Error::execution(sql.clone(), e))?;
    }
    Ok(())
}

/// Seed the clock row if it doesn't already exist. Idempotent.
pub fn ensure_clock_row(conn: &Connection, names: &ShadowNames) -> Result<()> {
    let count: i64 = conn
        .query_one_i64(&format!("SELECT COUNT(*) FROM {}", names.clock))
        .map_err(|e| Error::execution("count clock rows", e))?;
    if count == 0 {
        conn.execute(&format!("INSERT INTO {} (time) VALUES (0)", names.clock), [])
            .map_err(|e| Error::execution("seed clock row", e))?;
    }
    Ok(())
}

/// Replace the cached column-type information for `table`'s columns.
pub fn refresh_types(conn: &Connection, names: &ShadowNames, columns: &[(String, String)]) -> Result<()> {
    conn.execute(&format!("DELETE FROM {}", names.types), [])
        .map_err(|e| Error::execution("clear types cache", e))?;
    for (name, decl_type) in columns {
        conn.execute(
            &format!(
                "INSERT INTO {} (column_name, type_tag) VALUES (?, ?)",
                names.types
            ),
            rusqlite::params![name, decl_type],
        )
        .map_err(|e| Error::execution("seed types cache", e))?;
    }
    Ok(())
}
