/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Change extraction (spec §4.4): every versions/tombstones row with
//! `local_db_version > cursor` and `node_id` not excluded, ordered by
//! `local_db_version` ascending, bounded to `max` results.

use crate::change::Change;
use crate::conn_ext::ConnExt;
use crate::error::{Error, Result};
use crate::record_id::{RecordId, RecordIdShape};
use crate::schema::ShadowNames;
use crate::value::Value;
use rusqlite::Connection;

pub const MAX_EXCLUDED_NODES: usize = 100;

pub fn changes_since(
    conn: &Connection,
    table: &str,
    shape: RecordIdShape,
    names: &ShadowNames,
    cursor: u64,
    excluded_nodes: &[u64],
    max: usize,
) -> Result<Vec<Change>> {
    if excluded_nodes.len() > MAX_EXCLUDED_NODES {
        return Err(Error::TooManyExcludedNodes {
            count: excluded_nodes.len(),
        });
    }

    let exclusion_clause = if excluded_nodes.is_empty() {
        String::new()
    } else {
        let placeholders = excluded_nodes
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        format!("AND node_id NOT IN ({placeholders})")
    };

    let versions_changes = fetch_versions(conn, table, shape, names, cursor, excluded_nodes, &exclusion_clause, max)?;

    let tombstone_budget = if max == 0 {
        0
    } else {
        max.saturating_sub(versions_changes.len())
    };
    if max != 0 && tombstone_budget == 0 {
        return Ok(sort_by_cursor(versions_changes));
    }

    let tombstone_changes = fetch_tombstones(conn, shape, names, cursor, excluded_nodes, &exclusion_clause, tombstone_budget)?;

    let mut all = versions_changes;
    all.extend(tombstone_changes);
    Ok(sort_by_cursor(all))
}

fn sort_by_cursor(mut changes: Vec<Change>) -> Vec<Change> {
    changes.sort_by_key(|c| c.local_db_version);
    changes
}

#[allow(clippy::too_many_arguments)]
fn fetch_versions(
    conn: &Connection,
    table: &str,
    shape: RecordIdShape,
    names: &ShadowNames,
    cursor: u64,
    excluded_nodes: &[u64],
    exclusion_clause: &str,
    max: usize,
) -> Result<Vec<Change>> {
    let limit_clause = if max == 0 {
        String::new()
    } else {
        format!("LIMIT {max}")
    };
    let sql = format!(
        "SELECT record_id, column_name, column_version, db_version, node_id, local_db_version
         FROM {versions}
         WHERE local_db_version > ? {exclusion_clause}
         ORDER BY local_db_version ASC
         {limit_clause}",
        versions = names.versions,
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| Error::prepare(sql.clone(), e))?;

    let cursor = cursor as i64;
    let excluded_nodes: Vec<i64> = excluded_nodes.iter().map(|&n| n as i64).collect();
    let mut params: Vec<&dyn rusqlite::ToSql> = vec![&cursor];
    for node in &excluded_nodes {
        params.push(node);
    }

    let id_col = RecordId::id_column(shape);
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.into_iter()), |row| {
            let record_id_value: Value = row.get(0)?;
            Ok((
                record_id_value,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? as u64,
                row.get::<_, i64>(3)? as u64,
                row.get::<_, i64>(4)? as u64,
                row.get::<_, i64>(5)? as u64,
            ))
        })
        .map_err(|e| Error::execution("scan versions", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::execution("scan versions", e))?;

    let mut out = Vec::with_capacity(rows.len());
    for (record_id_value, column_name, column_version, db_version, node_id, local_db_version) in rows {
        let record_id = decode_record_id(shape, &record_id_value)?;
        let current_value: Value = conn
            .try_query_row(
                &format!("SELECT {column_name} FROM {table} WHERE {id_col} = ?"),
                &[&record_id],
                |r| r.get(0),
            )
            .map_err(|e| Error::execution("read current column value", e))?
            .unwrap_or(Value::Null);
        out.push(Change {
            record_id,
            column_name: Some(column_name),
            value: Some(current_value),
            column_version,
            db_version,
            node_id,
            local_db_version,
            flags: 0,
        });
    }
    Ok(out)
}

fn fetch_tombstones(
    conn: &Connection,
    shape: RecordIdShape,
    names: &ShadowNames,
    cursor: u64,
    excluded_nodes: &[u64],
    exclusion_clause: &str,
    max: usize,
) -> Result<Vec<Change>> {
    let limit_clause = if max == 0 {
        String::new()
    } else {
        format!("LIMIT {max}")
    };
    let sql = format!(
        "SELECT record_id, db_version, node_id, local_db_version
         FROM {tombstones}
         WHERE local_db_version > ? {exclusion_clause}
         ORDER BY local_db_version ASC
         {limit_clause}",
        tombstones = names.tombstones,
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| Error::prepare(sql.clone(), e))?;

    let cursor = cursor as i64;
    let excluded_nodes: Vec<i64> = excluded_nodes.iter().map(|&n| n as i64).collect();
    let mut params: Vec<&dyn rusqlite::ToSql> = vec![&cursor];
    for node in &excluded_nodes {
        params.push(node);
    }

    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.into_iter()), |row| {
            let record_id_value: Value = row.get(0)?;
            Ok((
                record_id_value,
                row.get::<_, i64>(1)? as u64,
                row.get::<_, i64>(2)? as u64,
                row.get::<_, i64>(3)? as u64,
            ))
        })
        .map_err(|e| Error::execution("scan tombstones", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::execution("scan tombstones", e))?;

    let mut out = Vec::with_capacity(rows.len());
    for (record_id_value, db_version, node_id, local_db_version) in rows {
        let record_id = decode_record_id(shape, &record_id_value)?;
        out.push(Change {
            record_id,
            column_name: None,
            value: None,
            column_version: 0,
            db_version,
            node_id,
            local_db_version,
            flags: 0,
        });
    }
    Ok(out)
}

fn decode_record_id(shape: RecordIdShape, value: &Value) -> Result<RecordId> {
    match (shape, value) {
        (RecordIdShape::Integer, Value::Integer(i)) => Ok(RecordId::Integer(*i)),
        (RecordIdShape::Blob, Value::Blob(b)) if b.len() == 16 => {
            let mut buf = [0u8; 16];
            buf.copy_from_slice(b);
            Ok(RecordId::Blob(buf))
        }
        _ => Err(Error::Internal(format!(
            "record_id {value:?} does not match configured shape"
        ))),
    }
}
