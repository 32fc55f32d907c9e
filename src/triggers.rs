/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Trigger generator (spec §4.1). Emits the AFTER INSERT / AFTER UPDATE /
//! BEFORE DELETE triggers that populate the pending buffer. Grounded on
//! `components/places/src/db/schema.rs`'s `CREATE_TRIGGER_*` constants: SQL
//! built with `format!` from validated identifiers only, never interpolated
//! user input.

use crate::error::{Error, Result};
use crate::record_id::RecordIdShape;
use crate::schema::{op, ShadowNames};
use rusqlite::Connection;

fn trigger_names(table: &str) -> (String, String, String) {
    (
        format!("crdt_{table}_ai_trg"),
        format!("crdt_{table}_au_trg"),
        format!("crdt_{table}_bd_trg"),
    )
}

fn insert_trigger_sql(table: &str, names: &ShadowNames, id_col: &str, columns: &[String]) -> String {
    let (ai, _, _) = trigger_names(table);
    let appends: String = columns
        .iter()
        .map(|c| {
            format!(
                "INSERT INTO {pending} (operation, record_id, column_name) VALUES ({op_insert}, NEW.{id_col}, '{c}');\n"
            )
        })
        .collect();
    format!(
        "CREATE TRIGGER {ai}\n         AFTER INSERT ON {table} FOR EACH ROW\n         BEGIN\n{appends}        END",
        pending = names.pending,
        op_insert = op::INSERT,
    )
}

fn update_trigger_sql(table: &str, names: &ShadowNames, id_col: &str, columns: &[String]) -> String {
    let (_, au, _) = trigger_names(table);
    let appends: String = columns
        .iter()
        .map(|c| {
            format!(
                "INSERT INTO {pending} (operation, record_id, column_name)\n             SELECT {op_update}, NEW.{id_col}, '{c}' WHERE OLD.{c} IS NOT NEW.{c};\n"
            )
        })
        .collect();
    format!(
        "CREATE TRIGGER {au}\n         AFTER UPDATE ON {table} FOR EACH ROW\n         BEGIN\n{appends}        END",
        pending = names.pending,
        op_update = op::UPDATE,
    )
}

fn delete_trigger_sql(table: &str, names: &ShadowNames, id_col: &str) -> String {
    let (_, _, bd) = trigger_names(table);
    format!(
        "CREATE TRIGGER {bd}\n         BEFORE DELETE ON {table} FOR EACH ROW\n         BEGIN\n             INSERT INTO {pending} (operation, record_id, column_name) VALUES ({op_delete}, OLD.{id_col}, '');\n         END",
        pending = names.pending,
        op_delete = op::DELETE,
    )
}

/// Drop the three triggers if present. Used both before (re)installation and
/// during merge-time suppression.
pub fn drop_triggers(conn: &Connection, table: &str) -> Result<()> {
    let (ai, au, bd) = trigger_names(table);
    for name in [ai, au, bd] {
        conn.execute_batch(&format!("DROP TRIGGER IF EXISTS {name}"))
            .map_err(|e| Error::execution(format!("drop trigger {name}"), e))?;
    }
    Ok(())
}

/// (Re)create the three triggers for `table`. Intentionally uses the plain
/// `CREATE TRIGGER` form, not `IF NOT EXISTS`: callers must `drop_triggers`
/// first, so a stray pre-existing trigger surfaces as an error rather than
/// silently shadowing a stale definition (spec §4.5).
pub fn create_triggers(
    conn: &Connection,
    table: &str,
    shape: RecordIdShape,
    names: &ShadowNames,
    columns: &[String],
) -> Result<()> {
    let id_col = crate::record_id::RecordId::id_column(shape);
    let statements = [
        insert_trigger_sql(table, names, id_col, columns),
        update_trigger_sql(table, names, id_col, columns),
        delete_trigger_sql(table, names, id_col),
    ];
    for sql in &statements {
        conn.execute_batch(sql)
            .map_err(|e| Error::execution(sql.clone(), e))?;
    }
    Ok(())
}

/// Drop then recreate the triggers in one call, the common case after
/// enablement or a schema refresh.
pub fn reinstall_triggers(
    conn: &Connection,
    table: &str,
    shape: RecordIdShape,
    names: &ShadowNames,
    columns: &[String],
) -> Result<()> {
    drop_triggers(conn, table)?;
    create_triggers(conn, table, shape, names, columns)
}
