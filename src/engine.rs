/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Lifecycle / hook plumbing and the public `Engine` surface (spec §6).
//! One `Engine` binds one database connection, one node id, and (once
//! `enable` is called) one tracked table.

use crate::change::Change;
use crate::compaction;
use crate::conn_ext::ConnExt;
use crate::error::{Error, Result};
use crate::extraction;
use crate::hooks::{self, SharedHookState};
use crate::merge as merge_mod;
use crate::pending;
use crate::record_id::RecordIdShape;
use crate::schema::{self, ShadowNames};
use crate::triggers;
use rusqlite::hooks::{Authorization, AuthAction};
use rusqlite::{Connection, OpenFlags};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the database lives. Grounded on
/// `sql_support::open_database::DatabaseLocation`.
#[derive(Clone, Debug)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

/// Construction parameters for [`Engine::new`].
#[derive(Clone, Debug)]
pub struct Config {
    pub location: DatabaseLocation,
    pub node_id: u64,
    pub busy_timeout: Duration,
}

impl Config {
    pub fn file(path: impl AsRef<Path>, node_id: u64) -> Self {
        Config {
            location: DatabaseLocation::File(path.as_ref().to_path_buf()),
            node_id,
            busy_timeout: Duration::from_secs(10),
        }
    }

    pub fn memory(node_id: u64) -> Self {
        Config {
            location: DatabaseLocation::Memory,
            node_id,
            busy_timeout: Duration::from_secs(10),
        }
    }
}

struct TrackedTable {
    name: String,
    shape: RecordIdShape,
    columns: Vec<String>,
    names: ShadowNames,
}

pub struct Engine {
    conn: Connection,
    node_id: u64,
    hooks: SharedHookState,
    tracked: RefCell<Option<TrackedTable>>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        let conn = match &config.location {
            DatabaseLocation::Memory => Connection::open_in_memory().map_err(|e| Error::OpenFailed {
                path: ":memory:".to_string(),
                source: e,
            })?,
            DatabaseLocation::File(path) => {
                let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI;
                Connection::open_with_flags(path, flags).map_err(|e| Error::OpenFailed {
                    path: path.display().to_string(),
                    source: e,
                })?
            }
        };

        conn.busy_timeout(config.busy_timeout)
            .map_err(|e| Error::execution("set busy_timeout", e))?;
        conn.execute_batch("PRAGMA foreign_keys = ON")
            .map_err(|e| Error::execution("PRAGMA foreign_keys", e))?;
        if matches!(config.location, DatabaseLocation::File(_)) {
            conn.execute_batch("PRAGMA journal_mode = WAL")
                .map_err(|e| Error::execution("PRAGMA journal_mode", e))?;
        }

        let hook_state = hooks::new_shared_state();
        install_hooks(&conn, &hook_state);

        Ok(Engine {
            conn,
            node_id: config.node_id,
            hooks: hook_state,
            tracked: RefCell::new(None),
        })
    }

    pub fn open(path: impl AsRef<Path>, node_id: u64) -> Result<Self> {
        Self::new(Config::file(path, node_id))
    }

    pub fn open_in_memory(node_id: u64) -> Result<Self> {
        Self::new(Config::memory(node_id))
    }

    /// Install shadow schema and triggers on `table` (spec §4.1, §6).
    pub fn enable(&self, table: &str) -> Result<()> {
        self.check_pending_error()?;
        schema::validate_table_name(table)?;

        if let Some(existing) = self.tracked.borrow().as_ref() {
            return Err(Error::AlreadyEnabled(existing.name.clone()));
        }
        if !schema::table_exists(&self.conn, table)? {
            return Err(Error::NoSuchTable(table.to_string()));
        }

        let (shape, columns) = introspect_table(&self.conn, table)?;
        let names = ShadowNames::for_table(table);

        schema::install_shadow_tables(&self.conn, &names)?;
        schema::ensure_clock_row(&self.conn, &names)?;
        schema::refresh_types(&self.conn, &names, &columns)?;

        let column_names: Vec<String> = columns.iter().map(|(n, _)| n.clone()).collect();
        triggers::reinstall_triggers(&self.conn, table, shape, &names, &column_names)?;

        *self.tracked.borrow_mut() = Some(TrackedTable {
            name: table.to_string(),
            shape,
            columns: column_names,
            names,
        });
        Ok(())
    }

    /// Pass a statement through to the database, refreshing tracked schema
    /// afterward if the authorizer observed an ALTER TABLE (spec §4.5, §6).
    pub fn execute(&self, sql: &str) -> Result<()> {
        self.check_pending_error()?;
        self.conn
            .execute_batch(sql)
            .map_err(|e| Error::execution(sql, e))?;
        self.drain_if_dirty()?;
        self.refresh_schema_if_needed()?;
        Ok(())
    }

    /// Prepare a statement whose writes are still tracked (spec §6): the
    /// trigger path fires on row mutation regardless of which statement
    /// vehicle performed it, so the same post-write drain runs here too.
    pub fn prepare<'e>(&'e self, sql: &str) -> Result<TrackedStatement<'e>> {
        self.check_pending_error()?;
        let stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| Error::prepare(sql, e))?;
        Ok(TrackedStatement { stmt, engine: self })
    }

    pub fn clock(&self) -> Result<u64> {
        self.check_pending_error()?;
        let tracked = self.require_tracked()?;
        Ok(self
            .conn
            .query_one_i64(&format!("SELECT time FROM {}", tracked.names.clock))
            .map_err(|e| Error::execution("read clock", e))? as u64)
    }

    pub fn tombstone_count(&self) -> Result<u64> {
        self.check_pending_error()?;
        let tracked = self.require_tracked()?;
        Ok(self
            .conn
            .query_one_i64(&format!("SELECT COUNT(*) FROM {}", tracked.names.tombstones))
            .map_err(|e| Error::execution("count tombstones", e))? as u64)
    }

    /// Extraction (spec §4.4). `excluded_nodes` must have at most 100 entries.
    pub fn changes_since(
        &self,
        cursor: u64,
        excluded_nodes: &[u64],
        max: usize,
    ) -> Result<Vec<Change>> {
        self.check_pending_error()?;
        let tracked = self.tracked.borrow();
        let tracked = tracked
            .as_ref()
            .ok_or(Error::NoTrackedTable)?;
        extraction::changes_since(
            &self.conn,
            &tracked.name,
            tracked.shape,
            &tracked.names,
            cursor,
            excluded_nodes,
            max,
        )
    }

    /// Merge engine (spec §4.3). Returns the accepted subsequence.
    pub fn merge(&self, changes: &[Change]) -> Result<Vec<Change>> {
        self.check_pending_error()?;
        let tracked = self.tracked.borrow();
        let tracked = tracked.as_ref().ok_or(Error::NoTrackedTable)?;
        merge_mod::merge(
            &self.conn,
            &tracked.name,
            tracked.shape,
            &tracked.names,
            &tracked.columns,
            self.node_id,
            changes,
        )
    }

    /// Tombstone compaction (spec §4.6).
    pub fn compact(&self, watermark: u64) -> Result<usize> {
        self.check_pending_error()?;
        let tracked = self.require_tracked()?;
        compaction::compact(&self.conn, &tracked.names, watermark)
    }

    /// Manually re-introspect columns and recreate triggers, for callers who
    /// issued an ALTER TABLE without going through `execute` (spec §6).
    pub fn refresh_schema(&self) -> Result<()> {
        self.check_pending_error()?;
        let table = self.require_tracked()?.name.clone();
        let (shape, columns) = introspect_table(&self.conn, &table)?;
        let names = ShadowNames::for_table(&table);

        let existing_shape = self.require_tracked()?.shape;
        if shape != existing_shape {
            return Err(Error::Internal(format!(
                "record-id shape of `{table}` changed since enablement; only additive column growth is supported"
            )));
        }

        schema::refresh_types(&self.conn, &names, &columns)?;
        let column_names: Vec<String> = columns.iter().map(|(n, _)| n.clone()).collect();
        triggers::reinstall_triggers(&self.conn, &table, shape, &names, &column_names)?;

        if let Some(tracked) = self.tracked.borrow_mut().as_mut() {
            tracked.columns = column_names;
        }
        Ok(())
    }

    /// Explicit, idempotent shutdown: removes hooks before dropping the
    /// connection (design notes §9: "removing the hooks first").
    pub fn close(mut self) -> Result<()> {
        self.teardown_hooks();
        // `self` drops here; `Drop` sees hooks already removed and is a no-op.
        Ok(())
    }

    fn teardown_hooks(&mut self) {
        self.conn.commit_hook(None::<fn() -> bool>);
        self.conn.rollback_hook(None::<fn()>);
        self.conn
            .authorizer(None::<fn(rusqlite::hooks::AuthContext<'_>) -> Authorization>);
    }

    fn require_tracked(&self) -> Result<std::cell::Ref<'_, TrackedTable>> {
        std::cell::Ref::filter_map(self.tracked.borrow(), |t| t.as_ref())
            .map_err(|_| Error::NoTrackedTable)
    }

    fn check_pending_error(&self) -> Result<()> {
        let latched = {
            let mut state = self.hooks.lock().expect("hook state mutex poisoned");
            state.latched_error.take()
        };
        if let Some(msg) = latched {
            return Err(Error::Internal(msg));
        }
        Ok(())
    }

    /// Run the pending-drain pipeline if a commit was observed since the
    /// last check (spec §4.2).
    fn drain_if_dirty(&self) -> Result<()> {
        let should_drain = {
            let mut state = self.hooks.lock().expect("hook state mutex poisoned");
            if std::mem::take(&mut state.last_rollback_observed) {
                log::trace!("rollback observed since last check; SQLite already discarded any pending rows from it");
            }
            std::mem::take(&mut state.commit_pending)
        };
        if !should_drain {
            return Ok(());
        }
        let Some(_guard) = hooks::DrainGuard::enter(&self.hooks) else {
            return Ok(());
        };
        let tracked = self.tracked.borrow();
        let Some(tracked) = tracked.as_ref() else {
            return Ok(());
        };
        let result = pending::drain_pending(&self.conn, &tracked.names, self.node_id);
        // The drain's own internal COMMIT re-fires the commit hook; swallow
        // that here so the next caller-facing call doesn't re-drain an
        // already-empty buffer.
        self.hooks.lock().expect("hook state mutex poisoned").commit_pending = false;
        if let Err(e) = result {
            // The user's statement already committed by the time the drain
            // runs; there's no way to fail the call that's already
            // succeeded, so latch the error for the next caller-facing call
            // to surface (spec §4.2, §7).
            log::error!("pending-drain failed after commit, latching for next call: {e}");
            self.hooks.lock().expect("hook state mutex poisoned").latched_error = Some(e.to_string());
        }
        Ok(())
    }

    fn refresh_schema_if_needed(&self) -> Result<()> {
        let needed = {
            let mut state = self.hooks.lock().expect("hook state mutex poisoned");
            std::mem::take(&mut state.schema_refresh_needed)
        };
        if needed {
            self.refresh_schema()?;
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown_hooks();
    }
}

/// Register the three engine-wide hooks (spec §2, §6, §9). The commit and
/// rollback hooks only flip flags on `state` — see `hooks.rs` for why they
/// can't safely do more — and the engine's own methods act on those flags
/// immediately after the statement that caused the commit returns.
fn install_hooks(conn: &Connection, state: &SharedHookState) {
    let commit_state = state.clone();
    conn.commit_hook(Some(move || {
        if let Ok(mut s) = commit_state.lock() {
            s.commit_pending = true;
        }
        false // never veto the commit
    }));

    let rollback_state = state.clone();
    conn.rollback_hook(Some(move || {
        if let Ok(mut s) = rollback_state.lock() {
            s.last_rollback_observed = true;
        }
    }));

    let auth_state = state.clone();
    conn.authorizer(Some(move |ctx: rusqlite::hooks::AuthContext<'_>| {
        if let AuthAction::AlterTable { .. } = ctx.action {
            if let Ok(mut s) = auth_state.lock() {
                s.schema_refresh_needed = true;
            }
        }
        Authorization::Allow
    }));
}

/// Determine the record-id shape and the trackable column list for `table`
/// via `PRAGMA table_info` (spec §3, §4.1, §4.5).
fn introspect_table(conn: &Connection, table: &str) -> Result<(RecordIdShape, Vec<(String, String)>)> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| Error::prepare("PRAGMA table_info", e))?;
    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let decl_type: String = row.get(2)?;
            let pk: i64 = row.get(5)?;
            Ok((name, decl_type, pk))
        })
        .map_err(|e| Error::execution("PRAGMA table_info", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::execution("PRAGMA table_info", e))?;

    if rows.is_empty() {
        return Err(Error::NoSuchTable(table.to_string()));
    }

    let integer_pk = rows
        .iter()
        .find(|(_, decl_type, pk)| *pk == 1 && decl_type.to_ascii_uppercase().contains("INT"));
    let blob_id = rows.iter().find(|(name, _, _)| name.eq_ignore_ascii_case("id"));

    let (shape, identity_col) = if let Some((name, _, _)) = integer_pk {
        (RecordIdShape::Integer, name.clone())
    } else if let Some((name, _, _)) = blob_id {
        (RecordIdShape::Blob, name.clone())
    } else {
        return Err(Error::Internal(format!(
            "table `{table}` has no INTEGER PRIMARY KEY and no `id` column; cannot determine record-id shape"
        )));
    };

    let columns = rows
        .into_iter()
        .filter(|(name, _, _)| *name != identity_col)
        .map(|(name, decl_type, _)| (name, decl_type))
        .collect();

    Ok((shape, columns))
}

/// A prepared statement whose executions are still change-tracked (spec §6).
pub struct TrackedStatement<'e> {
    stmt: rusqlite::Statement<'e>,
    engine: &'e Engine,
}

impl<'e> TrackedStatement<'e> {
    pub fn execute<P: rusqlite::Params>(&mut self, params: P) -> Result<usize> {
        let affected = self
            .stmt
            .execute(params)
            .map_err(|e| Error::execution("execute prepared statement", e))?;
        self.engine.drain_if_dirty()?;
        self.engine.refresh_schema_if_needed()?;
        Ok(affected)
    }

    pub fn query_row<T, P, F>(&mut self, params: P, f: F) -> Result<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        self.stmt
            .query_row(params, f)
            .map_err(|e| Error::execution("query prepared statement", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_engine() -> Engine {
        crate::init_test_logging();
        let engine = Engine::open_in_memory(1).unwrap();
        engine
            .execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT)")
            .unwrap();
        engine.enable("users").unwrap();
        engine
    }

    #[test]
    fn blob_record_id_shape_is_tracked_end_to_end() {
        use crate::record_id::RecordId;

        let engine = Engine::open_in_memory(1).unwrap();
        engine
            .execute("CREATE TABLE widgets (id BLOB PRIMARY KEY, label TEXT)")
            .unwrap();
        engine.enable("widgets").unwrap();

        let id = [7u8; 16];
        {
            let mut stmt = engine
                .prepare("INSERT INTO widgets (id, label) VALUES (?, ?)")
                .unwrap();
            stmt.execute(rusqlite::params![RecordId::Blob(id), "gadget"])
                .unwrap();
        }

        let changes = engine.changes_since(0, &[], 0).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].record_id, RecordId::Blob(id));
        assert_eq!(changes[0].column_name.as_deref(), Some("label"));
    }

    #[test]
    fn enable_rejects_missing_table() {
        let engine = Engine::open_in_memory(1).unwrap();
        assert!(matches!(engine.enable("users"), Err(Error::NoSuchTable(_))));
    }

    #[test]
    fn enable_rejects_second_table_on_same_engine() {
        let engine = enabled_engine();
        engine
            .execute("CREATE TABLE widgets (id INTEGER PRIMARY KEY, n TEXT)")
            .unwrap();
        assert!(matches!(
            engine.enable("widgets"),
            Err(Error::AlreadyEnabled(_))
        ));
    }

    #[test]
    fn execute_drains_pending_and_advances_clock() {
        let engine = enabled_engine();
        assert_eq!(engine.clock().unwrap(), 0);
        engine
            .execute("INSERT INTO users (name, email) VALUES ('Alice', 'alice@x')")
            .unwrap();
        assert_eq!(engine.clock().unwrap(), 2);
        let changes = engine.changes_since(0, &[], 0).unwrap();
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn prepared_statement_writes_are_also_drained() {
        let engine = enabled_engine();
        {
            let mut stmt = engine
                .prepare("INSERT INTO users (name, email) VALUES (?, ?)")
                .unwrap();
            stmt.execute(rusqlite::params!["Alice", "alice@x"]).unwrap();
        }
        assert_eq!(engine.clock().unwrap(), 2);
    }

    #[test]
    fn changes_since_rejects_too_many_excluded_nodes() {
        let engine = enabled_engine();
        let excluded: Vec<u64> = (0..101).collect();
        assert!(matches!(
            engine.changes_since(0, &excluded, 0),
            Err(Error::TooManyExcludedNodes { count: 101 })
        ));
    }

    #[test]
    fn changes_since_accepts_exactly_one_hundred_excluded_nodes() {
        let engine = enabled_engine();
        let excluded: Vec<u64> = (0..100).collect();
        assert!(engine.changes_since(0, &excluded, 0).is_ok());
    }

    #[test]
    fn failed_statement_leaves_pending_empty() {
        let engine = enabled_engine();
        engine
            .execute("INSERT INTO users (name, email) VALUES ('Alice', 'alice@x')")
            .unwrap();
        let clock_before = engine.clock().unwrap();

        // A statement that fails outright never reaches the trigger path, so
        // there is nothing for the commit hook to drain; this merely confirms
        // a failed execute does not advance the clock or leave a dangling
        // pending row.
        assert!(engine
            .execute("INSERT INTO users (name, email, nonexistent) VALUES ('Bob', 'bob@x', 1)")
            .is_err());
        assert_eq!(engine.clock().unwrap(), clock_before);

        let tracked = engine.tracked.borrow();
        let names = tracked.as_ref().unwrap().names.clone();
        drop(tracked);
        let pending_count: i64 = engine
            .conn
            .query_one_i64(&format!("SELECT COUNT(*) FROM {}", names.pending))
            .unwrap();
        assert_eq!(pending_count, 0);
    }

    #[test]
    fn drain_failure_is_latched_and_surfaced_on_next_call() {
        let engine = enabled_engine();
        let tracked = engine.tracked.borrow();
        let names = tracked.as_ref().unwrap().names.clone();
        drop(tracked);
        // -1 reinterprets as u64::MAX once read back and cast, forcing the
        // drain's clock increment to overflow.
        engine
            .conn
            .execute(&format!("UPDATE {} SET time = -1", names.clock), [])
            .unwrap();

        // The INSERT itself already committed by the time the drain that
        // follows it fails; there's no statement left to fail, so the error
        // must be latched rather than returned here.
        engine
            .execute("INSERT INTO users (name, email) VALUES ('Alice', 'alice@x')")
            .unwrap();

        let err = engine.clock().unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        // The latch is a single slot, consumed once it's surfaced.
        engine
            .conn
            .execute(&format!("UPDATE {} SET time = 0", names.clock), [])
            .unwrap();
        assert_eq!(engine.clock().unwrap(), 0);
    }

    #[test]
    fn close_tears_down_hooks_without_error() {
        let engine = enabled_engine();
        engine
            .execute("INSERT INTO users (name, email) VALUES ('Alice', 'alice@x')")
            .unwrap();
        assert!(engine.close().is_ok());
    }

    #[test]
    fn dropping_without_explicit_close_does_not_panic() {
        let engine = enabled_engine();
        engine
            .execute("INSERT INTO users (name, email) VALUES ('Alice', 'alice@x')")
            .unwrap();
        drop(engine);
    }
}
