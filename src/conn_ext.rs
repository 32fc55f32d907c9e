/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Small connection helpers, grounded on
//! `components/support/sql/src/conn_ext.rs`. Implemented for anything that
//! can hand back a `&Connection`, so the same helpers work whether we're
//! holding a bare `Connection` or inside an explicit `Transaction`.

use rusqlite::{Connection, Row, ToSql};

pub trait ConnExt {
    fn conn(&self) -> &Connection;

    /// Run a query expected to return zero or one rows, mapping the row
    /// with `mapper`. Returns `Ok(None)` rather than erroring when empty.
    fn try_query_row<T, F>(&self, sql: &str, params: &[&dyn ToSql], mapper: F) -> rusqlite::Result<Option<T>>
    where
        Self: Sized,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => Ok(Some(mapper(row)?)),
        }
    }

    /// Like `try_query_row`, but a missing row is an error. Used for
    /// singleton rows such as the per-table clock.
    fn query_row_and_then<T, F>(&self, sql: &str, params: &[&dyn ToSql], mapper: F) -> rusqlite::Result<T>
    where
        Self: Sized,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.try_query_row(sql, params, mapper)?
            .ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    /// Execute a statement from a prepared-statement cache, discarding the
    /// affected-row count.
    fn execute_cached(&self, sql: &str, params: &[&dyn ToSql]) -> rusqlite::Result<usize> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        stmt.execute(rusqlite::params_from_iter(params.iter()))
    }

    /// Run every statement in `stmts` in order, stopping at the first error.
    fn execute_all(&self, stmts: &[&str]) -> rusqlite::Result<()> {
        let conn = self.conn();
        for sql in stmts {
            conn.execute_batch(sql)?;
        }
        Ok(())
    }

    /// Read a single integer produced by `sql`, such as `SELECT COUNT(*) ...`.
    fn query_one_i64(&self, sql: &str) -> rusqlite::Result<i64> {
        self.query_row_and_then(sql, &[], |row| row.get(0))
    }
}

impl ConnExt for Connection {
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for rusqlite::Transaction<'_> {
    fn conn(&self) -> &Connection {
        self
    }
}
