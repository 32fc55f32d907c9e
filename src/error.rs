/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Error kinds produced by the replication engine. Mirrors the one-variant-
//! per-failure-mode style of `tabs::error::TabsError`.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open database at {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to execute statement `{sql}`: {source}")]
    ExecutionFailed {
        sql: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to prepare statement `{sql}`: {source}")]
    PrepareFailed {
        sql: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("table name `{0}` is not a valid identifier")]
    InvalidName(String),

    #[error("table name `{name}` is {len} characters, longer than the 23-character limit")]
    NameTooLong { name: String, len: usize },

    #[error("user table `{0}` does not exist")]
    NoSuchTable(String),

    #[error("engine already has a tracked table (`{0}`)")]
    AlreadyEnabled(String),

    #[error("no table has been enabled on this engine")]
    NoTrackedTable,

    #[error("{count} excluded node ids exceeds the 100-entry bound")]
    TooManyExcludedNodes { count: usize },

    #[error("logical clock overflowed; this engine instance is poisoned")]
    ClockOverflow,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn execution(sql: impl Into<String>, source: rusqlite::Error) -> Self {
        Error::ExecutionFailed {
            sql: sql.into(),
            source,
        }
    }

    pub(crate) fn prepare(sql: impl Into<String>, source: rusqlite::Error) -> Self {
        Error::PrepareFailed {
            sql: sql.into(),
            source,
        }
    }
}
