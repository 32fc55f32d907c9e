/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A CRDT replication engine retrofitted onto a single SQLite table.
//!
//! An [`Engine`] wraps one `rusqlite::Connection`, tracks at most one user
//! table at a time ([`Engine::enable`]), and offers last-writer-wins
//! replication primitives over it: extract local changes since a cursor
//! ([`Engine::changes_since`]), merge a remote change sequence
//! ([`Engine::merge`]), and compact acknowledged tombstones
//! ([`Engine::compact`]).

mod change;
mod compaction;
mod conn_ext;
mod engine;
mod error;
mod extraction;
mod hooks;
mod merge;
mod pending;
mod record_id;
mod schema;
mod triggers;
mod value;

pub use change::Change;
pub use engine::{Config, DatabaseLocation, Engine, TrackedStatement};
pub use error::{Error, Result};
pub use record_id::{RecordId, RecordIdShape};
pub use value::Value;

/// Initialize `env_logger` once per test binary, so `RUST_LOG=trace` surfaces
/// the promotion/merge diagnostics while running `cargo test`. A no-op after
/// the first call.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::try_init();
}
