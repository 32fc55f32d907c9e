/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Shared state touched from inside the three `rusqlite` callback
//! trampolines (commit, rollback, authorizer) and from the engine's own
//! caller-facing methods.
//!
//! `rusqlite`'s `commit_hook`/`rollback_hook` require `Send + 'static`
//! closures, and the callback itself receives no connection handle — per
//! SQLite's own contract, a commit-hook callback must not touch the
//! invoking connection. So the hooks here do nothing but flip flags on this
//! struct; the actual metadata work (pending-drain, schema refresh) runs in
//! the engine's own methods immediately after the statement that caused the
//! commit returns, which is the first point a connection touch is safe.
//! `Arc<Mutex<_>>` is used only to satisfy that `Send` bound — access is
//! never actually contended, since spec §5 mandates at most one caller
//! drives an engine instance at a time.

use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct HookState {
    /// Set by the commit hook: a transaction on this connection just committed.
    pub commit_pending: bool,
    /// Set by the rollback hook, for diagnostics only — SQLite's own
    /// rollback already reverts any `pending` rows written during the
    /// aborted transaction, so no explicit purge is needed here.
    pub last_rollback_observed: bool,
    /// Set by the authorizer when it observes an ALTER TABLE action.
    pub schema_refresh_needed: bool,
    /// Latched error from inside a hook, surfaced on the next caller-facing
    /// call (hooks cannot raise into caller code, spec §7).
    pub latched_error: Option<String>,
    /// Guards against re-entrant drains if drain SQL itself were to commit
    /// (spec §4.2, §9).
    pub draining: bool,
}

pub type SharedHookState = Arc<Mutex<HookState>>;

pub fn new_shared_state() -> SharedHookState {
    Arc::new(Mutex::new(HookState::default()))
}

/// Scope guard that sets `draining = true` on construction and always
/// clears it on drop, including on unwind — the "scope-bound resource" the
/// design notes call for so the guard clears on every exit path.
pub struct DrainGuard<'a> {
    state: &'a SharedHookState,
}

impl<'a> DrainGuard<'a> {
    /// Returns `None` if a drain is already in progress (re-entry).
    pub fn enter(state: &'a SharedHookState) -> Option<Self> {
        let mut guard = state.lock().expect("hook state mutex poisoned");
        if guard.draining {
            return None;
        }
        guard.draining = true;
        drop(guard);
        Some(DrainGuard { state })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.state.lock() {
            guard.draining = false;
        }
    }
}
