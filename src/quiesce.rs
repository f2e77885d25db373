// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Quiescence barrier (component E).
//!
//! Grounded on `rlu/src/rlu.rs`'s `RLU::synchronize()`, which walks every
//! registered context and waits for each to observe a run-id change before
//! proceeding — the same "wait until every other participant has
//! acknowledged a global state change" shape spec.md §4.E describes for
//! clock rollover. The teacher tracks contexts through a raw
//! `Arc<AtomicPtr<HashMap<...>>>`; this crate uses a safe
//! `Mutex`/`Condvar` pair instead (consistent with the `OwnerSlot`
//! indirection already chosen in `src/lock.rs`, logged there) since the
//! barrier here only ever needs a count, not per-context lookup.

use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Coordinates process-wide pauses (spec.md §4.E): clock rollover and lock
/// array reset both need every other thread quiesced first.
pub struct Quiescence {
    active: AtomicUsize,
    quiescing: AtomicBool,
    gate: Mutex<()>,
    cvar: Condvar,
}

impl Default for Quiescence {
    fn default() -> Self {
        Self {
            active: AtomicUsize::new(0),
            quiescing: AtomicBool::new(false),
            gate: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }
}

impl Quiescence {
    /// Called when a transaction transitions to `ACTIVE` (spec.md §4.G.1's
    /// "check `quiesce` — park if needed" step happens first via
    /// [`Quiescence::park_if_quiescing`]; this call registers the thread as
    /// live only once it is clear to proceed).
    pub fn enter_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// Called on leaving `ACTIVE` (commit, abort-without-retry, or parking
    /// because a rollover started).
    pub fn leave_active(&self) {
        let prev = self.active.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "leave_active without matching enter_active");
        if prev == 1 {
            let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            self.cvar.notify_all();
        }
    }

    /// `quiesce == 1/2` check at `begin` (spec.md §4.G.1): parks the
    /// calling thread in `IDLE` until a rollover in progress completes.
    pub fn park_if_quiescing(&self) {
        if !self.quiescing.load(Ordering::Acquire) {
            return;
        }
        let guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let _unused = self
            .cvar
            .wait_while(guard, |_| self.quiescing.load(Ordering::Acquire))
            .unwrap_or_else(|e| e.into_inner());
    }

    /// `stm_quiesce_barrier(f)`: the calling thread must already be
    /// non-active (it calls this instead of running a normal transaction).
    /// Marks quiescing, waits for every other active transaction to leave,
    /// runs `f` alone, then clears the flag and wakes parked threads.
    pub fn barrier<F: FnOnce()>(&self, f: F) {
        info!("quiescence barrier: requesting pause");
        self.quiescing.store(true, Ordering::SeqCst);
        let guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = self
            .cvar
            .wait_while(guard, |_| self.active.load(Ordering::SeqCst) > 0)
            .unwrap_or_else(|e| e.into_inner());
        debug!("quiescence barrier: all threads parked, running pause action");
        f();
        self.quiescing.store(false, Ordering::SeqCst);
        self.cvar.notify_all();
        info!("quiescence barrier: resumed");
    }

    pub fn is_quiescing(&self) -> bool {
        self.quiescing.load(Ordering::Acquire)
    }
}
