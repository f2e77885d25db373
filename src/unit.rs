// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Unit (non-transactional) access (component I).
//!
//! Grounded on `stm/src/stm/tvar.rs`'s `bounded_lock`: a bounded spin-with-
//! sleep retry loop around a `Mutex`, used here to implement spec.md
//! §4.I's "spin until the cell is unowned" requirement around the lock
//! array's cell rather than around the value mutex directly.

use crate::clock::VersionClock;
use crate::error::StmError;
use crate::lock::{CellState, LockCell};
use crate::tvar::TVar;
use std::thread;
use std::time::Duration;

const SPIN_BOUND: usize = 1000;

/// `unit_load(addr) -> (value, stamp)` (spec.md §4.I): spins until the
/// cell is unowned, reads the value, then re-reads the cell — if it
/// changed underneath, the read is retried from scratch.
pub fn unit_load<T: Clone>(var: &TVar<T>, cell: &LockCell) -> Result<(T, usize), StmError> {
    for attempt in 0..SPIN_BOUND {
        let before = spin_until_unowned(cell, attempt)?;
        let value = var
            .inner
            .value
            .lock()
            .map_err(|_| StmError::Poisoned)?
            .clone();
        let after = cell.load();
        if after == before {
            let version = before.version().expect("spin_until_unowned guarantees Unowned");
            return Ok((value, version));
        }
    }
    Err(StmError::Fatal("unit_load: cell never settled".into()))
}

/// `unit_store(addr, value, *opt_stamp) -> bool` (spec.md §4.I): spins
/// until unowned; if `expected_stamp` is given and the cell's current
/// stamp is newer, the store is rejected and the observed stamp is
/// returned as the error; otherwise claims the cell as `UNIT`, writes the
/// value, bumps the clock, and releases with the new stamp.
pub fn unit_store<T: Clone>(
    var: &TVar<T>,
    cell: &LockCell,
    clock: &VersionClock,
    value: T,
    expected_stamp: Option<usize>,
) -> Result<(), usize> {
    for attempt in 0..SPIN_BOUND {
        let snapshot = match spin_until_unowned(cell, attempt) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let current_stamp = snapshot.version().unwrap();
        if let Some(expected) = expected_stamp {
            if current_stamp > expected {
                return Err(current_stamp);
            }
        }
        if cell.try_acquire_unit(snapshot).is_err() {
            continue;
        }
        *var.inner.value.lock().unwrap_or_else(|e| e.into_inner()) = value;
        let (new_stamp, rollover) = clock.bump();
        cell.release_to_version(new_stamp);
        if rollover {
            // Caller (the runtime) is responsible for noticing rollover and
            // running the quiescence barrier before the next `begin`; a
            // unit store never blocks on it directly (spec.md §4.I).
        }
        return Ok(());
    }
    Err(0)
}

fn spin_until_unowned(cell: &LockCell, attempt: usize) -> Result<CellState, ()> {
    let snapshot = cell.load();
    if snapshot.is_unowned() {
        return Ok(snapshot);
    }
    if attempt > 0 {
        thread::sleep(Duration::from_micros(50));
    }
    std::hint::spin_loop();
    Err(())
}
