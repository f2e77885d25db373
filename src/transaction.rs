// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The transaction lifecycle (component G): `load`/`store`/`validate`/
//! `extend`/`commit`/`abort`.
//!
//! Grounded on `stm/src/stm/transaction.rs` (`Transaction::read`/`write`/
//! `lock_tvars_used`/`commit`) for the overall shape of one attempt, and
//! on `rlu/src/rlu.rs`'s `RluContext::{try_lock, commit, abort}` for the
//! writer-vs-writer CAS retry pattern. This module generalizes both from a
//! single baked-in locking strategy to dispatch through
//! [`crate::discipline::DisciplineImpl`], and from the teacher's `TVar` of
//! a fixed value enum to a generic `TVar<T>`.

use crate::attrs::BeginAttrs;
use crate::callbacks::{CallbackArg, SpecificKey, Specifics};
use crate::contention::{ContentionManager, Decision};
use crate::discipline::{DisciplineImpl, UpdateDiscipline};
use crate::error::AbortReason;
use crate::lock::{CellState, LockCell, OwnerSlot};
use crate::runtime::{PeerRecord, Runtime};
use crate::sets::{ReadSet, WriteSet, WriteSetEntry};
use crate::tvar::TVar;
use log::trace;
use std::sync::atomic::Ordering;

/// How many times [`Transaction::store`]'s CAS retry loop will ask the
/// contention manager to kill a conflicting peer before giving up and
/// aborting itself. Bounds an otherwise open-ended MODULAR kill-and-retry
/// cycle (spec.md §4.F never states a bound; one is needed so a peer stuck
/// for unrelated reasons can't wedge this loop forever).
const KILL_RETRY_BOUND: usize = 4096;

/// One attempt at a transaction body. A fresh `Transaction` is built for
/// every attempt by [`crate::runtime::Stm::read_write`]; nothing here
/// survives a retry except what the driver loop threads through explicitly
/// (the owner slot, the peer record, and contention-manager state).
pub struct Transaction<'s, T: Clone> {
    runtime: &'s Runtime,
    owner: OwnerSlot,
    peer: &'s PeerRecord,
    discipline: DisciplineImpl,
    contention: ContentionManager,
    read_only: bool,
    no_retry: bool,
    /// MODULAR only: forces `load` to acquire a visible read lock instead
    /// of an invisible snapshot, either because the caller asked for it up
    /// front or because `Stm::read_write`'s driver escalated after
    /// `vr_threshold` consecutive invisible-read aborts (spec.md §4.F).
    visible_reads: bool,
    read_set: ReadSet,
    write_set: WriteSet<T>,
    /// Parallel to `write_set`'s entries: `vars[i]` is the `TVar` backing
    /// `write_set`'s i-th entry. Kept alongside rather than inside
    /// `WriteSetEntry` so `sets.rs` stays free of a `TVar<T>` dependency.
    vars: Vec<TVar<T>>,
    /// Cells currently held as a visible reader, released at commit/abort
    /// regardless of outcome.
    visible_read_cells: Vec<usize>,
    /// Snapshot of the clock at `begin`; every read-set entry must still be
    /// at-or-below this watermark unless [`Transaction::extend`] raises it.
    end_version: usize,
    last_conflict_cell: Option<usize>,
    rolled_over: bool,
    specifics: Specifics,
}

impl<'s, T: Clone> Transaction<'s, T> {
    pub(crate) fn begin(runtime: &'s Runtime, owner: OwnerSlot, peer: &'s PeerRecord, attrs: BeginAttrs) -> Self {
        Self {
            runtime,
            owner,
            peer,
            discipline: DisciplineImpl::new(runtime.config.discipline),
            contention: ContentionManager::new(&runtime.config.contention_manager),
            read_only: attrs.read_only,
            no_retry: attrs.no_retry,
            visible_reads: attrs.visible_reads,
            read_set: ReadSet::with_capacity(false, runtime.config.initial_set_capacity),
            write_set: WriteSet::with_capacity(runtime.config.initial_set_capacity),
            vars: Vec::new(),
            visible_read_cells: Vec::new(),
            end_version: runtime.clock.now(),
            last_conflict_cell: None,
            rolled_over: false,
            specifics: Specifics::default(),
        }
    }

    /// `TX_LOAD(addr)` (spec.md §4.G.2). Checks the write set first (so a
    /// transaction always observes its own uncommitted writes), then reads
    /// the cell, validating the snapshot is internally consistent before
    /// returning it.
    pub fn load(&mut self, var: &TVar<T>) -> Result<T, AbortReason> {
        if let Some(entry) = self.write_set.find(var.id()) {
            return Ok(entry.value.clone());
        }
        let cell_index = var.cell_index();
        let cell = self.runtime.lock_array.cell_at(cell_index);
        loop {
            let before = cell.load();
            match before {
                CellState::OwnedWrite { owner, .. } if owner == self.owner => {
                    // `var` itself isn't in our write set (the check above
                    // would have caught it), but its cell is — a different
                    // `TVar` sharing the stripe was stored to in this same
                    // attempt (spec.md §4.D's many-to-one mapping). No other
                    // transaction can touch `var`'s value while we hold the
                    // cell, so reading it straight through is safe.
                    let value = var.inner.value.lock().map_err(|_| AbortReason::Other)?.clone();
                    return Ok(value);
                }
                CellState::OwnedWrite { .. } => {
                    self.last_conflict_cell = Some(cell_index);
                    return Err(AbortReason::RwConflict);
                }
                CellState::Unit => {
                    // A unit store briefly holds this cell without changing
                    // its value; spin rather than treat it as a conflict
                    // (spec.md §4.I).
                    std::hint::spin_loop();
                    continue;
                }
                CellState::OwnedRead { .. } if self.visible_reads => match cell.try_acquire_read(before) {
                    Ok(()) => {
                        let value = var.inner.value.lock().map_err(|_| AbortReason::Other)?.clone();
                        self.visible_read_cells.push(cell_index);
                        return Ok(value);
                    }
                    Err(_) => continue,
                },
                CellState::OwnedRead { .. } => {
                    // Another transaction's visible reader holds this cell;
                    // it cannot have changed the value, so spin rather than
                    // conflict (spec.md §4.F).
                    std::hint::spin_loop();
                    continue;
                }
                CellState::Unowned { version, .. } => {
                    if self.visible_reads {
                        match cell.try_acquire_read(before) {
                            Ok(()) => {
                                let value = var.inner.value.lock().map_err(|_| AbortReason::Other)?.clone();
                                self.visible_read_cells.push(cell_index);
                                self.read_set.record(cell_index, version);
                                return Ok(value);
                            }
                            Err(_) => continue,
                        }
                    }
                    let value = var.inner.value.lock().map_err(|_| AbortReason::Other)?.clone();
                    if cell.load() != before {
                        continue;
                    }
                    if version > self.end_version && !self.extend() {
                        return Err(AbortReason::ValRead);
                    }
                    self.read_set.record(cell_index, version);
                    return Ok(value);
                }
            }
        }
    }

    /// `TX_STORE(addr, value)` (spec.md §4.G.3). Updates an existing
    /// write-set entry in place, or acquires the cell (eager disciplines
    /// only) and inserts a fresh one.
    pub fn store(&mut self, var: &TVar<T>, value: T) -> Result<(), AbortReason> {
        if self.read_only {
            return Err(AbortReason::RoWrite);
        }
        let var_id = var.id();
        if let Some(entry) = self.write_set.find_mut(var_id) {
            entry.value = value;
            if self.discipline.eager_acquire() {
                self.discipline.write_through(&var.inner, entry);
            }
            return Ok(());
        }

        let cell_index = var.cell_index();
        let eager = self.discipline.eager_acquire();

        // Another `TVar` already claimed `cell_index` in this attempt
        // (spec.md §4.D: the address-to-cell mapping is many-to-one, and
        // correctness must not depend on disjoint coverage). Join it as a
        // secondary entry instead of acquiring again: the primary entry is
        // the only one that ever CASes or releases the cell.
        if let Some(primary_slot) = self.write_set.primary_for_cell(cell_index) {
            let mut entry = WriteSetEntry {
                cell_index,
                value,
                prior_version: 0,
                no_drop: true,
                old_value: None,
                owner: self.owner,
                next: Some(primary_slot),
            };
            if eager {
                self.discipline.write_through(&var.inner, &mut entry);
            }
            self.write_set.insert(var_id, entry);
            self.vars.push(var.clone());
            return Ok(());
        }

        let cell = self.runtime.lock_array.cell_at(cell_index);
        let prior_version = if eager {
            self.acquire_with_contention(cell, cell_index)?
        } else {
            0
        };

        let mut entry = WriteSetEntry {
            cell_index,
            value,
            prior_version,
            no_drop: !eager,
            old_value: None,
            owner: self.owner,
            next: None,
        };
        if eager {
            self.discipline.write_through(&var.inner, &mut entry);
        }
        self.write_set.insert(var_id, entry);
        self.vars.push(var.clone());
        Ok(())
    }

    /// `store` with a literal bitmask (spec.md §15): reads the current
    /// value's bit pattern, keeps the unmasked bits, overlays `value`'s bits
    /// where the mask is set, and stores the merge back. [`WordLike`]
    /// stands in for the raw word reinterpretation the C implementation
    /// performs directly on a machine word.
    pub fn store_masked(&mut self, var: &TVar<T>, value: T, mask: usize) -> Result<(), AbortReason>
    where
        T: WordLike,
    {
        let current = self.load(var)?;
        let merged = (current.to_bits() & !mask) | (value.to_bits() & mask);
        self.store(var, T::from_bits(merged))
    }

    /// Attempts the write-acquire CAS, consulting the contention manager
    /// when it meets another transaction's write lock. Only MODULAR ever
    /// answers `KillOther`; every other policy aborts this transaction on
    /// the first conflict, matching spec.md §4.F's decision table.
    fn acquire_with_contention(&mut self, cell: &LockCell, cell_index: usize) -> Result<usize, AbortReason> {
        for _ in 0..KILL_RETRY_BOUND {
            match self.discipline.acquire_on_store(cell, self.owner) {
                Ok(prior) => return Ok(prior),
                Err(reason) => {
                    self.last_conflict_cell = Some(cell_index);
                    let CellState::OwnedWrite { owner, .. } = cell.load() else {
                        return Err(reason);
                    };
                    if !self.try_kill_peer(owner) {
                        return Err(reason);
                    }
                    trace!("store: killed peer owner={:?} holding cell={}", owner, cell_index);
                }
            }
        }
        Err(AbortReason::WwConflict)
    }

    fn try_kill_peer(&mut self, owner: OwnerSlot) -> bool {
        // The cell's `OwnedWrite.owner` can only be a genuine peer here:
        // `store` never reaches `acquire_with_contention` for a cell this
        // transaction already owns (see the shared-cell branch above), so
        // this is defense in depth, not the primary guard against
        // self-collision — `ContentionManager::decide` checks it too.
        if owner == self.owner {
            return false;
        }
        let Some(record) = self.runtime.owners.lookup(owner) else {
            return false;
        };
        let handle = self.runtime.peer_handle(owner, &record);
        let generation = handle.generation;
        match self.contention.decide(self.owner, Some(&handle)) {
            Decision::KillOther => handle.try_kill(generation),
            Decision::AbortSelf => false,
        }
    }

    /// `TX_VALIDATE` (spec.md §4.G.5): every read-set entry must still be
    /// at the version it was recorded at, unowned by anyone but us, or held
    /// by a visible reader (which cannot have changed the value).
    fn validate(&self) -> Result<(), AbortReason> {
        for entry in self.read_set.iter() {
            let cell = self.runtime.lock_array.cell_at(entry.cell_index);
            match cell.load() {
                CellState::Unowned { version, .. } => {
                    if version != entry.version_seen {
                        return Err(AbortReason::Validate);
                    }
                }
                CellState::OwnedWrite { owner, .. } if owner == self.owner => {}
                CellState::OwnedWrite { .. } => return Err(AbortReason::Validate),
                CellState::OwnedRead { .. } => {}
                CellState::Unit => return Err(AbortReason::Validate),
            }
        }
        Ok(())
    }

    /// `TX_EXTEND` (spec.md §4.G.4): re-validates the read set against a
    /// fresh clock reading; on success the watermark moves forward and
    /// later reads of already-committed-but-newer cells no longer conflict.
    fn extend(&mut self) -> bool {
        let now = self.runtime.clock.now();
        if self.validate().is_ok() {
            self.end_version = now;
            self.runtime.stats.record_extension();
            true
        } else {
            false
        }
    }

    /// `TX_COMMIT` (spec.md §4.G.6). Read-only attempts only need a final
    /// validation; read-write attempts additionally acquire (WB/CTL),
    /// publish, and bump the clock.
    pub fn commit(&mut self) -> Result<(), AbortReason> {
        let result = self.commit_inner();
        self.release_visible_reads();
        result
    }

    fn commit_inner(&mut self) -> Result<(), AbortReason> {
        if self.write_set.is_empty() {
            return self.validate();
        }
        let cells: Vec<&LockCell> = self.vars.iter().map(|v| self.runtime.lock_array.cell_at(v.cell_index())).collect();
        let inners: Vec<&crate::tvar::TVarInner<T>> = self.vars.iter().map(|v| v.inner.as_ref()).collect();

        self.discipline.commit_acquire(&mut self.write_set, &cells, self.owner)?;
        self.validate()?;

        let (new_version, rollover) = self.runtime.clock.bump();
        self.rolled_over = rollover;
        self.discipline.commit_publish(&self.write_set, &inners, &cells, new_version);
        Ok(())
    }

    /// `TX_ABORT` (spec.md §4.G.7): rolls back every acquired write-set
    /// entry. No-op for an attempt that never wrote anything.
    pub fn abort(&mut self, reason: AbortReason) {
        trace!("TX(owner={:?}): aborting, reason={:?}", self.owner, reason);
        if !self.write_set.is_empty() {
            let cells: Vec<&LockCell> = self.vars.iter().map(|v| self.runtime.lock_array.cell_at(v.cell_index())).collect();
            let inners: Vec<&crate::tvar::TVarInner<T>> = self.vars.iter().map(|v| v.inner.as_ref()).collect();
            self.discipline.abort_rollback(&self.write_set, &inners, &cells, &self.runtime.clock);
        }
        self.release_visible_reads();
    }

    /// Releases every cell acquired as a visible reader during this attempt
    /// (spec.md §4.F), regardless of whether the attempt committed.
    fn release_visible_reads(&mut self) {
        for cell_index in self.visible_read_cells.drain(..) {
            self.runtime.lock_array.cell_at(cell_index).release_read();
        }
    }

    /// Runs the contention manager's post-abort wait (spec.md §4.G.7's "CM
    /// post-processing" step), then resets per-attempt CM state.
    pub(crate) fn wait_before_retry(&mut self) {
        self.contention.wait_before_retry(self.last_conflict_cell);
        self.contention.reset();
    }

    pub(crate) fn no_retry(&self) -> bool {
        self.no_retry
    }

    pub(crate) fn rollover_pending(&self) -> bool {
        self.rolled_over
    }

    /// `get_specific`/`set_specific` (spec.md §6): per-transaction scratch
    /// storage, keyed by a handle obtained once from `Stm::create_specific`.
    pub fn get_specific(&self, key: SpecificKey) -> Option<CallbackArg> {
        self.specifics.get(key).cloned()
    }

    pub fn set_specific(&mut self, key: SpecificKey, value: CallbackArg) {
        self.specifics.set(key, value);
    }

    /// Checked by a long-running body between operations to notice a
    /// MODULAR kill promptly, rather than only at the next `load`/`store`
    /// conflict (spec.md §4.F).
    pub fn check_killed(&self) -> Result<(), AbortReason> {
        if self.peer.status.load(Ordering::SeqCst) != 0 {
            return Err(AbortReason::Killed);
        }
        Ok(())
    }
}

/// Bridges a generic `TVar<T>` to the literal bit pattern
/// [`Transaction::store_masked`] merges against, the way spec.md's C
/// implementation treats every transactional word as a raw integer.
/// Implemented for the primitive integer types `store_masked` is meaningful
/// for; any other `T` simply never calls it.
pub trait WordLike: Copy {
    fn to_bits(self) -> usize;
    fn from_bits(bits: usize) -> Self;
}

macro_rules! impl_word_like {
    ($($t:ty),*) => {
        $(
            impl WordLike for $t {
                fn to_bits(self) -> usize {
                    self as usize
                }
                fn from_bits(bits: usize) -> Self {
                    bits as $t
                }
            }
        )*
    };
}

impl_word_like!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);
