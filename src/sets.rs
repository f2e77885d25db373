// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction read set and write set (component D).
//!
//! Grounded on `stm/src/stm/transaction.rs`'s `tvars_used: HashSet<TVar>` /
//! `tvars_new_values: HashMap<TVar, SharedValue>` pair, generalized from a
//! type-erased `SharedValue` to a generic `T` (this crate's `Stm<T>` is
//! monomorphized per value type, following `rlu/src/rlu.rs`'s `RLU<T>`
//! rather than the teacher's `stm` crate's type-erasure approach) and given
//! the doubling growth and ordering spec.md §4.D requires: append-only
//! within an attempt, truncated to empty on `begin`, grown by doubling, and
//! — for write-back designs — walkable in both insertion and reverse order
//! so commit/abort can publish or roll back write-set entries in the order
//! spec.md §4.G.6/§4.G.7 demands.

use crate::lock::OwnerSlot;
use std::collections::HashMap;

/// `R` from spec.md §3: `{lock_cell_ptr, version_seen}`, represented here
/// as the cell's array index rather than a raw pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSetEntry {
    pub cell_index: usize,
    pub version_seen: usize,
}

/// The per-attempt read set. Append-only while `ACTIVE` (invariant I3);
/// `NO_DUPLICATES` from spec.md's attribute table controls whether repeat
/// reads of the same cell are collapsed.
#[derive(Default)]
pub struct ReadSet {
    entries: Vec<ReadSetEntry>,
    dedup: bool,
}

impl ReadSet {
    pub fn new(dedup: bool) -> Self {
        Self::with_capacity(dedup, 4096)
    }

    /// Built with `Config::initial_set_capacity` (spec.md §12's
    /// `RW_SET_SIZE`) rather than the hardcoded default.
    pub fn with_capacity(dedup: bool, capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            dedup,
        }
    }

    /// Records an observed `(cell, version)` pair, unless `dedup` is set
    /// and the cell is already present — in which case the existing entry
    /// is left untouched (spec.md §4.G.2: "dedup is optional").
    pub fn record(&mut self, cell_index: usize, version_seen: usize) {
        if self.dedup && self.entries.iter().any(|e| e.cell_index == cell_index) {
            return;
        }
        self.entries.push(ReadSetEntry { cell_index, version_seen });
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadSetEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Truncates to empty on `begin` (spec.md §4.D). Capacity — and
    /// therefore the doubling already performed — is retained across
    /// attempts of the same logical transaction.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// `W` from spec.md §3, generalized: `mask`-based partial writes become a
/// plain replacement value, since this crate's `TVar<T>` holds an opaque
/// `T` rather than a raw word (a caller wanting partial-update semantics
/// supplies a merge closure to `Transaction::store_masked`, which computes
/// the fully merged `T` before it ever reaches the write set — see
/// DESIGN.md). `prior_version` and `no_drop` retain their spec meanings:
/// the version to restore the cell to on abort, and whether release has
/// already happened once (so double-release on overlapping acquisitions is
/// avoided).
#[derive(Debug, Clone)]
pub struct WriteSetEntry<T> {
    pub cell_index: usize,
    pub value: T,
    pub prior_version: usize,
    pub no_drop: bool,
    /// Write-through's undo image: the value observed at first acquisition
    /// of this cell, restored verbatim on abort (spec.md §4.G.7, WT path).
    pub old_value: Option<T>,
    /// WT's owner reference for the `load` fast path (§4.G.2: "if owner is
    /// `T`, return `load(addr)` directly") and for rollback bookkeeping.
    pub owner: OwnerSlot,
    /// Links entries whose `TVar`s hash to the same lock-array cell
    /// (spec.md §4.D: "write-back/ETL entries additionally carry a `next`
    /// pointer linking entries whose addresses hash to the same cell").
    /// `None` marks the "primary" entry for this cell — the only one that
    /// ever CASes/releases it; `Some(primary_slot)` marks a "secondary"
    /// entry that shares the primary's acquisition and never touches the
    /// cell itself. This is what lets one transaction hold two distinct
    /// `TVar`s that collide onto the same stripe without double-acquiring
    /// or double-releasing it.
    pub next: Option<usize>,
}

/// The per-attempt write set: append-only, truncated on `begin`, grown by
/// doubling. Order is preserved (a `Vec` backs it) because WB/CTL commit
/// acquires "in reverse write-set order" and WT/WB/ETL release "in
/// reverse"/"in order" respectively (spec.md §4.G.6/§4.G.7); a side index
/// gives O(1) lookup by `TVar` identity for the "already in my write set"
/// check on every store.
pub struct WriteSet<T> {
    entries: Vec<WriteSetEntry<T>>,
    index: HashMap<u64, usize>,
    /// `cell_index -> slot of the primary entry already claiming it`,
    /// checked by `Transaction::store` before acquiring so a second
    /// `TVar` hashing to an already-owned cell becomes a secondary entry
    /// instead of contending with itself.
    cell_primary: HashMap<usize, usize>,
}

impl<T> Default for WriteSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WriteSet<T> {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    /// Built with `Config::initial_set_capacity` (spec.md §12's
    /// `RW_SET_SIZE`) rather than the hardcoded default.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            cell_primary: HashMap::new(),
        }
    }

    /// Returns the slot of the primary entry already claiming `cell_index`
    /// in this attempt, if any.
    pub fn primary_for_cell(&self, cell_index: usize) -> Option<usize> {
        self.cell_primary.get(&cell_index).copied()
    }

    /// Looks up an existing entry for `var_id` (spec.md §4.G.3 step 3:
    /// "if owned by `T`: update or append a write-set entry").
    pub fn find(&self, var_id: u64) -> Option<&WriteSetEntry<T>> {
        self.index.get(&var_id).map(|&i| &self.entries[i])
    }

    pub fn find_mut(&mut self, var_id: u64) -> Option<&mut WriteSetEntry<T>> {
        match self.index.get(&var_id) {
            Some(&i) => Some(&mut self.entries[i]),
            None => None,
        }
    }

    /// Positional access for commit-time acquisition loops that walk the
    /// write set in reverse order (WB/CTL, spec.md §4.G.6) and need to
    /// record `prior_version` back into the entry they just acquired.
    pub fn entry_at_mut(&mut self, index: usize) -> &mut WriteSetEntry<T> {
        &mut self.entries[index]
    }

    /// Appends a new entry, growing the backing buffer by doubling if
    /// full. Returns the entry's position, used as its stable slot id for
    /// as long as this attempt lives.
    pub fn insert(&mut self, var_id: u64, entry: WriteSetEntry<T>) -> usize {
        if self.entries.len() == self.entries.capacity() {
            self.entries.reserve(self.entries.capacity().max(1));
        }
        let slot = self.entries.len();
        let cell_index = entry.cell_index;
        self.entries.push(entry);
        self.index.insert(var_id, slot);
        self.cell_primary.entry(cell_index).or_insert(slot);
        slot
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteSetEntry<T>> {
        self.entries.iter()
    }

    /// Walks entries in commit order (spec.md §4.G.6: WB/ETL and WB/CTL
    /// publish "for each entry" in insertion order).
    pub fn iter_forward(&self) -> impl DoubleEndedIterator<Item = &WriteSetEntry<T>> {
        self.entries.iter()
    }

    /// Walks entries in abort order (spec.md §4.G.7: WT and WB/CTL release
    /// "in reverse").
    pub fn iter_reverse(&self) -> impl Iterator<Item = &WriteSetEntry<T>> {
        self.entries.iter().rev()
    }

    /// Truncates to empty on `begin` (spec.md §4.D). Capacity is retained.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.cell_primary.clear();
    }
}
