// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Lock array and address hash (components A+B).
//!
//! Grounded on the teacher's `VersionLock` (recovered from
//! `other_examples/.../stm-src-rlu-stm-version.rs.rs`): a single word, top
//! bit(s) reserved as flags, remainder used as a version counter, acquired
//! with a seq-cst CAS and released with a seq-cst store. This module
//! generalizes that one-lock-per-`TVar` primitive into the fixed,
//! power-of-two indexed array spec.md §3/§4.B describes, and — per the
//! Design Notes' "prefer an explicit tagged variant... never expose raw
//! integer manipulation outside the lock module" — wraps the bit-packed
//! word behind [`CellState`] so nothing outside this module ever touches
//! the raw `usize`.

use std::sync::atomic::{AtomicUsize, Ordering};

const WORD_BITS: u32 = usize::BITS;
const OWNED_BIT: usize = 1 << (WORD_BITS - 1);
const READ_BIT: usize = 1 << (WORD_BITS - 2);
const FLAGS_MASK: usize = OWNED_BIT | READ_BIT;

/// Bits reserved for the write-through incarnation counter (spec.md §3,
/// "additional bits hold an incarnation counter"). `INCARNATION_MAX` is the
/// highest value before a cell must be republished via a fresh clock
/// timestamp instead of a bumped incarnation (spec.md §4.G.7).
const INCARNATION_BITS: u32 = 4;
const INCARNATION_MASK: usize = (1 << INCARNATION_BITS) - 1;
pub const INCARNATION_MAX: usize = INCARNATION_MASK;

const PAYLOAD_MASK: usize = !FLAGS_MASK & !INCARNATION_MASK;
const PAYLOAD_SHIFT: u32 = INCARNATION_BITS;

/// An index into the runtime's owner registry (see `crate::runtime`),
/// standing in for the C implementation's raw pointer into a write-set
/// entry or transaction descriptor. Reclaimed through epoch GC
/// (`crate::runtime::OwnerRegistry`), never dereferenced directly here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerSlot(pub u32);

fn payload_of(word: usize) -> usize {
    (word & PAYLOAD_MASK) >> PAYLOAD_SHIFT
}

fn incarnation_of(word: usize) -> usize {
    word & INCARNATION_MASK
}

fn encode_unowned(version: usize, incarnation: usize) -> usize {
    debug_assert!(version <= (PAYLOAD_MASK >> PAYLOAD_SHIFT));
    ((version << PAYLOAD_SHIFT) & PAYLOAD_MASK) | (incarnation & INCARNATION_MASK)
}

fn encode_owned(owner: OwnerSlot, incarnation: usize, read: bool) -> usize {
    let mut word = OWNED_BIT | (((owner.0 as usize) << PAYLOAD_SHIFT) & PAYLOAD_MASK) | (incarnation & INCARNATION_MASK);
    if read {
        word |= READ_BIT;
    }
    word
}

/// A decoded snapshot of one lock cell (spec.md §3's "lock cell" tagged
/// union, made explicit rather than inspected via raw bit tricks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// Nobody owns the cell; `version` is the logical timestamp of the
    /// last commit that published it, `incarnation` is the write-through
    /// undo-detection counter (always 0 outside the WT discipline).
    Unowned { version: usize, incarnation: usize },

    /// A single transaction holds the cell for writing.
    OwnedWrite { owner: OwnerSlot, incarnation: usize },

    /// MODULAR only: one or more transactions hold a *visible* read lock.
    /// `readers` never bumps the version; release decrements it back
    /// toward zero without touching the timestamp (spec.md §4.F).
    OwnedRead { readers: u32 },

    /// The reserved `UNIT` value (spec.md §3): a non-transactional unit
    /// store briefly holds the cell while it writes through and bumps the
    /// clock. Invisible readers that observe this simply retry.
    Unit,
}

impl CellState {
    fn encode(self) -> usize {
        match self {
            CellState::Unowned { version, incarnation } => encode_unowned(version, incarnation),
            CellState::OwnedWrite { owner, incarnation } => encode_owned(owner, incarnation, false),
            CellState::OwnedRead { readers } => OWNED_BIT | READ_BIT | (((readers as usize) << PAYLOAD_SHIFT) & PAYLOAD_MASK),
            CellState::Unit => READ_BIT,
        }
    }

    fn decode(word: usize) -> Self {
        match (word & OWNED_BIT != 0, word & READ_BIT != 0) {
            (false, false) => CellState::Unowned {
                version: payload_of(word),
                incarnation: incarnation_of(word),
            },
            (false, true) => CellState::Unit,
            (true, false) => CellState::OwnedWrite {
                owner: OwnerSlot(payload_of(word) as u32),
                incarnation: incarnation_of(word),
            },
            (true, true) => CellState::OwnedRead {
                readers: payload_of(word) as u32,
            },
        }
    }

    pub fn is_unowned(self) -> bool {
        matches!(self, CellState::Unowned { .. })
    }

    pub fn version(self) -> Option<usize> {
        match self {
            CellState::Unowned { version, .. } => Some(version),
            _ => None,
        }
    }
}

/// One word-sized cell of the lock array.
pub struct LockCell {
    atomic: AtomicUsize,
    /// The version a cell was unowned at when the *first* visible reader
    /// promoted it to `OwnedRead` (spec.md §4.F). `CellState::OwnedRead`'s
    /// payload bits hold a reader count, not a version, so this is the only
    /// place that version survives while readers hold the cell; the last
    /// reader to release reads it back to restore the correct `Unowned`
    /// version instead of requiring every joiner to somehow know it.
    read_version: AtomicUsize,
}

impl LockCell {
    pub fn new(version: usize) -> Self {
        Self {
            atomic: AtomicUsize::new(encode_unowned(version, 0)),
            read_version: AtomicUsize::new(version),
        }
    }

    /// `acquire_load` (spec.md §4.A): the read every invisible reader and
    /// every conflict check performs.
    pub fn load(&self) -> CellState {
        CellState::decode(self.atomic.load(Ordering::Acquire))
    }

    /// Attempts to move an unowned cell, last observed with the given raw
    /// word, to `OwnedWrite` for `owner`. The incarnation carries over
    /// unchanged (only `bump_incarnation` mutates it).
    pub fn try_acquire_write(&self, expected: CellState, owner: OwnerSlot) -> Result<(), CellState> {
        let incarnation = match expected {
            CellState::Unowned { incarnation, .. } => incarnation,
            _ => return Err(expected),
        };
        let new = encode_owned(owner, incarnation, false);
        match self
            .atomic
            .compare_exchange(expected.encode(), new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(actual) => Err(CellState::decode(actual)),
        }
    }

    /// MODULAR: registers one more visible reader, or promotes an unowned
    /// cell straight to a single-reader `OwnedRead`. On the promoting
    /// transition, caches `expected`'s version in `read_version` so the
    /// last reader to release can restore it.
    pub fn try_acquire_read(&self, expected: CellState) -> Result<(), CellState> {
        let new = match expected {
            CellState::Unowned { version, .. } => {
                self.read_version.store(version, Ordering::Relaxed);
                CellState::OwnedRead { readers: 1 }.encode()
            }
            CellState::OwnedRead { readers } => CellState::OwnedRead { readers: readers + 1 }.encode(),
            _ => return Err(expected),
        };
        match self
            .atomic
            .compare_exchange(expected.encode(), new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(actual) => Err(CellState::decode(actual)),
        }
    }

    /// Releases one visible-read registration without touching the
    /// timestamp (spec.md §4.F: "those cells are released without bumping
    /// their versions"). Once the last reader releases, the cell returns to
    /// `Unowned` at the version cached by `try_acquire_read`'s promoting
    /// transition — no writer can have changed it while any reader held the
    /// cell, since write acquisition requires `Unowned`.
    pub fn release_read(&self) {
        loop {
            let current = self.atomic.load(Ordering::Acquire);
            let new = match CellState::decode(current) {
                CellState::OwnedRead { readers } if readers > 1 => CellState::OwnedRead { readers: readers - 1 }.encode(),
                CellState::OwnedRead { .. } => encode_unowned(self.read_version.load(Ordering::Relaxed), 0),
                other => other.encode(),
            };
            if self
                .atomic
                .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Publishes a fresh committed timestamp and releases write ownership
    /// (spec.md §4.G.6). Release-ordered, as every publication of a new
    /// version must be.
    pub fn release_to_version(&self, version: usize) {
        self.atomic.store(encode_unowned(version, 0), Ordering::Release);
    }

    /// Aborts write ownership, restoring the prior unowned version exactly
    /// (WB/ETL, WB/CTL — spec.md §4.G.7).
    pub fn release_to_prior(&self, prior_version: usize, incarnation: usize) {
        self.atomic.store(encode_unowned(prior_version, incarnation), Ordering::Release);
    }

    /// Write-through abort path: bumps the incarnation counter in place
    /// instead of a version (spec.md §4.G.7, R3). Returns `None` if the
    /// counter would overflow `INCARNATION_MAX`, in which case the caller
    /// must bump the global clock and call [`LockCell::release_to_version`]
    /// instead.
    pub fn bump_incarnation(&self, prior_version: usize) -> Option<usize> {
        let current = match self.load() {
            CellState::OwnedWrite { incarnation, .. } => incarnation,
            _ => 0,
        };
        if current >= INCARNATION_MAX {
            return None;
        }
        let next = current + 1;
        self.atomic.store(encode_unowned(prior_version, next), Ordering::Release);
        Some(next)
    }

    /// Resets the cell to a fresh, unowned, zero-incarnation state. Only
    /// valid during a quiescence-protected rollover (spec.md invariant I5).
    pub fn reset(&self) {
        self.atomic.store(encode_unowned(0, 0), Ordering::SeqCst);
        self.read_version.store(0, Ordering::SeqCst);
    }

    /// `unit_store`'s brief exclusive hold (spec.md §4.I): CAS an unowned
    /// cell to `UNIT`. Invisible readers and transactional acquisitions
    /// that meet `UNIT` simply retry rather than treating it as a conflict.
    pub fn try_acquire_unit(&self, expected: CellState) -> Result<(), CellState> {
        if !expected.is_unowned() {
            return Err(expected);
        }
        match self
            .atomic
            .compare_exchange(expected.encode(), CellState::Unit.encode(), Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(actual) => Err(CellState::decode(actual)),
        }
    }
}

/// The fixed lock array: `2^log_size` cells, each covering a "stripe" of
/// `2^shift_extra` consecutive addresses (spec.md §3). Never reallocated.
pub struct LockArray {
    cells: Vec<LockCell>,
    mask: usize,
    shift: u32,
}

impl LockArray {
    pub fn new(log_size: u32, shift_extra: u32) -> Self {
        let len = 1usize << log_size;
        let cells = (0..len).map(|_| LockCell::new(0)).collect();
        let word_log2 = (std::mem::size_of::<usize>() as u32).trailing_zeros();
        Self {
            cells,
            mask: len - 1,
            shift: word_log2 + shift_extra,
        }
    }

    /// `cell_of(addr)`: shift off the stripe width, scramble to defeat
    /// sequential-access aliasing, then mask down to `log_size` bits.
    pub fn cell_index(&self, addr: usize) -> usize {
        let shifted = addr >> self.shift;
        scramble(shifted) & self.mask
    }

    pub fn cell(&self, addr: usize) -> &LockCell {
        &self.cells[self.cell_index(addr)]
    }

    pub fn cell_at(&self, index: usize) -> &LockCell {
        &self.cells[index]
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Zeroes every cell. Caller must hold the quiescence barrier.
    pub fn reset_all(&self) {
        for cell in &self.cells {
            cell.reset();
        }
    }
}

/// Byte-swaps the low 32 bits to break up the locality of sequentially
/// allocated addresses across cells (spec.md §3: "optionally byte-swap the
/// low half to defeat sequential-access aliasing").
fn scramble(h: usize) -> usize {
    let low = h as u32;
    let swapped = low.swap_bytes();
    (h & !(u32::MAX as usize)) | (swapped as usize)
}
