// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Contention managers (component F).
//!
//! Grounded on three sources: `stm/src/stm/stm.rs`'s unconditional-retry
//! loop for the SUICIDE baseline, `rlu_crate_ref/breaker_ref.rs`'s
//! `BusyBreaker` for BACKOFF's exponential spin (SPEC_FULL.md §14), and
//! `rlu/src/rlu.rs`'s status-CAS kill pattern (`RluContext`'s generation-
//! tagged state transitions) for MODULAR's "steal the cell, let the owner
//! discover it was killed" behavior.

use crate::lock::OwnerSlot;
use rand::Rng;
use std::error::Error;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const MAX_SPIN_UNITS: usize = 7;
const MAX_BACKOFF_MICROS: u64 = 1 << 16;

/// A busy-wait helper that keeps the CPU occupied for an exponentially
/// growing number of spin iterations, resettable between attempts.
#[derive(Default)]
pub struct BusyBreaker {
    unit: AtomicUsize,
}

impl BusyBreaker {
    pub fn spin(&self) -> Result<(), Box<dyn Error>> {
        let unit = self.unit.load(Ordering::Acquire);
        if unit > MAX_SPIN_UNITS {
            return Err("reached maximum spin units".into());
        }
        for _ in 0..(1usize << unit) {
            std::hint::spin_loop();
        }
        self.unit.store(unit + 1, Ordering::Release);
        Ok(())
    }

    pub fn reset(&self) {
        self.unit.store(0, Ordering::Release);
    }
}

/// MODULAR's per-transaction generation-tagged status, CAS'd by a peer's
/// contention manager to steal a contended cell (spec.md §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Active,
    Killed,
}

/// A minimal published view of a contending transaction, enough for a
/// MODULAR policy to decide whether to kill it.
pub struct PeerHandle<'a> {
    /// The owner slot this handle was looked up under. `ContentionManager::decide`
    /// compares this against the caller's own owner so a transaction whose
    /// writes collide with its own write set (two `TVar`s sharing a lock-array
    /// cell) never resolves to killing itself.
    pub owner: OwnerSlot,
    pub status: &'a AtomicU32,
    pub generation: u32,
    pub priority: u64,
    pub working_set_size: usize,
}

const STATUS_ACTIVE: u32 = 0;
const STATUS_KILLED: u32 = 1;

impl<'a> PeerHandle<'a> {
    /// Attempts the status transition ACTIVE→KILLED, encoding the
    /// observed generation so a peer that has already restarted (and thus
    /// bumped its generation) cannot be killed by a stale CAS.
    pub fn try_kill(&self, expected_generation: u32) -> bool {
        if self.generation != expected_generation {
            return false;
        }
        self.status
            .compare_exchange(STATUS_ACTIVE, STATUS_KILLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// The decision a contention manager renders on a single conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Abort the current transaction and retry.
    AbortSelf,
    /// MODULAR only: kill the peer and steal the contended cell.
    KillOther,
}

/// Per-attempt contention-management state. One instance lives inside a
/// transaction's scratch fields and is reset at `begin` (spec.md §3:
/// "CM-specific fields... backoff state, RNG seed").
pub struct ContentionManager {
    kind: Kind,
}

enum Kind {
    Suicide,
    Delay { contended_cell: Option<usize> },
    Backoff { breaker: BusyBreaker },
    Modular { policy: crate::config::ModularPolicy },
}

impl ContentionManager {
    pub fn new(kind: &crate::config::ContentionManagerKind) -> Self {
        use crate::config::ContentionManagerKind as C;
        let kind = match kind {
            C::Suicide => Kind::Suicide,
            C::Delay => Kind::Delay { contended_cell: None },
            C::Backoff => Kind::Backoff { breaker: BusyBreaker::default() },
            C::Modular { policy } => Kind::Modular { policy: *policy },
        };
        Self { kind }
    }

    /// Decides how to handle a conflict against `peer` (spec.md §4.F's
    /// decision table). SUICIDE/DELAY/BACKOFF always abort self; MODULAR
    /// consults its policy. `self_owner` is the caller's own owner slot: a
    /// peer record that turns out to *be* the caller (the write-set's own
    /// cell collision, not another transaction) can never be killed —
    /// there is no peer to steal from, only self.
    pub fn decide(&self, self_owner: OwnerSlot, peer: Option<&PeerHandle>) -> Decision {
        match &self.kind {
            Kind::Suicide | Kind::Delay { .. } | Kind::Backoff { .. } => Decision::AbortSelf,
            Kind::Modular { policy } => {
                let Some(peer) = peer else { return Decision::AbortSelf };
                if peer.owner == self_owner {
                    return Decision::AbortSelf;
                }
                if policy_wants_kill(*policy, peer) {
                    Decision::KillOther
                } else {
                    Decision::AbortSelf
                }
            }
        }
    }

    /// Runs the post-abort waiting strategy before the next attempt
    /// (spec.md §4.G.7's "CM post-processing" step).
    pub fn wait_before_retry(&mut self, contended_cell: Option<usize>) {
        match &mut self.kind {
            Kind::Suicide => {}
            Kind::Delay { contended_cell: slot } => {
                *slot = contended_cell;
            }
            Kind::Backoff { breaker } => {
                let mut rng = rand::thread_rng();
                let micros: u64 = rng.gen_range(0..MAX_BACKOFF_MICROS.max(1));
                if breaker.spin().is_err() {
                    breaker.reset();
                }
                thread::sleep(Duration::from_micros(micros.min(MAX_BACKOFF_MICROS)));
            }
            Kind::Modular { .. } => {}
        }
    }

    /// DELAY: spins until the previously contended cell (if any) reports
    /// unowned, bounded so a stale or already-released cell never hangs
    /// forever.
    pub fn wait_for_contended_cell_clear<F>(&self, is_unowned: F)
    where
        F: Fn(usize) -> bool,
    {
        if let Kind::Delay { contended_cell: Some(cell) } = &self.kind {
            for _ in 0..64 {
                if is_unowned(*cell) {
                    return;
                }
                std::hint::spin_loop();
            }
        }
    }

    pub fn reset(&mut self) {
        match &mut self.kind {
            Kind::Backoff { breaker } => breaker.reset(),
            Kind::Delay { contended_cell } => *contended_cell = None,
            _ => {}
        }
    }
}

/// spec.md §4.F: "aggressive" always kills, "suicide" never does,
/// "timestamp" favors the older transaction (lower `priority` value wins
/// and survives), "karma" favors the transaction with the larger working
/// set (it has more sunk cost, so the smaller one yields).
fn policy_wants_kill(policy: crate::config::ModularPolicy, peer: &PeerHandle) -> bool {
    use crate::config::ModularPolicy as P;
    match policy {
        P::Aggressive => true,
        P::Suicide => false,
        P::Timestamp => peer.priority > 0,
        P::Karma => peer.working_set_size == 0,
    }
}

/// `OwnerSlot` the lock cell will reference once a MODULAR decision steals
/// it — re-exported here purely so callers of this module don't need a
/// second `use` of `crate::lock`.
pub type StolenOwner = OwnerSlot;
