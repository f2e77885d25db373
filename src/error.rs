// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the transactional engine.
//!
//! [`AbortReason`] enumerates why a single attempt at a transaction did not
//! commit; the driving loop in [`crate::runtime::Stm`] inspects it to decide
//! whether to retry. [`StmError`] is the crate-level error returned once a
//! transaction gives up retrying (or never should have retried at all).

use thiserror::Error as DeriveError;

/// Why a single transaction attempt did not commit.
///
/// Recovery is described per-variant; most reasons are simply retried with a
/// fresh snapshot. `Explicit` is only re-prepared when the attribute
/// `no_retry` is unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DeriveError)]
pub enum AbortReason {
    /// MODULAR: a visible reader conflicted with another visible reader.
    #[error("read-read visibility conflict")]
    RrConflict,

    /// A reader encountered a cell write-locked by another transaction.
    #[error("reader met a write lock")]
    RwConflict,

    /// MODULAR: a writer encountered a cell visibly read-locked.
    #[error("writer met a read lock")]
    WrConflict,

    /// A writer encountered a cell write-locked by another transaction, or
    /// WB/CTL commit-time acquisition lost a race.
    #[error("writer met a write lock")]
    WwConflict,

    /// A read-set entry's version is newer than `end` and extension failed.
    #[error("read validation failed")]
    ValRead,

    /// A write encountered a version newer than `end` with a matching
    /// read-set entry, and extension failed.
    #[error("write validation failed")]
    ValWrite,

    /// Commit-time validation of the full read set failed.
    #[error("commit-time validation failed")]
    Validate,

    /// A read-only transaction attempted a write.
    #[error("read-only transaction attempted a write")]
    RoWrite,

    /// Another transaction is currently irrevocable.
    #[error("another transaction is irrevocable")]
    Irrevocable,

    /// MODULAR: a peer transaction's contention manager killed us.
    #[error("killed by a peer transaction's contention manager")]
    Killed,

    /// Reserved for callers migrating from the C ABI's signal-based fault
    /// translation; this crate never produces it (see DESIGN.md).
    #[error("memory fault observed inside a transaction")]
    Signal,

    /// The user explicitly called `Transaction::abort`.
    #[error("explicit abort requested by caller")]
    Explicit,

    /// Reserved for forward compatibility.
    #[error("other")]
    Other,
}

impl AbortReason {
    /// Whether this reason, on its own, calls for an automatic retry.
    ///
    /// `Explicit` is special: it retries unless the transaction's
    /// `no_retry` attribute is set, which the driver checks separately.
    pub fn auto_retries(self) -> bool {
        !matches!(self, AbortReason::Other)
    }
}

/// Crate-level error: either a transaction gave up retrying, or an internal
/// invariant could not be upheld.
#[derive(Debug, DeriveError)]
pub enum StmError {
    /// The transaction was aborted and declined to retry (`no_retry` set
    /// together with `AbortReason::Explicit`), or the caller used
    /// [`crate::config::RetryPolicy::Abort`].
    #[error("transaction aborted: {0}")]
    Aborted(AbortReason),

    /// An internal mutex was poisoned by a panicking thread. TinySTM's
    /// C implementation has no equivalent (it never uses blocking locks on
    /// the hot path) but the few genuinely blocking structures this crate
    /// keeps — the owner registry, the quiescence condvar — use `Mutex`,
    /// so poisoning is a reachable, recoverable error here.
    #[error("an internal lock was poisoned by a panicked thread")]
    Poisoned,

    /// A condition spec.md marks fatal in the C runtime (allocation
    /// failure inside the runtime, `VERSION_MAX` exceeded with
    /// `rollover_clock` disabled, TLS/mutex creation failure at init).
    ///
    /// The C runtime aborts the process on these; a library must not do
    /// that unilaterally, so this crate surfaces them as an error instead
    /// (see DESIGN.md, Open Question resolution #4). A caller that wants
    /// the original behavior can match on this and call
    /// `std::process::abort()` itself.
    #[error("fatal runtime condition: {0}")]
    Fatal(String),
}

impl From<AbortReason> for StmError {
    fn from(reason: AbortReason) -> Self {
        StmError::Aborted(reason)
    }
}
