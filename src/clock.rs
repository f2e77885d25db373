// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The global version clock (component C).
//!
//! A single monotonic counter shared by every transaction. Grounded on
//! `VersionClock` from the teacher's sibling `rlu` crate (recovered from
//! `other_examples/.../stm-src-rlu-stm-version.rs.rs`, since this file is
//! declared but missing from the `stm` crate's own retrieval) — same
//! `AtomicUsize` + `fetch_add`/`load` shape, extended with the
//! `VERSION_MAX` rollover threshold from spec.md §3.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// `VERSION_MAX` leaves enough headroom below `usize::MAX` that up to
/// `MAX_THREADS` simultaneous `fetch_add`s can safely occur without
/// wrapping (spec.md invariant I6).
pub const MAX_THREADS: usize = 4096;

/// The monotonic, process-wide commit-timestamp clock.
#[derive(Clone)]
pub struct VersionClock {
    word: Arc<AtomicUsize>,
    version_max: usize,
}

impl VersionClock {
    pub fn new(version_max: usize) -> Self {
        Self {
            word: Arc::new(AtomicUsize::new(0)),
            version_max,
        }
    }

    /// `clock_now()`: an acquire load of the current timestamp.
    pub fn now(&self) -> usize {
        self.word.load(Ordering::Acquire)
    }

    /// `clock_bump()`: a seq-cst fetch-and-increment, returning the
    /// **incremented** value (spec.md §4.C), along with whether that value
    /// reached `VERSION_MAX` and a rollover must be triggered.
    pub fn bump(&self) -> (usize, bool) {
        let prev = self.word.fetch_add(1, Ordering::SeqCst);
        let new = prev + 1;
        (new, new >= self.version_max)
    }

    /// Resets the clock to zero. Only valid while every thread is
    /// quiesced (spec.md §4.E / invariant I5).
    pub fn reset(&self) {
        self.word.store(0, Ordering::SeqCst);
    }

    pub fn version_max(&self) -> usize {
        self.version_max
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        // A conservative default: comfortably below `usize::MAX` with
        // `MAX_THREADS` worth of headroom, as spec.md invariant I6 requires.
        Self::new(usize::MAX / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_is_monotonic() {
        let clock = VersionClock::default();
        let (a, _) = clock.bump();
        let (b, _) = clock.bump();
        assert!(b > a);
        assert_eq!(clock.now(), b);
    }

    #[test]
    fn rollover_flagged_at_threshold() {
        let clock = VersionClock::new(4);
        assert_eq!(clock.bump(), (1, false));
        assert_eq!(clock.bump(), (2, false));
        assert_eq!(clock.bump(), (3, false));
        assert_eq!(clock.bump(), (4, true));
    }

    #[test]
    fn reset_returns_to_zero() {
        let clock = VersionClock::new(8);
        clock.bump();
        clock.bump();
        clock.reset();
        assert_eq!(clock.now(), 0);
    }
}
