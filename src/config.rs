// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration.
//!
//! TinySTM's compile-time `DESIGN`/`CM`/`LOCK_ARRAY_LOG_SIZE`/... defines
//! become ordinary fields on [`Config`], built once and handed to
//! [`crate::runtime::Stm::with_config`] — the Design Notes' "collect these
//! into one process-wide `Runtime` value with clearly documented lifetime"
//! recommendation, grounded on the teacher's `Stm` construction in
//! `stm/src/stm/stm.rs`, which likewise bundles its fixed choices (there,
//! just a single hardcoded discipline) into the runtime value at
//! construction time rather than as cargo features.

use std::env;

/// Which update discipline the runtime commits and aborts with
/// (spec.md §4.G; picked once per [`Config`], never mixed within a run).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    WriteBackEtl,
    WriteBackCtl,
    WriteThrough,
}

/// The contention-management policy (spec.md §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentionManagerKind {
    Suicide,
    Delay,
    Backoff,
    Modular { policy: ModularPolicy },
}

/// MODULAR's pluggable conflict-resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModularPolicy {
    Aggressive,
    Suicide,
    Timestamp,
    Karma,
}

/// Process-wide configuration, built once and shared by every thread.
#[derive(Debug, Clone)]
pub struct Config {
    pub discipline: Discipline,
    pub contention_manager: ContentionManagerKind,
    /// `LOCK_ARRAY_LOG_SIZE`: `2^n` cells in the lock array (default 20).
    pub lock_array_log_size: u32,
    /// `LOCK_SHIFT_EXTRA`: extra address bits folded into a cell's stripe
    /// width beyond the natural word alignment (default 2).
    pub lock_shift_extra: u32,
    /// `RW_SET_SIZE`: initial read/write set capacity (default 4096).
    pub initial_set_capacity: usize,
    /// `EPOCH_GC`: reclaim retired descriptors/buffers via epoch tracking.
    /// Forced on when `contention_manager` is `Modular` (spec.md §4.F:
    /// "Requires the epoch GC").
    pub epoch_gc: bool,
    /// `ROLLOVER_CLOCK`: whether hitting `VERSION_MAX` triggers a quiesced
    /// reset (true) or a fatal condition (false, spec.md §7).
    pub rollover_clock: bool,
    /// `VR_THRESHOLD`: consecutive invisible-read aborts before MODULAR
    /// escalates to visible reads (default 3, env `VR_THRESHOLD`).
    pub vr_threshold: u32,
    /// `NO_SIGNAL_HANDLER`: parsed for source-fidelity with spec.md §6's
    /// environment variable table, but inert — this crate never installs a
    /// signal handler (see DESIGN.md, Open Question resolution #3); memory
    /// safety inside a transaction is instead guaranteed by epoch GC, so
    /// there is no SIGSEGV/SIGBUS path to translate.
    pub no_signal_handler: bool,
}

impl Config {
    pub fn new(discipline: Discipline, contention_manager: ContentionManagerKind) -> Self {
        let epoch_gc = matches!(contention_manager, ContentionManagerKind::Modular { .. });
        Self {
            discipline,
            contention_manager,
            lock_array_log_size: 20,
            lock_shift_extra: 2,
            initial_set_capacity: 4096,
            epoch_gc,
            rollover_clock: true,
            vr_threshold: 3,
            no_signal_handler: false,
        }
    }

    /// Reads `VR_THRESHOLD` and `NO_SIGNAL_HANDLER` from the process
    /// environment, falling back to the compiled-in defaults on a missing
    /// or unparsable value (spec.md §6's Environment Variables).
    pub fn from_env(discipline: Discipline, contention_manager: ContentionManagerKind) -> Self {
        let mut config = Self::new(discipline, contention_manager);
        if let Ok(raw) = env::var("VR_THRESHOLD") {
            if let Ok(parsed) = raw.parse() {
                config.vr_threshold = parsed;
            }
        }
        config.no_signal_handler = env::var("NO_SIGNAL_HANDLER").is_ok();
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Discipline::WriteBackEtl, ContentionManagerKind::Suicide)
    }
}
