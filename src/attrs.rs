// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction begin attributes (spec.md §6).

/// Options supplied to [`crate::runtime::Stm::read_write`]/`read_only`,
/// mirroring spec.md's `begin(attrs)` table.
#[derive(Debug, Clone)]
pub struct BeginAttrs {
    /// Opaque application tag, visible to contention managers and stats.
    pub id: u64,
    /// Hint only; a write inside the body clears it and restarts the
    /// attempt with `read_only` false (spec.md §4.G.2/§4.G.3).
    pub read_only: bool,
    /// MODULAR only: forces visible reads from the first attempt, instead
    /// of waiting for `vr_threshold` consecutive invisible-read aborts.
    pub visible_reads: bool,
    /// When set, an `AbortReason::Explicit` abort does not retry — control
    /// returns to the caller immediately (spec.md §4.G.7).
    pub no_retry: bool,
    /// Advisory priority hint for MODULAR's `timestamp`/`karma` policies.
    /// Never enforced as a hard deadline.
    pub deadline: Option<u64>,
}

impl BeginAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn visible_reads(mut self) -> Self {
        self.visible_reads = true;
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }

    pub fn with_deadline(mut self, deadline: u64) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Default for BeginAttrs {
    fn default() -> Self {
        Self {
            id: 0,
            read_only: false,
            visible_reads: false,
            no_retry: false,
            deadline: None,
        }
    }
}
