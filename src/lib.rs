// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A word-based software transactional memory runtime.
//!
//! Transactional variables ([`TVar`]) are created from a process-wide
//! handle ([`Stm`]) and read or written from inside a closure passed to
//! [`Stm::read_write`]/[`Stm::read_only`], which retries the closure until
//! it commits. The runtime is configured once, at construction, with an
//! update discipline and a contention-management policy
//! ([`Config`]/[`Discipline`]/[`ContentionManagerKind`]).
//!
//! ```
//! use tinystm::{BeginAttrs, Config, Stm, Transaction};
//!
//! let stm = Stm::with_config(Config::default());
//! let balance = stm.create(100i64);
//!
//! stm.read_write(BeginAttrs::new(), move |tx: &mut Transaction<i64>| {
//!     let current = tx.load(&balance)?;
//!     tx.store(&balance, current - 30)?;
//!     Ok(())
//! })
//! .expect("transaction should commit");
//! ```

pub mod attrs;
pub mod callbacks;
pub mod clock;
pub mod config;
pub mod contention;
pub mod discipline;
pub mod error;
pub mod lock;
pub mod quiesce;
pub mod runtime;
pub mod sets;
pub mod transaction;
pub mod tvar;
pub mod unit;

pub use attrs::BeginAttrs;
pub use callbacks::{CallbackArg, CallbackHooks, CallbackToken, SpecificKey};
pub use config::{Config, ContentionManagerKind, Discipline, ModularPolicy};
pub use error::{AbortReason, StmError};
pub use runtime::{Stats, StatsSnapshot, Stm};
pub use transaction::{Transaction, WordLike};
pub use tvar::TVar;
