// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! "Paper tests", adapted from the patterns in
//! <https://www.researchgate.net/publication/220854689_Testing_patterns_for_software_transactional_memory_engines>:
//! high-frequency variable churn, heavy single-variable contention, and a
//! large variable count. Ported from the sync `threadpool` harness the
//! teacher already used for its own `test_stm_threaded_one_tvar`, rather
//! than the tokio-flavored `test_paper_*` variants, since this runtime is
//! synchronous end to end.

use rand::{distributions::Bernoulli, prelude::Distribution, Rng};
use std::collections::HashSet;
use threadpool::ThreadPool;
use tinystm::{BeginAttrs, Config, Stm, Transaction};

#[allow(unused_imports)]
use log::*;

#[cfg(feature = "verbose")]
fn init_logging() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::Info).try_init();
}

#[cfg(not(feature = "verbose"))]
fn init_logging() {}

#[test]
fn bank_transfer_preserves_total() {
    init_logging();
    let stm = Stm::with_config(Config::default());

    let alice = stm.create(10i64);
    let bob = stm.create(100i64);
    let charly = stm.create(0i64);

    let (a, b, c) = (alice.clone(), bob.clone(), charly.clone());
    let transfer = 30;
    let bonus = 40;
    let result = stm.read_write(BeginAttrs::new(), move |tx: &mut Transaction<i64>| {
        let mut amt_alice = tx.load(&a)?;
        let mut amt_bob = tx.load(&b)?;
        let mut amt_charly = tx.load(&c)?;
        amt_alice += bonus;
        amt_bob -= transfer;
        amt_charly += transfer;
        tx.store(&a, amt_alice)?;
        tx.store(&b, amt_bob)?;
        tx.store(&c, amt_charly)?;
        Ok(())
    });
    assert!(result.is_ok());

    assert_eq!(stm.unit_load(&alice).unwrap().0, 50);
    assert_eq!(stm.unit_load(&bob).unwrap().0, 70);
    assert_eq!(stm.unit_load(&charly).unwrap().0, 30);
}

#[test]
fn high_churn_set_insertions_from_many_threads() {
    init_logging();
    let stm = Stm::with_config(Config::default());
    const ENTRIES: usize = 500;

    // Bernoulli split between a read-write inserter and a read-only
    // observer for each entry, mirroring the teacher's workload mix.
    let distribution = Bernoulli::new(0.7).unwrap();
    let mut expected: HashSet<String> = (0..ENTRIES).map(|e| format!("{:04}", e)).collect();
    let mut skipped = HashSet::new();

    let set = stm.create(HashSet::<String>::new());
    let pool = ThreadPool::new(8);

    for value in expected.iter() {
        let stm_a = stm.clone();
        let set_a = set.clone();
        let value = value.clone();
        let is_read_only = distribution.sample(&mut rand::thread_rng());
        if is_read_only {
            skipped.insert(value.clone());
        }

        pool.execute(move || {
            let result = if is_read_only {
                stm_a.read_only(move |tx: &mut Transaction<HashSet<String>>| {
                    let _inner = tx.load(&set_a)?;
                    Ok(())
                })
            } else {
                stm_a.read_write(BeginAttrs::new(), move |tx: &mut Transaction<HashSet<String>>| {
                    let mut inner = tx.load(&set_a)?;
                    inner.insert(value.clone());
                    tx.store(&set_a, inner)?;
                    Ok(())
                })
            };
            assert!(result.is_ok(), "transaction failed: {:?}", result.err());
        });
    }

    pool.join();
    for value in skipped.iter() {
        expected.remove(value);
    }

    let actual = stm.unit_load(&set).unwrap().0;
    assert!(
        expected.is_subset(&actual),
        "missing entries: {:?}",
        expected.difference(&actual).collect::<Vec<_>>()
    );
}

#[test]
fn heavy_single_variable_contention_converges() {
    init_logging();
    const NB_THREADS: usize = 32;
    const NB_ITER: usize = 200;

    let stm = Stm::with_config(Config::default());
    let counter = stm.create(0i64);
    let pool = ThreadPool::new(NB_THREADS);

    for _ in 0..NB_THREADS {
        let stm1 = stm.clone();
        let counter1 = counter.clone();
        pool.execute(move || {
            for _ in 0..NB_ITER {
                let counter2 = counter1.clone();
                let result = stm1.read_write(BeginAttrs::new(), move |tx: &mut Transaction<i64>| {
                    let v = tx.load(&counter2)?;
                    tx.store(&counter2, v + 1)?;
                    Ok(())
                });
                assert!(result.is_ok());
            }
        });
    }
    pool.join();

    let value = stm.unit_load(&counter).unwrap().0;
    assert_eq!(value, (NB_THREADS * NB_ITER) as i64);
}

#[test]
fn many_tvars_each_incremented_once_per_thread() {
    init_logging();
    const NB_TVAR: usize = 2000;
    const NB_THREADS: usize = 6;

    let stm = Stm::with_config(Config::default());
    let vars: Vec<_> = (0..NB_TVAR).map(|_| stm.create(0usize)).collect();
    let pool = ThreadPool::new(NB_THREADS);

    for _ in 0..NB_THREADS {
        let stm1 = stm.clone();
        let vars1 = vars.clone();
        pool.execute(move || {
            for var in vars1.iter() {
                let var = var.clone();
                let result = stm1.read_write(BeginAttrs::new(), move |tx: &mut Transaction<usize>| {
                    let v = tx.load(&var)?;
                    tx.store(&var, v + 1)?;
                    Ok(())
                });
                assert!(result.is_ok());
            }
        });
    }
    pool.join();

    for var in vars.iter() {
        assert_eq!(stm.unit_load(var).unwrap().0, NB_THREADS);
    }
}
