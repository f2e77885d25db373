// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Commit throughput under varying contention, adapted from the teacher's
//! `benches/memory.rs` (there, a single async `tx.write` iterated through
//! criterion's `to_async` harness). This runtime is synchronous, so the
//! harness drops straight to `Criterion::bench_function`.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tinystm::{BeginAttrs, Config, ContentionManagerKind, Discipline, Stm, Transaction};

fn bench_uncontended_increment(c: &mut Criterion) {
    let stm = Stm::with_config(Config::default());
    let var = stm.create(0i64);

    c.bench_function("uncontended_increment", |b| {
        b.iter(|| {
            let var = var.clone();
            stm.read_write(BeginAttrs::new(), move |tx: &mut Transaction<i64>| {
                let v = tx.load(&var)?;
                tx.store(&var, v + 1)?;
                Ok(())
            })
            .expect("commit should not fail in an uncontended benchmark");
        })
    });
}

fn bench_disciplines(c: &mut Criterion) {
    let mut group = c.benchmark_group("discipline_commit");
    for discipline in [Discipline::WriteBackEtl, Discipline::WriteBackCtl, Discipline::WriteThrough] {
        let stm = Stm::with_config(Config::new(discipline, ContentionManagerKind::Suicide));
        let var = stm.create(0i64);
        group.bench_with_input(BenchmarkId::from_parameter(format!("{:?}", discipline)), &discipline, |b, _| {
            b.iter(|| {
                let var = var.clone();
                stm.read_write(BeginAttrs::new(), move |tx: &mut Transaction<i64>| {
                    let v = tx.load(&var)?;
                    tx.store(&var, v + 1)?;
                    Ok(())
                })
                .expect("commit should not fail in an uncontended benchmark");
            })
        });
    }
    group.finish();
}

fn bench_shared_counter_threads(c: &mut Criterion) {
    use std::sync::Arc;
    use std::thread;

    let mut group = c.benchmark_group("shared_counter_threads");
    for nb_threads in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(nb_threads), &nb_threads, |b, &nb_threads| {
            b.iter(|| {
                let stm = Arc::new(Stm::with_config(Config::default()));
                let var = stm.create(0i64);
                let handles: Vec<_> = (0..nb_threads)
                    .map(|_| {
                        let stm = stm.clone();
                        let var = var.clone();
                        thread::spawn(move || {
                            for _ in 0..100 {
                                let var = var.clone();
                                stm.read_write(BeginAttrs::new(), move |tx: &mut Transaction<i64>| {
                                    let v = tx.load(&var)?;
                                    tx.store(&var, v + 1)?;
                                    Ok(())
                                })
                                .expect("commit should not fail");
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_uncontended_increment, bench_disciplines, bench_shared_counter_threads);
criterion_main!(benches);
