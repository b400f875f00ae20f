// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use forseti_locks::{LockManager, NoopTracer, ResourceType};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn uncontended(c: &mut Criterion) {
    let size: u64 = 64;
    let lock_manager = LockManager::new();
    let client = lock_manager.client().unwrap();
    let ids: Vec<u64> = (0..size).collect();
    c.bench_with_input(
        BenchmarkId::new("LockClient: exclusive", size),
        &ids,
        |b, ids| {
            b.iter(|| {
                assert!(client
                    .acquire_exclusive(&NoopTracer, ResourceType::Node, ids)
                    .is_ok());
                assert!(client.release_exclusive(ResourceType::Node, ids).is_ok());
            });
        },
    );
}

fn contended_check(num_threads: usize, iters: u64) -> Duration {
    let lock_manager = LockManager::new();
    let barrier = Arc::new(Barrier::new(num_threads + 1));
    let mut thread_handles = Vec::with_capacity(num_threads);
    for thread_id in 0..num_threads {
        let barrier_cloned = barrier.clone();
        let lock_manager_cloned = lock_manager.clone();
        thread_handles.push(thread::spawn(move || {
            let client = lock_manager_cloned.client().unwrap();
            barrier_cloned.wait();
            for i in 0..iters {
                let id = i % 8;
                if thread_id % 4 == 0 {
                    assert!(client
                        .acquire_exclusive(&NoopTracer, ResourceType::Node, &[id])
                        .is_ok());
                    assert!(client.release_exclusive(ResourceType::Node, &[id]).is_ok());
                } else {
                    assert!(client
                        .acquire_shared(&NoopTracer, ResourceType::Node, &[id])
                        .is_ok());
                    assert!(client.release_shared(ResourceType::Node, &[id]).is_ok());
                }
            }
        }));
    }
    let start = Instant::now();
    barrier.wait();
    for handle in thread_handles {
        handle.join().unwrap();
    }
    start.elapsed()
}

fn contended(c: &mut Criterion) {
    let num_threads = 4;
    c.bench_with_input(
        BenchmarkId::new("LockClient: contended", num_threads),
        &num_threads,
        |b, &n| {
            b.iter_custom(|iters| contended_check(n, iters));
        },
    );
}

criterion_group!(lock_client, uncontended, contended);
criterion_main!(lock_client);
