// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};
use forseti_locks::utils;
use std::thread;

fn std_thread_id(c: &mut Criterion) {
    let current_thread_id = thread::current().id();
    c.bench_function("std: thread::id", |b| {
        b.iter(|| {
            assert_eq!(current_thread_id, thread::current().id());
        });
    });
}

fn thread_id(c: &mut Criterion) {
    let current_thread_id = thread::current().id();
    c.bench_function("utils: thread_id", |b| {
        b.iter(|| {
            assert_eq!(current_thread_id, utils::thread_id());
        });
    });
}

fn thread_hash(c: &mut Criterion) {
    let current_thread_hash = utils::thread_hash();
    c.bench_function("utils: thread_hash", |b| {
        b.iter(|| {
            assert_eq!(current_thread_hash, utils::thread_hash());
        });
    });
}

criterion_group!(utils, std_thread_id, thread_id, thread_hash);
criterion_main!(utils);
