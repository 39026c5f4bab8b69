// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

const YIELDS_PER_RUN: usize = 1_000;

/// Runs one full create/start/wait epoch on a fresh OS thread.
///
/// `start()` is a one-shot operation per thread-local registry (a second
/// call after the scheduler has drained is a silent no-op), so each
/// benchmark sample needs its own registry rather than reusing the
/// benchmark-harness thread's.
fn run_epoch(body: impl FnOnce() + Send + 'static) {
    std::thread::spawn(body).join().unwrap();
}

fn lwp_yield_switch(c: &mut Criterion) {
    c.bench_function("lwp_yield_switch", |b| {
        b.iter(|| {
            run_epoch(|| {
                lwp::create(
                    |_: ()| {
                        for _ in 0..YIELDS_PER_RUN {
                            lwp::yield_now();
                        }
                        0
                    },
                    (),
                );
                lwp::start();
                let mut status = lwp::Status::LIVE;
                black_box(lwp::wait(Some(&mut status)));
            });
        });
    });
}

fn lwp_create_and_run(c: &mut Criterion) {
    c.bench_function("lwp_create_and_run", |b| {
        b.iter(|| {
            run_epoch(|| {
                lwp::create(|_: ()| 0, ());
                lwp::start();
                let mut status = lwp::Status::LIVE;
                black_box(lwp::wait(Some(&mut status)));
            });
        });
    });
}

criterion_group!(benches, lwp_yield_switch, lwp_create_and_run);
criterion_main!(benches);
