// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios driving the full public API surface. Each test runs
//! on its own OS thread (the default Rust test harness behavior), so each
//! gets its own fresh thread-local registry.

use std::cell::RefCell;
use std::rc::Rc;

use lwp::{Status, Tid};

#[test]
fn s3_yield_ordering_interleaves_round_robin() {
    let _ = env_logger::try_init();
    let log = Rc::new(RefCell::new(Vec::new()));

    for tag in ["A", "B"] {
        let log = Rc::clone(&log);
        lwp::create(
            move |tag: &'static str| {
                for step in 0..3 {
                    log.borrow_mut().push(format!("{tag}{step}"));
                    lwp::yield_now();
                }
                0
            },
            tag,
        );
    }

    lwp::start();

    let mut status = Status::LIVE;
    while lwp::wait(Some(&mut status)) != Tid::NO_THREAD {}

    assert_eq!(*log.borrow(), vec!["A0", "B0", "A1", "B1", "A2", "B2"]);
}

#[test]
fn s5_wait_reaps_in_termination_order() {
    let _ = env_logger::try_init();
    for tag in 1..=5u8 {
        lwp::create(
            move |_: ()| {
                lwp::yield_now();
                i32::from(tag)
            },
            (),
        );
    }

    // A no-op migration: same kind as the already-installed default, so the
    // drained order must survive unchanged.
    lwp::set_scheduler(None);

    lwp::start();

    for expected_tag in 1..=5u8 {
        let mut status = Status::LIVE;
        let tid = lwp::wait(Some(&mut status));
        assert_ne!(tid, Tid::NO_THREAD);
        assert_eq!(status.exit_code(), expected_tag);
    }

    assert_eq!(lwp::wait(None), Tid::NO_THREAD);
}

#[test]
fn s6_fp_state_is_preserved_across_interleaved_yields() {
    let _ = env_logger::try_init();
    let result_a = Rc::new(RefCell::new(0.0f64));
    let result_b = Rc::new(RefCell::new(0.0f64));

    {
        let result_a = Rc::clone(&result_a);
        lwp::create(
            move |_: ()| {
                let mut acc = 0.0f64;
                for i in 0..50 {
                    acc += f64::from(i).sqrt();
                    lwp::yield_now();
                }
                *result_a.borrow_mut() = acc;
                0
            },
            (),
        );
    }
    {
        let result_b = Rc::clone(&result_b);
        lwp::create(
            move |_: ()| {
                let mut acc = 1.0f64;
                for i in 0..50 {
                    acc *= 1.0 + 1.0 / f64::from(i + 1);
                    lwp::yield_now();
                }
                *result_b.borrow_mut() = acc;
                0
            },
            (),
        );
    }

    lwp::start();
    let mut status = Status::LIVE;
    while lwp::wait(Some(&mut status)) != Tid::NO_THREAD {}

    let a = *result_a.borrow();
    let b = *result_b.borrow();
    assert!(a.is_finite() && a > 0.0, "a = {a}");
    assert!(b.is_finite() && b > 1.0, "b = {b}");
}

#[test]
fn s7_blocking_wait_reaps_fast_workers_before_the_slow_one() {
    let _ = env_logger::try_init();
    let observed = Rc::new(RefCell::new(None));

    {
        let observed = Rc::clone(&observed);
        lwp::create(
            move |_: ()| {
                let slow = lwp::create(
                    |_: ()| {
                        for _ in 0..10 {
                            lwp::yield_now();
                        }
                        42
                    },
                    (),
                );
                let fast_a = lwp::create(
                    |_: ()| {
                        lwp::yield_now();
                        1
                    },
                    (),
                );
                let fast_b = lwp::create(
                    |_: ()| {
                        lwp::yield_now();
                        2
                    },
                    (),
                );

                let mut seen = Vec::new();
                for _ in 0..3 {
                    let mut status = Status::LIVE;
                    let tid = lwp::wait(Some(&mut status));
                    seen.push((tid, status.exit_code()));
                }
                let fourth = lwp::wait(None);

                *observed.borrow_mut() = Some((seen, fourth, slow, fast_a, fast_b));
                0
            },
            (),
        );
    }

    lwp::start();

    let (seen, fourth, slow, fast_a, fast_b) = observed.borrow_mut().take().unwrap();

    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], (fast_a, 1));
    assert_eq!(seen[1], (fast_b, 2));
    assert_eq!(seen[2], (slow, 42));
    assert_eq!(fourth, Tid::NO_THREAD);
}
