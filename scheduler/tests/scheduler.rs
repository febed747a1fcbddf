// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end behavior of a built [`Scheduler`](scheduler::Scheduler): task
//! submission, waiting, yielding, and thread lifecycle, all through the
//! public API.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use scheduler::{Builder, Error};

#[test]
fn single_task_runs_and_can_be_waited_on() {
    let sch = Builder::new().task_threads(2).reactor_threads(1).build().unwrap();
    let ran = Arc::new(AtomicU32::new(0));

    let flag = ran.clone();
    let handle = sch.spawn(move || {
        flag.store(1, Ordering::SeqCst);
    });
    handle.wait();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn run_and_wait_blocks_until_the_task_has_run() {
    let sch = Builder::new().task_threads(1).reactor_threads(1).build().unwrap();
    let ran = Arc::new(AtomicU32::new(0));

    let flag = ran.clone();
    sch.run_and_wait(move || {
        flag.store(42, Ordering::SeqCst);
    });

    assert_eq!(ran.load(Ordering::SeqCst), 42);
}

#[test]
fn many_tasks_from_outside_any_fiber_all_complete() {
    let sch = Builder::new().task_threads(4).reactor_threads(1).build().unwrap();
    let total = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..500)
        .map(|_| {
            let total = total.clone();
            sch.spawn(move || {
                total.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();

    for handle in handles {
        handle.wait();
    }

    assert_eq!(total.load(Ordering::Relaxed), 500);
}

#[test]
fn yielding_resumes_and_runs_to_completion() {
    let sch = Builder::new().task_threads(1).reactor_threads(1).build().unwrap();
    let total = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let total = total.clone();
            sch.spawn(move || {
                for _ in 0..3 {
                    scheduler::yield_now();
                }
                total.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();

    for handle in handles {
        handle.wait();
    }

    assert_eq!(total.load(Ordering::Relaxed), 20);
}

#[test]
fn waiting_inside_a_task_fiber_hops_through_a_reactor() {
    let sch = Builder::new().task_threads(2).reactor_threads(1).build().unwrap();
    let child_ran = Arc::new(AtomicU32::new(0));
    let parent_ran = Arc::new(AtomicU32::new(0));

    let inner_sch = sch.clone();
    let inner_child_ran = child_ran.clone();
    let inner_parent_ran = parent_ran.clone();
    sch.run_and_wait(move || {
        let child_ran = inner_child_ran.clone();
        let child = inner_sch.spawn(move || {
            child_ran.store(1, Ordering::SeqCst);
        });
        // Waiting from inside a task fiber must not block the task thread
        // underneath it: with a reactor thread available this fiber is
        // handed to it and resumed once the child completes.
        child.wait();
        assert_eq!(inner_child_ran.load(Ordering::SeqCst), 1);
        inner_parent_ran.store(1, Ordering::SeqCst);
    });

    assert_eq!(child_ran.load(Ordering::SeqCst), 1);
    assert_eq!(parent_ran.load(Ordering::SeqCst), 1);
}

#[test]
fn waiting_inside_a_fiber_with_no_reactors_still_completes() {
    let sch = Builder::new().task_threads(2).reactor_threads(0).build().unwrap();
    let child_ran = Arc::new(AtomicU32::new(0));

    let inner_sch = sch.clone();
    let inner_child_ran = child_ran.clone();
    sch.run_and_wait(move || {
        let child_ran = inner_child_ran.clone();
        let child = inner_sch.spawn(move || {
            child_ran.store(7, Ordering::SeqCst);
        });
        child.wait();
    });

    assert_eq!(child_ran.load(Ordering::SeqCst), 7);
}

#[test]
fn builder_rejects_zero_task_threads() {
    let err = Builder::new().task_threads(0).build().unwrap_err();
    assert!(matches!(err, Error::NoTaskThreads));
}

#[test]
fn builder_rejects_task_threads_above_the_max() {
    let err = Builder::new().task_threads(4).max_task_threads(2).build().unwrap_err();
    assert!(matches!(err, Error::TooManyTaskThreads));
}

#[test]
fn add_task_thread_grows_up_to_the_configured_max() {
    let sch = Builder::new().task_threads(1).max_task_threads(2).reactor_threads(1).build().unwrap();

    let id = sch.add_task_thread().expect("one unspawned slot left");
    assert_eq!(id, 1);

    assert!(matches!(sch.add_task_thread(), Err(Error::NoCapacity)));

    let total = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..50)
        .map(|_| {
            let total = total.clone();
            sch.spawn(move || {
                total.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();
    for handle in handles {
        handle.wait();
    }
    assert_eq!(total.load(Ordering::Relaxed), 50);
}

#[test]
fn destroyed_task_thread_stops_taking_new_work_but_leftovers_still_run() {
    let sch = Builder::new().task_threads(2).reactor_threads(1).build().unwrap();

    sch.destroy_task_thread(1);

    let total = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..100)
        .map(|_| {
            let total = total.clone();
            sch.spawn(move || {
                total.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();
    for handle in handles {
        handle.wait();
    }

    assert_eq!(total.load(Ordering::Relaxed), 100);
}

#[test]
fn pinning_an_unspawned_task_thread_errors_instead_of_panicking() {
    let sch = Builder::new().task_threads(1).max_task_threads(2).reactor_threads(1).build().unwrap();
    assert!(sch.pin_task_thread(1, 0).is_err());
}

#[test]
fn cloned_task_handles_can_both_wait() {
    let sch = Builder::new().task_threads(1).reactor_threads(1).build().unwrap();
    let ran = Arc::new(AtomicU32::new(0));

    let flag = ran.clone();
    let handle = sch.spawn(move || {
        flag.fetch_add(1, Ordering::SeqCst);
    });
    let other = handle.clone();

    handle.wait();
    other.wait();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
}
