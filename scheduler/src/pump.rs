// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work pump: the only code that touches more than one thread's queues.
//!
//! Run by whichever task thread wins `work_pump_lock`; that mutual exclusion
//! is what lets every queue stay single-producer/single-consumer even
//! though, over time, different OS threads play the "pump" role.

use crate::scheduler::Scheduler;
use crate::thread::{ScheduledFiber, AWAITING_CAP};

pub(crate) fn run(scheduler: &Scheduler) {
    drain_stalled_tasks(scheduler);
    drain_reactors(scheduler);
    assign_unassigned_to_threads(scheduler);
}

/// Phase 1: route every task thread's stalled fibers to wherever they asked
/// to go next — back onto the same thread (yield) or onto a reactor (wait).
fn drain_stalled_tasks(scheduler: &Scheduler) {
    let task_thread_count = scheduler.task_threads.len() as u32;

    for thread in scheduler.task_threads.iter() {
        // Safety: the pump is the sole consumer of `stalled_tasks`, and only
        // one thread ever runs the pump at a time (`work_pump_lock`).
        while let Some(ScheduledFiber { fiber, thread_id: dest }) = unsafe { thread.stalled_tasks.try_pop() } {
            if dest < task_thread_count {
                debug_assert_eq!(dest, thread.common.id, "scheduler: yield routed to a foreign task thread");
                let dest_thread = &scheduler.task_threads[dest as usize];
                // Safety: the pump is the sole producer of `running_tasks`
                // while it holds `work_pump_lock`.
                unsafe { dest_thread.running_tasks.push(fiber) };
                dest_thread.common.wake();
            } else {
                let reactor_index = (dest - task_thread_count) as usize;
                let reactor = &scheduler.reactor_threads[reactor_index];
                // Safety: see above.
                unsafe {
                    reactor.running_tasks.push(ScheduledFiber {
                        fiber,
                        thread_id: thread.common.id,
                    });
                }
                reactor.common.wake();
            }
        }
    }
}

/// Phase 2: route every reactor's finished waits back to their origin task
/// thread.
fn drain_reactors(scheduler: &Scheduler) {
    for reactor in scheduler.reactor_threads.iter() {
        // Safety: see `drain_stalled_tasks`.
        while let Some(ScheduledFiber { fiber, thread_id: origin }) = unsafe { reactor.finished_tasks.try_pop() } {
            let dest_thread = &scheduler.task_threads[origin as usize];
            // Safety: see `drain_stalled_tasks`.
            unsafe { dest_thread.running_tasks.push(fiber) };
            dest_thread.common.wake();
        }
    }
}

/// Phase 3: round-robin newly created tasks into every active, non-full
/// task thread's `tasks_awaiting_execution` ring.
fn assign_unassigned_to_threads(scheduler: &Scheduler) {
    let task_thread_count = scheduler.task_threads.len();
    let mut writeable: Vec<(usize, u32)> = Vec::with_capacity(task_thread_count);

    for index in 0..task_thread_count {
        if !scheduler.is_active(index as u32) {
            continue;
        }
        let thread = &scheduler.task_threads[index];
        let open = AWAITING_CAP as u32 - thread.tasks_awaiting_execution.current_size();
        if open > 0 {
            writeable.push((index, open));
        }
    }

    drain_into_writeable(scheduler, &mut writeable, ReadSource::PerThread(task_thread_count));
    if !writeable.is_empty() {
        drain_into_writeable(scheduler, &mut writeable, ReadSource::External);
    }
}

enum ReadSource {
    /// Drain each task thread's own `unassigned_tasks` in round-robin order.
    PerThread(usize),
    /// Drain tasks submitted from outside any task fiber.
    External,
}

fn drain_into_writeable(scheduler: &Scheduler, writeable: &mut Vec<(usize, u32)>, source: ReadSource) {
    let mut write_cursor = 0usize;

    loop {
        let mut added = false;

        match source {
            ReadSource::PerThread(task_thread_count) => {
                for read_index in 0..task_thread_count {
                    if writeable.is_empty() {
                        break;
                    }
                    let read_thread = &scheduler.task_threads[read_index];
                    // Safety: the pump is the sole consumer of `unassigned_tasks`.
                    let Some(task) = (unsafe { read_thread.unassigned_tasks.try_pop() }) else {
                        continue;
                    };
                    assign_one(scheduler, writeable, &mut write_cursor, task);
                    added = true;
                }
            }
            ReadSource::External => {
                while !writeable.is_empty() {
                    let Some(task) = scheduler.external_submissions.lock().unwrap().pop_front() else {
                        break;
                    };
                    assign_one(scheduler, writeable, &mut write_cursor, task);
                    added = true;
                }
            }
        }

        if !added || writeable.is_empty() {
            break;
        }
    }
}

fn assign_one(scheduler: &Scheduler, writeable: &mut Vec<(usize, u32)>, write_cursor: &mut usize, task: crate::task::Task) {
    let write_index = *write_cursor % writeable.len();
    let (thread_index, open) = &mut writeable[write_index];
    let write_thread = &scheduler.task_threads[*thread_index];

    let was_empty = write_thread.tasks_awaiting_execution.is_empty();
    // Safety: the pump is the sole producer of `tasks_awaiting_execution`
    // while it holds `work_pump_lock`; we just confirmed an open slot.
    let pushed = unsafe { write_thread.tasks_awaiting_execution.try_push(task) };
    debug_assert!(pushed.is_ok(), "scheduler: writeable thread's ring rejected a push");
    if was_empty {
        write_thread.common.wake();
    }

    *open -= 1;
    if *open == 0 {
        writeable.swap_remove(write_index);
    } else {
        *write_cursor += 1;
    }
}
