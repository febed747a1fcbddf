// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread state: the wake/sleep protocol shared by every worker OS
//! thread, and the queue sets that make up a task thread or reactor thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;

use spsc::{Queue, Ring};

use crate::task::Task;

/// Ring capacity for `tasksAwaitingExecution`: `2^THREAD_WAIT_QUEUE_SIZE_LG2`
/// in the original, always 8.
pub(crate) const AWAITING_CAP: usize = 8;
/// Block size for `Task`-carrying unbounded queues.
pub(crate) const TASK_BLOCK: usize = 8;
/// Block size for `FiberPtr`-carrying unbounded queues.
pub(crate) const FIBER_BLOCK: usize = 32;
/// Block size for `ScheduledFiber`-carrying unbounded queues.
pub(crate) const SCHEDULED_BLOCK: usize = 16;

/// A `*mut fiber::Fiber`, wrapped so it can travel through the `Send`-bound
/// SPSC queues. Exactly one thread ever has the fiber "checked out" at a
/// time — the queues themselves enforce that handoff.
pub(crate) struct FiberPtr(pub(crate) *mut fiber::Fiber);

// Safety: a `FiberPtr` moving between queues represents the sole owner of
// that fiber transferring control of it; never aliased.
unsafe impl Send for FiberPtr {}

/// A fiber in transit between a task thread and a reactor thread (or back).
///
/// `thread_id` changes meaning with the queue it sits in, mirroring the
/// original scheduler's single reused field: in a task thread's
/// `stalled_tasks` it is the *destination* (the task thread itself, for a
/// yield, or a reactor's global index, for a wait); in a reactor's
/// `running_tasks`/`finished_tasks` it is the *origin* task thread the fiber
/// should return to once its wait resolves.
pub(crate) struct ScheduledFiber {
    pub(crate) fiber: FiberPtr,
    pub(crate) thread_id: u32,
}

// Safety: see `FiberPtr`.
unsafe impl Send for ScheduledFiber {}

/// State shared by every worker OS thread, whether it runs tasks or
/// reactors.
pub(crate) struct ThreadCommon {
    pub(crate) id: u32,
    /// Exchanged by `wake`, observed by `sleep`. `true` means "don't park,
    /// there's work"; mirrors the original's `hasData` futex word, but
    /// implemented on top of `std::thread::park`/`unpark`'s permit, which
    /// already tolerates the spurious wakeups the original's design
    /// explicitly allows for.
    has_data: AtomicBool,
    /// Whether the work pump's assignment phase should still hand this
    /// thread new work. Cleared by `detach`/`destroy`.
    pub(crate) active: AtomicBool,
    /// Set by `destroy` to ask this thread to exit its dispatch loop the
    /// next time it goes idle (both its own queues empty). Never forces a
    /// fiber mid-flight to abandon its stack.
    pub(crate) stop: AtomicBool,
    /// Filled in immediately after `std::thread::spawn` returns, before the
    /// thread can possibly be woken by anyone else.
    os_thread: OnceLock<std::thread::Thread>,
    /// Needed (beyond `os_thread`) so `pin`/`destroy` can reach the native
    /// thread handle and `join` it.
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadCommon {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            has_data: AtomicBool::new(false),
            active: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            os_thread: OnceLock::new(),
            join: Mutex::new(None),
        }
    }

    pub(crate) fn is_spawned(&self) -> bool {
        self.os_thread.get().is_some()
    }

    pub(crate) fn set_spawned(&self, handle: JoinHandle<()>) {
        self.os_thread
            .set(handle.thread().clone())
            .unwrap_or_else(|_| panic!("scheduler: thread {} spawned twice", self.id));
        *self.join.lock().unwrap() = Some(handle);
    }

    pub(crate) fn take_join(&self) -> Option<JoinHandle<()>> {
        self.join.lock().unwrap().take()
    }

    pub(crate) fn with_join<R>(&self, f: impl FnOnce(&JoinHandle<()>) -> R) -> Option<R> {
        self.join.lock().unwrap().as_ref().map(f)
    }

    /// Marks this thread as having work and wakes it if it might be parked.
    pub(crate) fn wake(&self) {
        if !self.has_data.swap(true, Ordering::AcqRel) {
            if let Some(thread) = self.os_thread.get() {
                thread.unpark();
            }
        }
    }

    /// Parks the calling thread (which must be this `ThreadCommon`'s own
    /// worker thread) until `wake` has been called since the last `sleep`.
    ///
    /// Checks and clears `has_data` in one atomic step so a `wake` that
    /// lands anywhere up to the moment we park is never lost: a separate
    /// load-then-store here could observe `true`, then overwrite it back to
    /// `false` itself, stranding the thread parked with no future wake ever
    /// coming.
    pub(crate) fn sleep(&self) {
        while !self.has_data.swap(false, Ordering::AcqRel) {
            std::thread::park();
        }
    }
}

/// A thread that runs `Task`s as fibers.
pub(crate) struct TaskThread {
    pub(crate) common: ThreadCommon,
    /// Tasks ready to start, not yet running. Bounded: a full ring makes the
    /// work pump skip this thread until it drains.
    pub(crate) tasks_awaiting_execution: Ring<Task, AWAITING_CAP>,
    /// Tasks this thread's own running fibers spawned (single producer: the
    /// one task fiber active on this thread at a time; single consumer: the
    /// serialized work pump).
    pub(crate) unassigned_tasks: Queue<Task, TASK_BLOCK>,
    /// Fibers ready to resume on this thread: either freshly started tasks
    /// or ones returning from a reactor wait.
    pub(crate) running_tasks: Queue<FiberPtr, FIBER_BLOCK>,
    /// Fibers that yielded or are waiting, not yet routed by the pump.
    pub(crate) stalled_tasks: Queue<ScheduledFiber, SCHEDULED_BLOCK>,
    /// The root fiber `FiberTask`'s dispatch loop runs on.
    pub(crate) root: std::cell::Cell<*mut fiber::Fiber>,
}

// Safety: the `Cell<*mut Fiber>` is only ever touched by this thread's own
// worker loop; everything else is either atomic or an SPSC queue already
// `Send`/`Sync` for the same reason.
unsafe impl Send for TaskThread {}
unsafe impl Sync for TaskThread {}

impl TaskThread {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            common: ThreadCommon::new(id),
            tasks_awaiting_execution: Ring::new(),
            unassigned_tasks: Queue::new(),
            running_tasks: Queue::new(),
            stalled_tasks: Queue::new(),
            root: std::cell::Cell::new(std::ptr::null_mut()),
        }
    }
}

/// A thread that performs blocking waits on behalf of task fibers that
/// called `TaskHandle::wait`.
pub(crate) struct ReactorThread {
    pub(crate) common: ThreadCommon,
    /// Fibers handed to this reactor to perform their wait on.
    pub(crate) running_tasks: Queue<ScheduledFiber, SCHEDULED_BLOCK>,
    /// Fibers that finished waiting, to be routed back to their origin
    /// task thread.
    pub(crate) finished_tasks: Queue<ScheduledFiber, SCHEDULED_BLOCK>,
    pub(crate) root: std::cell::Cell<*mut fiber::Fiber>,
}

unsafe impl Send for ReactorThread {}
unsafe impl Sync for ReactorThread {}

impl ReactorThread {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            common: ThreadCommon::new(id),
            running_tasks: Queue::new(),
            finished_tasks: Queue::new(),
            root: std::cell::Cell::new(std::ptr::null_mut()),
        }
    }
}
