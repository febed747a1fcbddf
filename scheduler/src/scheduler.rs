// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler itself: per-thread dispatch loops, the thread-local fiber
//! context that lets a task suspend on one thread and resume on another, and
//! the public task/thread-management surface.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use fiber::stack::StackPool;
use fiber::FiberApi;
use spsc::Queue;

use crate::error::Error;
use crate::options::Options;
use crate::pump;
use crate::task::{run_boxed_closure, Task, TaskFn, TaskHandle, TaskRefSlab};
use crate::thread::{FiberPtr, ReactorThread, ScheduledFiber, TaskThread, SCHEDULED_BLOCK};

/// A pool of task threads running `Task`s as fibers, backed by a pool of
/// reactor threads that perform blocking waits on task fibers' behalf so a
/// waiting task never blocks the task thread underneath it.
///
/// Always held behind an `Arc`; [`crate::Builder::build`] is the only way to
/// construct one.
pub struct Scheduler {
    pub(crate) api: FiberApi,
    options: Options,
    pub(crate) task_threads: Box<[TaskThread]>,
    pub(crate) reactor_threads: Box<[ReactorThread]>,
    active_task_threads: Box<[AtomicU32]>,
    pub(crate) running: AtomicBool,
    work_pump_lock: AtomicBool,
    pub(crate) task_refs: TaskRefSlab,
    pub(crate) external_submissions: Mutex<VecDeque<Task>>,
    next_reactor: AtomicU32,
    task_stack_size: usize,
    root_stack_size: usize,
}

// A raw pointer to a `Scheduler`, handed to a worker thread at spawn time
// instead of a cloned `Arc`. Every worker thread is joined by `Drop` before
// the `Scheduler`'s memory is freed, so the pointer outlives every use of
// it — mirroring the original's raw `Scheduler*`, and avoiding the
// strong-reference cycle a thread-held `Arc<Scheduler>` would otherwise
// create (the scheduler would never reach a zero refcount to shut down).
#[derive(Clone, Copy)]
struct SchedulerPtr(*const Scheduler);

// Safety: the pointee is only ever accessed through shared (`&Scheduler`)
// access from worker threads, after the producing `Arc` has fully
// initialized it.
unsafe impl Send for SchedulerPtr {}

impl SchedulerPtr {
    /// # Safety
    ///
    /// The `Scheduler` this points at must not yet have been dropped.
    unsafe fn get(self) -> &'static Scheduler {
        // Safety: forwarded by caller.
        unsafe { &*self.0 }
    }
}

impl Scheduler {
    pub(crate) fn new(
        task_thread_count: u32,
        max_task_threads: u32,
        reactor_thread_count: u32,
        options: Options,
        task_stack_size: usize,
        root_stack_size: usize,
    ) -> Arc<Self> {
        let api = fiber::get_api(crate::options::to_fiber_options(options));
        let task_threads: Box<[TaskThread]> = (0..max_task_threads).map(TaskThread::new).collect();
        let reactor_threads: Box<[ReactorThread]> = (0..reactor_thread_count).map(ReactorThread::new).collect();
        let word_count = (max_task_threads as usize).div_ceil(32).max(1);
        let active_task_threads: Box<[AtomicU32]> = (0..word_count).map(|_| AtomicU32::new(0)).collect();

        let scheduler = Arc::new(Scheduler {
            api,
            options,
            task_threads,
            reactor_threads,
            active_task_threads,
            running: AtomicBool::new(true),
            work_pump_lock: AtomicBool::new(false),
            task_refs: TaskRefSlab::new(),
            external_submissions: Mutex::new(VecDeque::new()),
            next_reactor: AtomicU32::new(0),
            task_stack_size,
            root_stack_size,
        });

        for id in 0..reactor_thread_count {
            spawn_reactor_thread(&scheduler, id);
        }
        for id in 0..task_thread_count {
            spawn_task_thread(&scheduler, id);
        }

        scheduler
    }

    #[must_use]
    pub fn options(&self) -> Options {
        self.options
    }

    pub(crate) fn is_active(&self, index: u32) -> bool {
        let word = &self.active_task_threads[(index / 32) as usize];
        word.load(Ordering::Acquire) & (1 << (index % 32)) != 0
    }

    fn set_active(&self, index: u32, active: bool) {
        let word = &self.active_task_threads[(index / 32) as usize];
        if active {
            word.fetch_or(1 << (index % 32), Ordering::AcqRel);
        } else {
            word.fetch_and(!(1 << (index % 32)), Ordering::AcqRel);
        }
    }

    pub(crate) fn work_pump_lock(&self) -> &AtomicBool {
        &self.work_pump_lock
    }

    /// Builds a task that copies `size` bytes out of `user_data` into a
    /// buffer the scheduler owns, without scheduling it.
    ///
    /// # Safety
    ///
    /// `user_data` must be valid for reads of `size` bytes.
    #[must_use]
    pub unsafe fn create_task(self: &Arc<Self>, func: TaskFn, user_data: *const u8, size: usize, align: usize) -> PendingTask {
        // Safety: forwarded by caller.
        let task = unsafe { Task::create(func, user_data, size, align) };
        PendingTask {
            scheduler: self.clone(),
            task,
        }
    }

    /// Builds a task that runs directly against `user_data`, without
    /// scheduling it. The caller must keep `user_data` alive and
    /// exclusively accessible until the returned [`TaskHandle`] resolves.
    #[must_use]
    pub fn create_task_stack(self: &Arc<Self>, func: TaskFn, user_data: *mut u8) -> PendingTask {
        PendingTask {
            scheduler: self.clone(),
            task: Task::create_stack(func, user_data),
        }
    }

    /// Boxes `f` and schedules it to run on some task thread.
    pub fn spawn<F>(self: &Arc<Self>, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let ptr = Box::into_raw(Box::new(f)).cast::<u8>();
        let task = Task::create_stack(run_boxed_closure::<F>, ptr);
        self.submit(task, None)
    }

    /// Boxes `f`, schedules it, and blocks until it has run.
    pub fn run_and_wait<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(f).wait();
    }

    pub(crate) fn submit(self: &Arc<Self>, task: Task, _thread_hint: Option<u32>) -> TaskHandle {
        let index = self.task_refs.alloc();
        let mut task = task;
        task.task_ref = Some(index);

        if in_task_fiber() {
            let origin = current().origin_task_thread;
            // Safety: single producer — the one task fiber currently
            // running on its origin task thread.
            unsafe { self.task_threads[origin as usize].unassigned_tasks.push(task) };
        } else {
            self.external_submissions.lock().unwrap().push_back(task);
        }
        self.wake_any_task_thread();

        TaskHandle::new(self.clone(), index)
    }

    fn wake_any_task_thread(&self) {
        for (index, thread) in self.task_threads.iter().enumerate() {
            if self.is_active(index as u32) {
                thread.common.wake();
                return;
            }
        }
    }

    /// Spawns the next never-before-used task thread slot, returning its
    /// index. Fails if every slot up to `Builder::max_task_threads` has
    /// already been spawned once (destroyed threads are not recycled).
    pub fn add_task_thread(self: &Arc<Self>) -> Result<u32, Error> {
        for (index, thread) in self.task_threads.iter().enumerate() {
            if !thread.common.is_spawned() {
                let id = index as u32;
                spawn_task_thread(self, id);
                return Ok(id);
            }
        }
        Err(Error::NoCapacity)
    }

    /// Stops handing `id` new work through the pump's assignment phase.
    /// Fibers already running or in flight on it are unaffected.
    pub fn detach_task_thread(&self, id: u32) {
        self.set_active(id, false);
    }

    /// Detaches `id`, then asks it to exit its dispatch loop and joins it
    /// once it next goes idle (both its own queues empty). Any task still
    /// sitting in its `unassigned_tasks` queue is left for the ordinary work
    /// pump to drain — the pump's assignment phase reads every task thread's
    /// `unassigned_tasks` regardless of active status, so a detached
    /// thread's leftover self-spawned tasks still reach another active
    /// thread without this function becoming a second consumer of that
    /// queue.
    pub fn destroy_task_thread(&self, id: u32) {
        self.detach_task_thread(id);
        let thread = &self.task_threads[id as usize];
        thread.common.stop.store(true, Ordering::Release);
        thread.common.wake();

        if let Some(handle) = thread.common.take_join() {
            let _ = handle.join();
        }

        self.wake_any_task_thread();
    }

    /// Pins task thread `id` to logical CPU `core`.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` has not been spawned yet, or the
    /// platform affinity call fails.
    pub fn pin_task_thread(&self, id: u32, core: usize) -> std::io::Result<()> {
        self.task_threads[id as usize]
            .common
            .with_join(|handle| pin_handle(handle, core))
            .unwrap_or_else(|| Err(std::io::Error::other("scheduler: task thread not yet spawned")))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        for thread in self.task_threads.iter() {
            thread.common.wake();
        }
        for thread in self.reactor_threads.iter() {
            thread.common.wake();
        }
        for thread in self.task_threads.iter() {
            if let Some(handle) = thread.common.take_join() {
                let _ = handle.join();
            }
        }
        for thread in self.reactor_threads.iter() {
            if let Some(handle) = thread.common.take_join() {
                let _ = handle.join();
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn pin_handle(handle: &std::thread::JoinHandle<()>, core: usize) -> std::io::Result<()> {
            use std::os::unix::thread::JoinHandleExt;
            let pthread = handle.as_pthread_t();
            // Safety: `pthread` names a live thread for the duration of
            // this call; `handle`'s owning mutex keeps it from being
            // joined concurrently.
            unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_ZERO(&mut set);
                libc::CPU_SET(core, &mut set);
                let rc = libc::pthread_setaffinity_np(pthread, std::mem::size_of::<libc::cpu_set_t>(), &set);
                if rc != 0 {
                    return Err(std::io::Error::from_raw_os_error(rc));
                }
            }
            Ok(())
        }
    } else if #[cfg(windows)] {
        fn pin_handle(handle: &std::thread::JoinHandle<()>, core: usize) -> std::io::Result<()> {
            use std::os::windows::io::AsRawHandle;
            use windows_sys::Win32::System::Threading::SetThreadAffinityMask;

            let raw = handle.as_raw_handle();
            let mask: usize = 1usize
                .checked_shl(core as u32)
                .expect("scheduler: core index too large for an affinity mask");

            // Safety: `raw` names a live thread for the duration of this
            // call.
            let prev = unsafe { SetThreadAffinityMask(raw as _, mask) };
            if prev == 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        }
    } else {
        fn pin_handle(_handle: &std::thread::JoinHandle<()>, _core: usize) -> std::io::Result<()> {
            Err(std::io::Error::other("scheduler: thread pinning is not supported on this platform"))
        }
    }
}

/// A task built but not yet scheduled; consume with [`PendingTask::run`].
#[must_use = "a PendingTask does nothing until `run` is called"]
pub struct PendingTask {
    scheduler: Arc<Scheduler>,
    task: Task,
}

impl PendingTask {
    /// Schedules the task, returning a handle that can be waited on.
    ///
    /// `thread_hint` names a preferred task thread; honoring it is
    /// best-effort only — this scheduler does not currently enforce it, and
    /// tasks are always distributed by the work pump's round-robin
    /// assignment.
    pub fn run(self, thread_hint: Option<u32>) -> TaskHandle {
        self.scheduler.submit(self.task, thread_hint)
    }

    /// Schedules the task and blocks until it has run.
    pub fn run_and_wait(self, thread_hint: Option<u32>) {
        self.run(thread_hint).wait();
    }
}

fn spawn_task_thread(scheduler: &Arc<Scheduler>, id: u32) {
    let ptr = SchedulerPtr(Arc::as_ptr(scheduler));
    let handle = std::thread::Builder::new()
        .name(format!("task-{id}"))
        .spawn(move || {
            // Safety: `Scheduler::drop` joins every worker thread before
            // dropping its own fields, so `ptr` stays valid for this
            // closure's whole body.
            let scheduler = unsafe { ptr.get() };
            task_thread_main(scheduler, id);
        })
        .expect("scheduler: failed to spawn task thread");
    scheduler.task_threads[id as usize].common.set_spawned(handle);
    scheduler.set_active(id, true);
}

fn spawn_reactor_thread(scheduler: &Arc<Scheduler>, id: u32) {
    let ptr = SchedulerPtr(Arc::as_ptr(scheduler));
    let handle = std::thread::Builder::new()
        .name(format!("reactor-{id}"))
        .spawn(move || {
            // Safety: see `spawn_task_thread`.
            let scheduler = unsafe { ptr.get() };
            reactor_thread_main(scheduler, id);
        })
        .expect("scheduler: failed to spawn reactor thread");
    scheduler.reactor_threads[id as usize].common.set_spawned(handle);
}

// --- thread-local "currently running task fiber" context -----------------

/// Per-thread view of whichever task fiber (if any) is executing right now:
/// enough to suspend it (push onto the right queue, switch back to root)
/// and to know where it should eventually resume.
#[derive(Clone, Copy)]
struct CurrentFiber {
    fiber: *mut fiber::Fiber,
    root: *mut fiber::Fiber,
    api: FiberApi,
    /// The task thread this fiber was first created on; constant for the
    /// fiber's whole lifetime regardless of how many times it hops to a
    /// reactor and back.
    origin_task_thread: u32,
    /// Where this fiber should enqueue itself to suspend from whichever
    /// thread currently hosts it: a task thread's `stalled_tasks`, or a
    /// reactor's `finished_tasks`.
    handoff: *const Queue<ScheduledFiber, SCHEDULED_BLOCK>,
}

// Safety: a `CurrentFiber` is only ever read back on the same OS thread
// that set it (thread-local), never sent anywhere.
unsafe impl Send for CurrentFiber {}

thread_local! {
    static CURRENT: Cell<Option<CurrentFiber>> = const { Cell::new(None) };
}

fn set_current(cur: CurrentFiber) {
    CURRENT.with(|cell| cell.set(Some(cur)));
}

fn current() -> CurrentFiber {
    CURRENT
        .with(|cell| cell.get())
        .expect("scheduler: called from outside any task fiber")
}

pub(crate) fn in_task_fiber() -> bool {
    CURRENT.with(|cell| cell.get().is_some())
}

/// Suspends the currently running task fiber, routing it to `dest_thread_id`
/// (a task thread index for a yield or a fresh wait, or the task thread a
/// finished wait should return to).
fn suspend_to(dest_thread_id: u32) {
    let cur = current();
    // Safety: `cur.handoff` names the queue of whichever thread currently
    // hosts us; we are its only producer, since no other fiber runs on this
    // OS thread concurrently.
    unsafe {
        (*cur.handoff).push(ScheduledFiber {
            fiber: FiberPtr(cur.fiber),
            thread_id: dest_thread_id,
        });
        cur.api.switch(cur.fiber, cur.root);
    }
}

/// Cooperatively yields the currently running task fiber back to its
/// thread's dispatch loop, to be resumed after other ready work runs.
///
/// # Panics
///
/// Panics if called from outside a task fiber.
pub fn yield_now() {
    let origin = current().origin_task_thread;
    suspend_to(origin);
}

/// Implements [`TaskHandle::wait`]'s full suspend/resume protocol.
pub(crate) fn wait_for(scheduler: &Arc<Scheduler>, index: u32) {
    if scheduler.task_refs.is_completed(index) {
        return;
    }

    if !in_task_fiber() {
        spin_until_completed(scheduler, index);
        return;
    }

    if scheduler.reactor_threads.is_empty() {
        // No reactor to host the wait on; spin in place. Only this one
        // fiber's slot is paid for, not the whole OS thread.
        spin_until_completed(scheduler, index);
        return;
    }

    let reactor_index = scheduler.next_reactor.fetch_add(1, Ordering::Relaxed) % scheduler.reactor_threads.len() as u32;
    let dest = scheduler.task_threads.len() as u32 + reactor_index;
    suspend_to(dest);

    // Resumed on the reactor thread; `current()` now reflects its context.
    spin_until_completed(scheduler, index);

    let origin = current().origin_task_thread;
    suspend_to(origin);
    // Resumed back on the origin task thread.
}

fn spin_until_completed(scheduler: &Scheduler, index: u32) {
    while !scheduler.task_refs.is_completed(index) {
        std::hint::spin_loop();
    }
}

// --- task thread dispatch loop --------------------------------------------

struct TaskRootCtx {
    scheduler: *const Scheduler,
    index: u32,
    root: *mut fiber::Fiber,
    stack_pool: StackPool,
}

fn task_thread_main(scheduler: &Scheduler, index: u32) {
    let mut root_pool = StackPool::new(scheduler.root_stack_size);
    let root_stack = root_pool.acquire();

    let mut ctx = TaskRootCtx {
        scheduler: scheduler as *const Scheduler,
        index,
        root: std::ptr::null_mut(),
        stack_pool: StackPool::new(scheduler.task_stack_size),
    };

    // Safety: `root_stack` is exclusively owned by this thread for its
    // entire lifetime; `ctx` outlives the fiber (it lives on this frame,
    // which only returns after the fiber itself returns, below).
    let root = unsafe {
        scheduler
            .api
            .create(root_stack.as_ptr(), root_stack.len(), 0, task_root_entry, std::ptr::addr_of_mut!(ctx).cast())
    };
    ctx.root = root;
    scheduler.task_threads[index as usize].root.set(root);

    tracing::debug!(index, "scheduler: task thread starting");
    // Safety: `root` was just created and never entered.
    unsafe { scheduler.api.start(root) };
    tracing::debug!(index, "scheduler: task thread exiting");

    root_pool.release(root_stack);
}

unsafe extern "C" fn task_root_entry(user_data: *mut u8) {
    // Safety: `user_data` points at the live `TaskRootCtx` on
    // `task_thread_main`'s frame, which does not return until this function
    // does.
    unsafe {
        let ctx = &mut *user_data.cast::<TaskRootCtx>();
        let scheduler = &*ctx.scheduler;
        let thread = &scheduler.task_threads[ctx.index as usize];

        loop {
            drain_running(scheduler, thread, ctx.root);
            drain_awaiting(scheduler, thread, ctx.index, ctx.root, &mut ctx.stack_pool);

            if !scheduler.work_pump_lock().swap(true, Ordering::AcqRel) {
                pump::run(scheduler);
                scheduler.work_pump_lock().store(false, Ordering::Release);
            }

            if thread.tasks_awaiting_execution.is_empty() && thread.running_tasks.is_empty() {
                if !scheduler.running.load(Ordering::Acquire) || thread.common.stop.load(Ordering::Acquire) {
                    break;
                }
                thread.common.sleep();
            }
        }
    }
}

/// Resumes every fiber ready to continue on this thread: freshly routed
/// yields, and fibers returning from a reactor's wait.
///
/// # Safety
///
/// Must be called only from this thread's own root fiber.
unsafe fn drain_running(scheduler: &Scheduler, thread: &TaskThread, root: *mut fiber::Fiber) {
    // Safety: this thread is the sole consumer of `running_tasks`.
    while let Some(FiberPtr(fiber)) = unsafe { thread.running_tasks.try_pop() } {
        set_current(CurrentFiber {
            fiber,
            root,
            api: scheduler.api,
            origin_task_thread: thread.common.id,
            handoff: &thread.stalled_tasks,
        });
        // Safety: `fiber` came from this thread's own `running_tasks`,
        // populated only with live fibers meant to resume here.
        unsafe { scheduler.api.switch(root, fiber) };
    }
}

/// Starts every task newly assigned to this thread as a fresh fiber.
///
/// # Safety
///
/// Must be called only from this thread's own root fiber.
unsafe fn drain_awaiting(scheduler: &Scheduler, thread: &TaskThread, index: u32, root: *mut fiber::Fiber, stack_pool: &mut StackPool) {
    // Safety: this thread is the sole consumer of `tasks_awaiting_execution`.
    while let Some(task) = unsafe { thread.tasks_awaiting_execution.try_pop() } {
        let stack = stack_pool.acquire();
        let mut ctx = FiberTaskCtx {
            scheduler: scheduler as *const Scheduler,
            origin: index,
            root,
            fiber: std::ptr::null_mut(),
            stack_pool: stack_pool as *mut StackPool,
            stack: Some(stack),
            task: Some(task),
        };

        // Safety: `stack` was just acquired and is exclusively ours; `ctx`
        // lives on this frame until the fiber either returns or switches
        // away, both of which happen before this loop iteration's `switch`
        // call below returns.
        let fiber = unsafe {
            scheduler.api.create(
                ctx.stack.as_ref().unwrap().as_ptr(),
                ctx.stack.as_ref().unwrap().len(),
                0,
                fiber_task_entry,
                std::ptr::addr_of_mut!(ctx).cast(),
            )
        };
        ctx.fiber = fiber;

        set_current(CurrentFiber {
            fiber,
            root,
            api: scheduler.api,
            origin_task_thread: index,
            handoff: &thread.stalled_tasks,
        });
        // Safety: `fiber` was just created and never entered; `switch`
        // (rather than `start`) is used deliberately here, since `root` is
        // itself a real, already-entered fiber with valid context to save.
        unsafe { scheduler.api.switch(root, fiber) };
    }
}

struct FiberTaskCtx {
    scheduler: *const Scheduler,
    origin: u32,
    root: *mut fiber::Fiber,
    /// Filled in by `drain_awaiting` immediately after `create` returns,
    /// before the first switch into this fiber — mirrors `TaskRootCtx`'s
    /// `root` field, which has the same chicken-and-egg need.
    fiber: *mut fiber::Fiber,
    stack_pool: *mut StackPool,
    stack: Option<fiber::stack::Stack>,
    task: Option<Task>,
}

unsafe extern "C" fn fiber_task_entry(user_data: *mut u8) {
    // Safety: `user_data` points at the live `FiberTaskCtx` on
    // `drain_awaiting`'s frame, kept alive there until this fiber returns or
    // suspends.
    unsafe {
        let ctx = &mut *user_data.cast::<FiberTaskCtx>();
        let scheduler = &*ctx.scheduler;
        let this_fiber = ctx.fiber;
        let origin = ctx.origin;

        set_current(CurrentFiber {
            fiber: this_fiber,
            root: ctx.root,
            api: scheduler.api,
            origin_task_thread: origin,
            handoff: &scheduler.task_threads[origin as usize].stalled_tasks,
        });

        let task = ctx.task.take().expect("scheduler: fiber task context missing its task");
        task.run(&scheduler.task_refs);

        // The stack goes back to the pool before the final switch away;
        // nothing below touches it through `ctx.stack` again.
        let stack = ctx.stack.take().expect("scheduler: fiber task context missing its stack");
        (*ctx.stack_pool).release(stack);

        let thread = &scheduler.task_threads[origin as usize];
        thread.stalled_tasks.push(ScheduledFiber {
            fiber: FiberPtr(this_fiber),
            thread_id: origin,
        });
        scheduler.api.switch(this_fiber, ctx.root);
    }
}

// --- reactor thread dispatch loop -----------------------------------------

struct ReactorRootCtx {
    scheduler: *const Scheduler,
    index: u32,
    root: *mut fiber::Fiber,
}

fn reactor_thread_main(scheduler: &Scheduler, index: u32) {
    let mut root_pool = StackPool::new(scheduler.root_stack_size);
    let root_stack = root_pool.acquire();

    let mut ctx = ReactorRootCtx {
        scheduler: scheduler as *const Scheduler,
        index,
        root: std::ptr::null_mut(),
    };

    // Safety: see `task_thread_main`.
    let root = unsafe {
        scheduler
            .api
            .create(root_stack.as_ptr(), root_stack.len(), 0, reactor_root_entry, std::ptr::addr_of_mut!(ctx).cast())
    };
    ctx.root = root;
    scheduler.reactor_threads[index as usize].root.set(root);

    tracing::debug!(index, "scheduler: reactor thread starting");
    // Safety: `root` was just created and never entered.
    unsafe { scheduler.api.start(root) };
    tracing::debug!(index, "scheduler: reactor thread exiting");

    root_pool.release(root_stack);
}

unsafe extern "C" fn reactor_root_entry(user_data: *mut u8) {
    // Safety: `user_data` points at the live `ReactorRootCtx` on
    // `reactor_thread_main`'s frame, which does not return until this
    // function does.
    unsafe {
        let ctx = &*user_data.cast::<ReactorRootCtx>();
        let scheduler = &*ctx.scheduler;
        let thread = &scheduler.reactor_threads[ctx.index as usize];

        loop {
            while let Some(ScheduledFiber { fiber: FiberPtr(fiber), thread_id: origin }) = thread.running_tasks.try_pop() {
                set_current(CurrentFiber {
                    fiber,
                    root: ctx.root,
                    api: scheduler.api,
                    origin_task_thread: origin,
                    handoff: &thread.finished_tasks,
                });
                // Safety: `fiber` came from this reactor's own
                // `running_tasks`, populated only with live fibers that
                // perform their own blocking wait and then suspend.
                //
                // The fiber pushes itself onto `finished_tasks` as part of
                // its own suspend (see `suspend_to`) before switching back
                // here, so there is nothing left to enqueue once this
                // returns.
                scheduler.api.switch(ctx.root, fiber);
            }

            if thread.running_tasks.is_empty() {
                if !scheduler.running.load(Ordering::Acquire) {
                    break;
                }
                thread.common.sleep();
            }
        }
    }
}
