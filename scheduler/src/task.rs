// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task bodies and the reference-counted handle used to wait on completion.

use std::alloc::Layout;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::Scheduler;

/// A task's entry point, called once with the `user_data` it was created
/// with.
pub type TaskFn = unsafe extern "C" fn(*mut u8);

/// A task body queued for execution: an entry point, its argument, and an
/// optional shared [`TaskRefSlot`] index for callers that asked to wait on
/// completion.
///
/// Travels through the scheduler's internal SPSC queues, so it must be
/// `Send`: `user_data` either points at memory this `Task` owns (and frees
/// on completion) or at memory the caller guarantees outlives the task.
pub(crate) struct Task {
    pub(crate) func: TaskFn,
    pub(crate) user_data: *mut u8,
    /// `Some` if `user_data` was heap-allocated by [`Task::create`] and must
    /// be freed with this layout once the task body has run.
    pub(crate) layout: Option<Layout>,
    pub(crate) task_ref: Option<u32>,
}

// Safety: exactly one thread runs a given `Task`'s body, and `user_data`'s
// aliasing contract is established by whichever of `create`/`create_stack`
// produced it.
unsafe impl Send for Task {}

impl Task {
    /// Copies `size` bytes out of `user_data` into a freshly allocated,
    /// task-owned buffer (freed automatically once the task body returns).
    ///
    /// # Safety
    ///
    /// `user_data` must be valid for reads of `size` bytes.
    pub(crate) unsafe fn create(func: TaskFn, user_data: *const u8, size: usize, align: usize) -> Self {
        let align = if align == 0 { std::mem::align_of::<usize>() } else { align };
        let layout = Layout::from_size_align(size, align).expect("scheduler: invalid task argument layout");

        // Safety: `layout` has non-zero size guaranteed by callers that pass
        // a meaningful `size`; `alloc` is paired with `dealloc` using the
        // same layout once the task runs.
        let ptr = unsafe {
            let ptr = std::alloc::alloc(layout);
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            ptr::copy_nonoverlapping(user_data, ptr, size);
            ptr
        };

        Task {
            func,
            user_data: ptr,
            layout: Some(layout),
            task_ref: None,
        }
    }

    /// Wraps `user_data` without copying it; the caller is responsible for
    /// keeping it alive until the task has run.
    pub(crate) fn create_stack(func: TaskFn, user_data: *mut u8) -> Self {
        Task {
            func,
            user_data,
            layout: None,
            task_ref: None,
        }
    }

    /// Runs the task body, frees owned `user_data`, and resolves the
    /// associated `TaskRef` slot (if any).
    ///
    /// # Safety
    ///
    /// Must be called at most once per `Task`, from the thread that is
    /// meant to execute it.
    pub(crate) unsafe fn run(self, slab: &TaskRefSlab) {
        // Safety: `func`/`user_data` were paired by `create`/`create_stack`.
        unsafe {
            (self.func)(self.user_data);
        }

        if let Some(layout) = self.layout {
            // Safety: `self.user_data` was allocated with this exact layout
            // by `create` and is not read again after `func` returns.
            unsafe {
                std::alloc::dealloc(self.user_data, layout);
            }
        }

        if let Some(index) = self.task_ref {
            slab.mark_completed(index);
        }
    }
}

/// Entry point used by [`Scheduler::spawn`]'s closure-boxing convenience.
///
/// # Safety
///
/// `user_data` must be a `Box<F>::into_raw` pointer.
pub(crate) unsafe extern "C" fn run_boxed_closure<F: FnOnce() + Send>(user_data: *mut u8) {
    // Safety: forwarded by caller.
    unsafe {
        let boxed = Box::from_raw(user_data.cast::<F>());
        boxed();
    }
}

struct TaskRefSlot {
    /// Number of live [`TaskHandle`]s referencing this slot.
    refs: AtomicU32,
    completed: AtomicBool,
}

impl TaskRefSlot {
    fn new() -> Self {
        Self {
            refs: AtomicU32::new(1),
            completed: AtomicBool::new(false),
        }
    }

    fn reset(&self) {
        self.refs.store(1, Ordering::Relaxed);
        self.completed.store(false, Ordering::Relaxed);
    }

    fn retain(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `true` if this was the last outstanding reference.
    fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

struct SlabInner {
    pages: Vec<Box<[TaskRefSlot]>>,
    free: Vec<u32>,
}

impl SlabInner {
    const INITIAL_PAGE_LEN: u32 = 64;

    fn new() -> Self {
        let page: Box<[TaskRefSlot]> = (0..Self::INITIAL_PAGE_LEN).map(|_| TaskRefSlot::new()).collect();
        let free = (0..Self::INITIAL_PAGE_LEN).rev().collect();
        Self {
            pages: vec![page],
            free,
        }
    }

    fn total_len(&self) -> u32 {
        self.pages.iter().map(|page| page.len() as u32).sum()
    }

    /// Appends a new page, doubling the slab's total capacity.
    fn grow(&mut self) {
        let base = self.total_len();
        let new_len = self.pages.last().expect("slab always has at least one page").len() as u32;
        let page: Box<[TaskRefSlot]> = (0..new_len).map(|_| TaskRefSlot::new()).collect();
        self.pages.push(page);
        self.free.extend((base..base + new_len).rev());
    }

    fn slot(&self, index: u32) -> &TaskRefSlot {
        let mut remaining = index;
        for page in &self.pages {
            let len = page.len() as u32;
            if remaining < len {
                return &page[remaining as usize];
            }
            remaining -= len;
        }
        unreachable!("scheduler: task ref slab index {index} out of range")
    }
}

/// A growable slab of reference-counted "has this task finished yet" slots.
///
/// Pages are appended, never removed or moved, so once a slot is handed out
/// its address is stable for the slab's whole lifetime — readers only need
/// to hold the lock long enough to look the index up.
pub(crate) struct TaskRefSlab {
    inner: Mutex<SlabInner>,
}

impl TaskRefSlab {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SlabInner::new()),
        }
    }

    pub(crate) fn alloc(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        if inner.free.is_empty() {
            inner.grow();
            tracing::debug!(total = inner.total_len(), "scheduler: task ref slab grew");
        }
        let index = inner.free.pop().expect("just grew if it was empty");
        inner.slot(index).reset();
        index
    }

    fn free(&self, index: u32) {
        self.inner.lock().unwrap().free.push(index);
    }

    fn with_slot<R>(&self, index: u32, f: impl FnOnce(&TaskRefSlot) -> R) -> R {
        let inner = self.inner.lock().unwrap();
        f(inner.slot(index))
    }

    pub(crate) fn mark_completed(&self, index: u32) {
        self.with_slot(index, |slot| slot.completed.store(true, Ordering::Release));
    }

    pub(crate) fn is_completed(&self, index: u32) -> bool {
        self.with_slot(index, |slot| slot.completed.load(Ordering::Acquire))
    }

    fn retain(&self, index: u32) {
        self.with_slot(index, TaskRefSlot::retain);
    }

    fn release(&self, index: u32) -> bool {
        self.with_slot(index, TaskRefSlot::release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_resets_a_recycled_slot() {
        let slab = TaskRefSlab::new();
        let a = slab.alloc();
        slab.mark_completed(a);
        assert!(slab.is_completed(a));
        slab.release(a);
        slab.free(a);

        let b = slab.alloc();
        assert_eq!(a, b, "free list is LIFO, so the just-freed slot is reused");
        assert!(!slab.is_completed(b));
    }

    #[test]
    fn grows_past_the_initial_page() {
        let slab = TaskRefSlab::new();
        let indices: Vec<u32> = (0..SlabInner::INITIAL_PAGE_LEN + 1).map(|_| slab.alloc()).collect();
        assert_eq!(indices.len(), indices.iter().collect::<std::collections::HashSet<_>>().len());
        for index in indices {
            assert!(!slab.is_completed(index));
        }
    }

    #[test]
    fn ref_counting_tracks_the_last_release() {
        let slab = TaskRefSlab::new();
        let index = slab.alloc();
        slab.retain(index);
        assert!(!slab.release(index), "two refs outstanding, one release isn't the last");
        assert!(slab.release(index), "second release is the last");
    }
}

/// An opaque, cloneable handle to a previously created task, obtained from
/// [`Scheduler::create_task`], [`Scheduler::create_task_stack`], or
/// [`Scheduler::spawn`].
///
/// Dropping every clone of a `TaskHandle` for a finished task frees its slab
/// slot; dropping the last handle for a task that has not yet run does not
/// cancel it, the task still runs to completion.
pub struct TaskHandle {
    scheduler: Arc<Scheduler>,
    index: u32,
}

impl TaskHandle {
    pub(crate) fn new(scheduler: Arc<Scheduler>, index: u32) -> Self {
        Self { scheduler, index }
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Blocks until the task has run to completion.
    ///
    /// If called from inside a task fiber (the common case — one task
    /// waiting on another it just spawned), this parks the calling fiber on
    /// a reactor thread instead of blocking the OS thread underneath it, so
    /// the task thread stays free to run other work (see
    /// [`crate::scheduler::wait_for`]). Called from outside any task fiber
    /// (e.g. the thread that built the `Scheduler`), it instead busy-waits
    /// the calling OS thread — acceptable since that is necessarily off the
    /// scheduler's hot path.
    pub fn wait(self) {
        crate::scheduler::wait_for(&self.scheduler, self.index);
    }
}

impl Clone for TaskHandle {
    fn clone(&self) -> Self {
        self.scheduler.task_refs.retain(self.index);
        Self {
            scheduler: self.scheduler.clone(),
            index: self.index,
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if self.scheduler.task_refs.release(self.index) {
            self.scheduler.task_refs.free(self.index);
        }
    }
}
