//! Support for stackful fibers and the context-switch engine that underpins
//! the `scheduler` crate.
//!
//! A [`Fiber`] is a suspended execution context living on its own stack. Its
//! control block is embedded at the high-address end of that stack (see
//! [`stack`]), and switching between fibers is a handful of register
//! save/restore instructions implemented in `arch` for each supported ABI.
//!
//! This crate is heavily inspired by `fiber` in k23, which is itself based on
//! [`corosensei`]; the main difference is the calling convention: instead of
//! an asymmetric `Yielder::suspend` that can only return to whichever context
//! last resumed it, any two `Fiber`s can [`FiberApi::switch`] directly
//! between each other, matching the needs of a scheduler that moves fibers
//! between worker threads.
//!
//! [`corosensei`]: https://github.com/Amanieu/corosensei

#![feature(naked_functions)]

mod arch;
pub mod stack;

use core::fmt;

/// Sentinel written below a freshly created fiber's stack head. Verified by
/// [`FiberApi::start`] before the fiber's first entry.
pub const STACK_START_PLACEHOLDER: usize = 0xBAAD_F00D_DEAD_BEEF;

/// Feature toggles for the context-switch engine.
///
/// Exactly one combination of these is selected at runtime via [`get_api`];
/// the resulting [`FiberApi`] never branches on them again, each combination
/// corresponds to a distinct, monomorphic set of switch routines.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Options(u32);

impl Options {
    pub const NONE: Self = Self(0);
    /// Save and restore the OS ABI's thread-local stack-unwinding metadata
    /// (the Thread Information Block fields, on Windows) on every switch.
    /// Has no effect on targets without such metadata.
    pub const OS_ABI_SAFE: Self = Self(1 << 0);
    /// Save and restore the FPU control/status word (MXCSR on x86-64, FPCR
    /// on aarch64) on every switch.
    pub const PRESERVE_FPU_CONTROL: Self = Self(1 << 1);

    const VALID_BITS: u32 = Self::OS_ABI_SAFE.0 | Self::PRESERVE_FPU_CONTROL.0;

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    const fn is_known(self) -> bool {
        self.0 & !Self::VALID_BITS == 0
    }
}

impl core::ops::BitOr for Options {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        if self.contains(Self::OS_ABI_SAFE) {
            list.entry(&"OS_ABI_SAFE");
        }
        if self.contains(Self::PRESERVE_FPU_CONTROL) {
            list.entry(&"PRESERVE_FPU_CONTROL");
        }
        list.finish()
    }
}

/// A suspended fiber. Opaque; its control block lives at the top of its own
/// stack (see [`stack`]).
#[repr(C)]
pub struct Fiber {
    sp: usize,
}

/// Entry point for a freshly created fiber: called with the `user_data`
/// pointer passed to [`FiberApi::create`].
pub type FiberFn = unsafe extern "C" fn(*mut u8);

/// Three entry points selected by [`get_api`] for one [`Options`] combination.
///
/// Function-pointer fields rather than a trait object: every call site using
/// a `FiberApi` is then a direct (non-virtual) call, keeping the switch hot
/// path free of vtable indirection.
#[derive(Clone, Copy)]
pub struct FiberApi {
    create_fn: unsafe fn(*mut u8, usize, usize, FiberFn, *mut u8) -> *mut Fiber,
    start_fn: unsafe fn(*mut Fiber),
    switch_fn: unsafe fn(*mut Fiber, *mut Fiber),
}

/// Returns the [`FiberApi`] implementing the given feature combination.
///
/// # Panics
///
/// Panics if `options` contains bits outside of [`Options::OS_ABI_SAFE`] /
/// [`Options::PRESERVE_FPU_CONTROL`] — this mirrors the original's
/// `sanity(0 && "Unknown options")` abort.
#[must_use]
pub fn get_api(options: Options) -> FiberApi {
    assert!(
        options.is_known(),
        "fiber: unknown option combination {options:?}"
    );

    let (create_fn, start_fn, switch_fn) = arch::api(
        options.contains(Options::OS_ABI_SAFE),
        options.contains(Options::PRESERVE_FPU_CONTROL),
    );

    tracing::trace!(?options, "fiber: selected context-switch backend");

    FiberApi {
        create_fn,
        start_fn,
        switch_fn,
    }
}

/// Returns `stackHead` for a fiber: the address of its embedded control
/// block, reinterpreted as a `usize` cursor into the stack. The first-entry
/// sentinel lives at `stack_head(fiber) - 1`.
///
/// # Safety
///
/// `fiber` must point at a valid, live [`Fiber`].
unsafe fn stack_head(fiber: *mut Fiber) -> *mut usize {
    fiber as *mut usize
}

/// Places a fresh [`Fiber`]'s control block at the top of `[stack, stack +
/// stack_size)`, 16-byte aligned, and returns `(fiber, head)` where `head`
/// is that same address as a `usize` cursor (see [`stack_head`]).
///
/// # Safety
///
/// `stack` must be valid for writes across the whole region.
pub(crate) unsafe fn layout_stack(stack: *mut u8, stack_size: usize) -> (*mut Fiber, *mut usize) {
    // Safety: ensured by caller
    unsafe {
        let top = (stack as usize + stack_size) & !(arch::STACK_ALIGNMENT - 1);
        let fiber = top as *mut Fiber;
        (fiber, fiber as *mut usize)
    }
}

impl FiberApi {
    /// Builds the initial stack image for a fresh fiber poised to enter
    /// `entry(user_data)` on first [`Self::start`]/[`Self::switch`].
    ///
    /// `stack` points at the lowest address of a `stack_size`-byte region of
    /// which the top `committed_size` bytes are read/write (the rest is
    /// assumed reserved-but-unused by the caller); `committed_size == 0`
    /// means the whole region is committed.
    ///
    /// # Safety
    ///
    /// `stack` must point at a region of at least `stack_size` bytes, valid
    /// for writes across the whole committed tail, and must outlive the
    /// returned fiber.
    #[inline]
    pub unsafe fn create(
        &self,
        stack: *mut u8,
        stack_size: usize,
        committed_size: usize,
        entry: FiberFn,
        user_data: *mut u8,
    ) -> *mut Fiber {
        // Safety: ensured by caller
        unsafe { (self.create_fn)(stack, stack_size, committed_size, entry, user_data) }
    }

    /// Enters `to` for the first time. Requires `to`'s first-entry sentinel
    /// to still be intact.
    ///
    /// # Safety
    ///
    /// `to` must be a fiber that was created by this API and never resumed.
    #[inline]
    pub unsafe fn start(&self, to: *mut Fiber) {
        // Safety: ensured by caller
        unsafe {
            let head = stack_head(to);
            assert_eq!(
                *head.sub(1),
                STACK_START_PLACEHOLDER,
                "fiber: first-entry sentinel missing, fiber already started or corrupted"
            );
            (self.start_fn)(to);
        }
    }

    /// Saves the calling context into `cur`, then restores and jumps into
    /// `to`. Propagates `cur`'s return-frame pointer to `to` so that if `to`
    /// ever returns normally, control lands back on the caller of whatever
    /// last entered `cur`.
    ///
    /// # Safety
    ///
    /// `cur` must be the context currently executing; `to` must be a live,
    /// suspended fiber created by this API (or previously started).
    #[inline]
    pub unsafe fn switch(&self, cur: *mut Fiber, to: *mut Fiber) {
        // Safety: ensured by caller
        unsafe {
            let to_head = stack_head(to);
            let cur_head = stack_head(cur);
            *to_head.sub(1) = *cur_head.sub(1);
            (self.switch_fn)(cur, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe extern "C" fn count_and_return(user_data: *mut u8) {
        // Safety: `user_data` points at a live `AtomicUsize` for the
        // duration of this call.
        unsafe {
            let counter = &*(user_data as *const AtomicUsize);
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn create_and_run_to_completion() {
        let api = get_api(Options::NONE);
        let mut pool = StackPool::new(64 * 1024);
        let stack = pool.acquire();
        let counter = AtomicUsize::new(0);

        // Safety: `stack` outlives the fiber; the fiber is entered exactly
        // once and runs to completion without suspending.
        unsafe {
            let fiber = api.create(
                stack.as_ptr(),
                stack.len(),
                0,
                count_and_return,
                std::ptr::addr_of!(counter) as *mut u8,
            );
            api.start(fiber);
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.release(stack);
        pool.release_all();
    }

    #[test]
    #[should_panic(expected = "unknown option combination")]
    fn unknown_options_panics() {
        let bogus = Options(1 << 31);
        let _ = get_api(bogus);
    }

    /// Shared state for [`four_fiber_round_robin`]: a root fiber (playing
    /// the role `scheduler`'s task-thread dispatch loop does) and four
    /// worker fibers it switches directly into, mirroring
    /// `scheduler::scheduler::drain_awaiting`'s "`switch`, not `start`,
    /// since `root` is itself a real, already-entered fiber" pattern.
    struct RoundRobin {
        api: FiberApi,
        order: AtomicUsize,
        root: *mut Fiber,
        workers: [*mut Fiber; 4],
    }

    struct WorkerArg {
        ring: *const RoundRobin,
        index: usize,
        seen_first: AtomicUsize,
        seen_second: AtomicUsize,
    }

    unsafe extern "C" fn worker_entry(user_data: *mut u8) {
        // Safety: `user_data` points at a live `WorkerArg` for the duration
        // of this call.
        unsafe {
            let arg = &*(user_data as *const WorkerArg);
            let ring = &*arg.ring;
            let seen = [&arg.seen_first, &arg.seen_second];
            // Two passes around the ring: the first entered fresh by root,
            // the second resuming each worker right where it suspended
            // itself handing off to the next one. Both passes use the same
            // hand-off rule, so this worker is resumed, not re-entered, on
            // the second.
            for slot in seen {
                slot.store(ring.order.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
                if arg.index + 1 < ring.workers.len() {
                    ring.api.switch(ring.workers[arg.index], ring.workers[arg.index + 1]);
                } else {
                    ring.api.switch(ring.workers[arg.index], ring.root);
                }
            }
        }
    }

    unsafe extern "C" fn root_entry(user_data: *mut u8) {
        // Safety: `user_data` points at a live `RoundRobin` for the
        // duration of this call; every worker fiber named in it was just
        // created and never entered.
        unsafe {
            let ring = &*(user_data as *const RoundRobin);
            ring.api.switch(ring.root, ring.workers[0]); // first pass around the ring
            ring.api.switch(ring.root, ring.workers[0]); // second pass
        }
    }

    /// Four fibers hop directly between one another in a ring, each
    /// suspending mid-body and later being resumed rather than just entered
    /// once and run to completion — the resume path `load_context` takes on
    /// a context `store_context` previously suspended, which
    /// `create_and_run_to_completion` above never reaches.
    #[test]
    fn four_fiber_round_robin() {
        let api = get_api(Options::NONE);
        let mut pool = StackPool::new(64 * 1024);
        let root_stack = pool.acquire();
        let worker_stacks: Vec<_> = (0..4).map(|_| pool.acquire()).collect();

        let mut ring = RoundRobin {
            api,
            order: AtomicUsize::new(0),
            root: std::ptr::null_mut(),
            workers: [std::ptr::null_mut(); 4],
        };

        let mut args: Vec<Box<WorkerArg>> = (0..4)
            .map(|index| {
                Box::new(WorkerArg {
                    ring: std::ptr::addr_of!(ring),
                    index,
                    seen_first: AtomicUsize::new(usize::MAX),
                    seen_second: AtomicUsize::new(usize::MAX),
                })
            })
            .collect();

        // Safety: every stack outlives the fiber created on it; every `arg`
        // outlives the worker fiber it was created with; `ring` outlives
        // `root`, which is the only fiber that reads it directly.
        unsafe {
            for i in 0..4 {
                ring.workers[i] = api.create(
                    worker_stacks[i].as_ptr(),
                    worker_stacks[i].len(),
                    0,
                    worker_entry,
                    std::ptr::addr_of_mut!(*args[i]).cast(),
                );
            }
            ring.root = api.create(root_stack.as_ptr(), root_stack.len(), 0, root_entry, std::ptr::addr_of_mut!(ring).cast());

            api.start(ring.root);
        }

        for (i, arg) in args.iter().enumerate() {
            assert_eq!(arg.seen_first.load(Ordering::SeqCst), i, "worker {i} ran out of order on the first pass");
            assert_eq!(arg.seen_second.load(Ordering::SeqCst), 4 + i, "worker {i} did not resume correctly on the second pass");
        }

        pool.release(root_stack);
        for stack in worker_stacks {
            pool.release(stack);
        }
        pool.release_all();
    }
}
