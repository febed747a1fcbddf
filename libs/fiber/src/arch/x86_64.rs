// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! System V AMD64 ABI backend (Linux, macOS, the BSDs).
//!
//! Callee-saved registers here are `rbp`, `rbx`, `r12`-`r15`; there is no
//! Thread Information Block on this ABI, so `OS_ABI_SAFE` has nothing to do
//! and is ignored — both function triples below serve it. `PRESERVE_FPU_CONTROL`
//! additionally saves/restores MXCSR.

use crate::arch::ApiTriple;
use crate::{Fiber, FiberFn, STACK_START_PLACEHOLDER, layout_stack};
use core::arch::naked_asm;

pub(crate) const STACK_ALIGNMENT: usize = 16;

/// Callee-saved GP registers pushed by `store_context`: rbp, rbx, r12-r15.
const GP_REGS: usize = 6;
const PUSH_SIZE: usize = GP_REGS * 8;
/// MXCSR only needs 4 bytes; keep a 16-byte aligned slot for it.
const FPU_SLOT_SIZE: usize = 16;
/// `entry`, `user_data`, and the address of `init_fiber_trampoline`.
const INIT_FUNC_CALL_SIZE: usize = 3 * 8;

const fn init_frame_size(fpu: bool) -> usize {
    PUSH_SIZE + if fpu { FPU_SLOT_SIZE } else { 0 } + INIT_FUNC_CALL_SIZE
}

pub(crate) fn api(_abi_safe: bool, fpu: bool) -> ApiTriple {
    if fpu {
        (create_fpu, start_fpu, switch_fpu)
    } else {
        (create_basic, start_basic, switch_basic)
    }
}

/// Builds the initial stack image, identical between variants save for the
/// MXCSR slot.
///
/// # Safety
///
/// `stack` must be valid for writes across `stack_size` bytes.
unsafe fn create_impl(
    stack: *mut u8,
    stack_size: usize,
    entry: FiberFn,
    user_data: *mut u8,
    fpu: bool,
) -> *mut Fiber {
    // Safety: ensured by caller
    unsafe {
        let (fiber, head) = layout_stack(stack, stack_size);
        *head.sub(1) = STACK_START_PLACEHOLDER;

        let mut cursor = head.sub(1);
        cursor = cursor.sub(1);
        *cursor = entry as usize;
        cursor = cursor.sub(1);
        *cursor = user_data as usize;
        cursor = cursor.sub(1);
        *cursor = if fpu {
            init_fiber_trampoline_fpu as usize
        } else {
            init_fiber_trampoline_basic as usize
        };
        // GP block first, MXCSR last: mirrors `store_context_fpu`, which
        // pushes the GP regs before carving out the MXCSR slot, so the
        // lowest address (final `sp`) is always the one `load_context`
        // reads first.
        for _ in 0..GP_REGS {
            cursor = cursor.sub(1);
            *cursor = 0;
        }
        if fpu {
            cursor = cursor.sub(FPU_SLOT_SIZE / size_of::<usize>());
            *cursor = 0x1F80; // default MXCSR: all exceptions masked
        }

        debug_assert_eq!(
            (head as usize) - (cursor as usize),
            size_of::<usize>() + init_frame_size(fpu),
            "fiber: init stack layout miscomputed"
        );

        (*fiber).sp = cursor as usize;
        fiber
    }
}

unsafe fn create_basic(
    stack: *mut u8,
    stack_size: usize,
    _committed_size: usize,
    entry: FiberFn,
    user_data: *mut u8,
) -> *mut Fiber {
    // Safety: forwarded
    unsafe { create_impl(stack, stack_size, entry, user_data, false) }
}

unsafe fn create_fpu(
    stack: *mut u8,
    stack_size: usize,
    _committed_size: usize,
    entry: FiberFn,
    user_data: *mut u8,
) -> *mut Fiber {
    // Safety: forwarded
    unsafe { create_impl(stack, stack_size, entry, user_data, true) }
}

// Reached via `ret` from `load_context`, never `call`ed: both variants are
// `#[naked]` so they fall straight into the matching `end_fiber` once
// `entry` returns, with no prologue/epilogue to get in the way. The
// trampoline's own address, `user_data`, then `entry` were pushed in that
// order (high to low) by `create_impl`, so `rsp` points at `user_data`
// first and `entry` just above it.
#[unsafe(naked)]
unsafe extern "C" fn init_fiber_trampoline_basic() -> ! {
    naked_asm!(
        "pop rdi", // user_data
        "pop rax", // entry
        // `rsp` is odd-word aligned here (one word below `entry`/`user_data`'s
        // natural parity relative to the stack head), so pad by one word to
        // give `call` the 16-byte-aligned `rsp` System V requires; undone
        // symmetrically before falling into `end_fiber`.
        "sub rsp, 8",
        "call rax",
        "add rsp, 8",
        "jmp {end}",
        end = sym end_fiber_basic,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn init_fiber_trampoline_fpu() -> ! {
    naked_asm!(
        "pop rdi",
        "pop rax",
        "sub rsp, 8",
        "call rax",
        "add rsp, 8",
        "jmp {end}",
        end = sym end_fiber_fpu,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn store_context_basic() {
    naked_asm!(
        "pop rax",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "jmp rax",
    );
}

#[unsafe(naked)]
unsafe extern "C" fn store_context_fpu() {
    naked_asm!(
        "pop rax",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 16",
        "stmxcsr [rsp]",
        "jmp rax",
    );
}

#[unsafe(naked)]
unsafe extern "C" fn load_context_basic() -> ! {
    naked_asm!(
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

#[unsafe(naked)]
unsafe extern "C" fn load_context_fpu() -> ! {
    naked_asm!(
        "ldmxcsr [rsp]",
        "add rsp, 16",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// Reached when a fiber's entry function returns normally. `rsp` is exactly
/// where `store_context` left it on whichever thread last `start`ed or
/// `switch`ed into this fiber; popping the saved frame pointer off of it and
/// falling into `load_context` unwinds straight back to that call site.
#[unsafe(naked)]
unsafe extern "C" fn end_fiber_basic() -> ! {
    naked_asm!(
        "pop rsp",
        "jmp {load}",
        load = sym load_context_basic,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn end_fiber_fpu() -> ! {
    naked_asm!(
        "pop rsp",
        "jmp {load}",
        load = sym load_context_fpu,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn start_basic(to: *mut Fiber) {
    naked_asm!(
        "call {store}",
        "mov rax, [rdi]",             // to->sp, the raw initial stack pointer
        "mov [rax + {frame}], rsp",   // stash caller rsp at the sentinel slot
        "mov rsp, rax",
        "jmp {load}",
        store = sym store_context_basic,
        load = sym load_context_basic,
        // `init_frame_size` is exactly the distance from `to->sp` back up to
        // the sentinel/return-pointer slot at `head - 1`.
        frame = const init_frame_size(false),
    );
}

#[unsafe(naked)]
unsafe extern "C" fn start_fpu(to: *mut Fiber) {
    naked_asm!(
        "call {store}",
        "mov rax, [rdi]",
        "mov [rax + {frame}], rsp",
        "mov rsp, rax",
        "jmp {load}",
        store = sym store_context_fpu,
        load = sym load_context_fpu,
        frame = const init_frame_size(true),
    );
}

#[unsafe(naked)]
unsafe extern "C" fn switch_basic(cur: *mut Fiber, to: *mut Fiber) {
    naked_asm!(
        "call {store}",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "jmp {load}",
        store = sym store_context_basic,
        load = sym load_context_basic,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn switch_fpu(cur: *mut Fiber, to: *mut Fiber) {
    naked_asm!(
        "call {store}",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "jmp {load}",
        store = sym store_context_fpu,
        load = sym load_context_fpu,
    );
}

