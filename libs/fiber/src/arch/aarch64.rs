// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! AArch64 (AAPCS64) backend.
//!
//! Callee-saved registers are `x19`-`x28`, the frame pointer `x29`, the link
//! register `x30`, and `d8`-`d15`. There is no Thread Information Block
//! equivalent on this target, so `OS_ABI_SAFE` has no effect here, just as it
//! has none on x86-64 System V. `PRESERVE_FPU_CONTROL` additionally saves
//! `fpcr`/`fpsr`.
//!
//! Unlike the x86-64 backends, `store_context`/`load_context` don't need the
//! pop-then-jump trick to avoid clobbering the return address: `bl` leaves
//! it in `x30`, which is itself one of the registers this engine treats as
//! callee-saved, so a plain `ret` at the end of `store_context` already goes
//! back to the caller, and the `x30` slot restored by `load_context` is what
//! carries a fresh fiber into its trampoline on first entry.

use crate::arch::ApiTriple;
use crate::{Fiber, FiberFn, STACK_START_PLACEHOLDER, layout_stack};
use core::arch::naked_asm;

pub(crate) const STACK_ALIGNMENT: usize = 16;

/// x19-x28 (5 pairs) plus x29/x30 (1 pair).
const GP_SIZE: usize = 12 * 8;
/// d8-d15, always saved.
const FP_SIZE: usize = 8 * 8;
const FPU_SLOT_SIZE: usize = 16; // fpcr, fpsr
const INIT_FUNC_CALL_SIZE: usize = 2 * 8; // entry, user_data

const fn init_frame_size(fpu: bool) -> usize {
    GP_SIZE + FP_SIZE + if fpu { FPU_SLOT_SIZE } else { 0 } + INIT_FUNC_CALL_SIZE
}

pub(crate) fn api(_abi_safe: bool, fpu: bool) -> ApiTriple {
    if fpu {
        (create_fpu, start_fpu, switch_fpu)
    } else {
        (create_basic, start_basic, switch_basic)
    }
}

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

        // x19..x28, zeroed.
        for _ in 0..10 {
            cursor = cursor.sub(1);
            *cursor = 0;
        }
        // `ldp x29, x30, [sp]` loads x29 from the lower address of the pair
        // and x30 from the higher one, so x30 (the trampoline address) is
        // written first/higher, x29 (zeroed) second/lower.
        cursor = cursor.sub(1);
        *cursor = if fpu {
            trampoline_fpu as usize
        } else {
            trampoline_basic as usize
        };
        cursor = cursor.sub(1);
        *cursor = 0; // x29
        // d8..d15, zeroed.
        for _ in 0..8 {
            cursor = cursor.sub(1);
            *cursor = 0;
        }
        if fpu {
            // `ldp x9, x10, [sp]` then `msr fpcr, x9; msr fpsr, x10`: x9
            // (fpcr) from the lower address, x10 (fpsr) from the higher one.
            cursor = cursor.sub(1);
            *cursor = 0; // fpsr
            cursor = cursor.sub(1);
            *cursor = 0; // fpcr
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

#[unsafe(naked)]
unsafe extern "C" fn store_context_basic() {
    naked_asm!(
        "stp x19, x20, [sp, #-16]!",
        "stp x21, x22, [sp, #-16]!",
        "stp x23, x24, [sp, #-16]!",
        "stp x25, x26, [sp, #-16]!",
        "stp x27, x28, [sp, #-16]!",
        "stp x29, x30, [sp, #-16]!",
        "stp d8,  d9,  [sp, #-16]!",
        "stp d10, d11, [sp, #-16]!",
        "stp d12, d13, [sp, #-16]!",
        "stp d14, d15, [sp, #-16]!",
        "ret",
    );
}

#[unsafe(naked)]
unsafe extern "C" fn store_context_fpu() {
    naked_asm!(
        "stp x19, x20, [sp, #-16]!",
        "stp x21, x22, [sp, #-16]!",
        "stp x23, x24, [sp, #-16]!",
        "stp x25, x26, [sp, #-16]!",
        "stp x27, x28, [sp, #-16]!",
        "stp x29, x30, [sp, #-16]!",
        "stp d8,  d9,  [sp, #-16]!",
        "stp d10, d11, [sp, #-16]!",
        "stp d12, d13, [sp, #-16]!",
        "stp d14, d15, [sp, #-16]!",
        "mrs x9, fpcr",
        "mrs x10, fpsr",
        "stp x9, x10, [sp, #-16]!",
        "ret",
    );
}

#[unsafe(naked)]
unsafe extern "C" fn load_context_basic() -> ! {
    naked_asm!(
        "ldp d14, d15, [sp], #16",
        "ldp d12, d13, [sp], #16",
        "ldp d10, d11, [sp], #16",
        "ldp d8,  d9,  [sp], #16",
        "ldp x29, x30, [sp], #16",
        "ldp x27, x28, [sp], #16",
        "ldp x25, x26, [sp], #16",
        "ldp x23, x24, [sp], #16",
        "ldp x21, x22, [sp], #16",
        "ldp x19, x20, [sp], #16",
        "ret",
    );
}

#[unsafe(naked)]
unsafe extern "C" fn load_context_fpu() -> ! {
    naked_asm!(
        "ldp x9, x10, [sp], #16",
        "msr fpcr, x9",
        "msr fpsr, x10",
        "ldp d14, d15, [sp], #16",
        "ldp d12, d13, [sp], #16",
        "ldp d10, d11, [sp], #16",
        "ldp d8,  d9,  [sp], #16",
        "ldp x29, x30, [sp], #16",
        "ldp x27, x28, [sp], #16",
        "ldp x25, x26, [sp], #16",
        "ldp x23, x24, [sp], #16",
        "ldp x21, x22, [sp], #16",
        "ldp x19, x20, [sp], #16",
        "ret",
    );
}

/// Reached when a fiber's entry function returns normally; `sp` is exactly
/// where `store_context` left it on whichever thread last `start`ed or
/// `switch`ed into this fiber.
#[unsafe(naked)]
unsafe extern "C" fn end_fiber_basic() -> ! {
    naked_asm!(
        "ldr x9, [sp]",
        "mov sp, x9",
        "b {load}",
        load = sym load_context_basic,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn end_fiber_fpu() -> ! {
    naked_asm!(
        "ldr x9, [sp]",
        "mov sp, x9",
        "b {load}",
        load = sym load_context_fpu,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn trampoline_basic() -> ! {
    naked_asm!(
        "ldr x0, [sp], #8", // user_data
        "ldr x9, [sp], #8", // entry
        "blr x9",
        "b {end}",
        end = sym end_fiber_basic,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn trampoline_fpu() -> ! {
    naked_asm!(
        "ldr x0, [sp], #8",
        "ldr x9, [sp], #8",
        "blr x9",
        "b {end}",
        end = sym end_fiber_fpu,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn start_basic(to: *mut Fiber) {
    naked_asm!(
        "bl {store}",
        "ldr x9, [x0]",       // to->sp, the raw initial stack pointer
        "str sp, [x9, {frame}]", // stash caller sp at the sentinel slot
        "mov sp, x9",
        "b {load}",
        store = sym store_context_basic,
        load = sym load_context_basic,
        frame = const init_frame_size(false),
    );
}

#[unsafe(naked)]
unsafe extern "C" fn start_fpu(to: *mut Fiber) {
    naked_asm!(
        "bl {store}",
        "ldr x9, [x0]",
        "str sp, [x9, {frame}]",
        "mov sp, x9",
        "b {load}",
        store = sym store_context_fpu,
        load = sym load_context_fpu,
        frame = const init_frame_size(true),
    );
}

#[unsafe(naked)]
unsafe extern "C" fn switch_basic(cur: *mut Fiber, to: *mut Fiber) {
    naked_asm!(
        "bl {store}",
        "str sp, [x0]",
        "ldr sp, [x1]",
        "b {load}",
        store = sym store_context_basic,
        load = sym load_context_basic,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn switch_fpu(cur: *mut Fiber, to: *mut Fiber) {
    naked_asm!(
        "bl {store}",
        "str sp, [x0]",
        "ldr sp, [x1]",
        "b {load}",
        store = sym store_context_fpu,
        load = sym load_context_fpu,
    );
}
