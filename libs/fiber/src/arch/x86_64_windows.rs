// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Microsoft x64 ABI backend.
//!
//! Callee-saved GP registers are `rbx`, `rbp`, `rdi`, `rsi`, `r12`-`r15`; the
//! non-volatile XMM registers `xmm6`-`xmm15` are always saved regardless of
//! `PRESERVE_FPU_CONTROL` (that flag only adds the MXCSR control word).
//! `OS_ABI_SAFE` additionally swaps the two stack-bounds fields of the
//! current fiber's `NT_TIB` (`StackBase`/`StackLimit`, at `gs:[0x08]` and
//! `gs:[0x10]`) so SEH stack-overflow probing sees the fiber's own stack
//! while it runs. All four combinations get their own monomorphic routine
//! set, mirroring the original per-option template specializations.

use crate::arch::ApiTriple;
use crate::{Fiber, FiberFn, STACK_START_PLACEHOLDER, layout_stack};
use core::arch::naked_asm;

pub(crate) const STACK_ALIGNMENT: usize = 16;

const GP_REGS: usize = 8; // rbx, rbp, rdi, rsi, r12, r13, r14, r15
const GP_SIZE: usize = GP_REGS * 8;
const XMM_REGS: usize = 10; // xmm6..=xmm15
const XMM_SIZE: usize = XMM_REGS * 16;
const TIB_SLOT_SIZE: usize = 16; // StackBase, StackLimit
const FPU_SLOT_SIZE: usize = 16; // MXCSR, padded
const INIT_FUNC_CALL_SIZE: usize = 3 * 8;

const fn init_frame_size(abi_safe: bool, fpu: bool) -> usize {
    GP_SIZE
        + XMM_SIZE
        + if abi_safe { TIB_SLOT_SIZE } else { 0 }
        + if fpu { FPU_SLOT_SIZE } else { 0 }
        + INIT_FUNC_CALL_SIZE
}

pub(crate) fn api(abi_safe: bool, fpu: bool) -> ApiTriple {
    match (abi_safe, fpu) {
        (false, false) => (create_00, start_00, switch_00),
        (true, false) => (create_abi, start_abi, switch_abi),
        (false, true) => (create_fpu, start_fpu, switch_fpu),
        (true, true) => (create_both, start_both, switch_both),
    }
}

unsafe fn create_impl(
    stack: *mut u8,
    stack_size: usize,
    entry: FiberFn,
    user_data: *mut u8,
    abi_safe: bool,
    fpu: bool,
    trampoline: usize,
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
        *cursor = trampoline;
        // Mirrors `store_*`'s push order exactly (GP first, then MXCSR, then
        // XMM, then the TIB fields last), so the lowest address — final `sp`
        // — is always whichever block `store_*` pushed last.
        for _ in 0..GP_REGS {
            cursor = cursor.sub(1);
            *cursor = 0;
        }
        if fpu {
            cursor = cursor.sub(FPU_SLOT_SIZE / size_of::<usize>());
            *cursor = 0x1F80;
        }
        for _ in 0..(XMM_SIZE / size_of::<usize>()) {
            cursor = cursor.sub(1);
            *cursor = 0;
        }
        if abi_safe {
            cursor = cursor.sub(TIB_SLOT_SIZE / size_of::<usize>());
            // StackBase, StackLimit: filled in lazily on first switch, since
            // the values depend on the committed range of `stack`, which
            // the stack pool (not this backend) owns.
            *cursor = 0;
            *cursor.add(1) = 0;
        }

        debug_assert_eq!(
            (head as usize) - (cursor as usize),
            size_of::<usize>() + init_frame_size(abi_safe, fpu),
            "fiber: init stack layout miscomputed"
        );

        (*fiber).sp = cursor as usize;
        fiber
    }
}

macro_rules! define_variant {
    ($suffix:ident, $abi_safe:expr, $fpu:expr, $store:ident, $load:ident, $end:ident, $tramp:ident, $create:ident, $start:ident, $switch:ident) => {
        unsafe fn $create(
            stack: *mut u8,
            stack_size: usize,
            _committed_size: usize,
            entry: FiberFn,
            user_data: *mut u8,
        ) -> *mut Fiber {
            // Safety: forwarded
            unsafe {
                create_impl(
                    stack,
                    stack_size,
                    entry,
                    user_data,
                    $abi_safe,
                    $fpu,
                    $tramp as usize,
                )
            }
        }

        #[unsafe(naked)]
        unsafe extern "C" fn $start(to: *mut Fiber) {
            naked_asm!(
                "call {store}",
                "mov rax, [rcx]",
                "mov [rax + {frame}], rsp",
                "mov rsp, rax",
                "jmp {load}",
                store = sym $store,
                load = sym $load,
                // `init_frame_size` is exactly the distance from `to->sp`
                // back up to the sentinel/return-pointer slot at `head - 1`.
                frame = const init_frame_size($abi_safe, $fpu),
            );
        }

        #[unsafe(naked)]
        unsafe extern "C" fn $switch(cur: *mut Fiber, to: *mut Fiber) {
            naked_asm!(
                "call {store}",
                "mov [rcx], rsp",
                "mov rsp, [rdx]",
                "jmp {load}",
                store = sym $store,
                load = sym $load,
            );
        }
    };
}

// ---- (abi_safe = false, fpu = false) ----

#[unsafe(naked)]
unsafe extern "C" fn store_00() {
    naked_asm!(
        "pop rax",
        "push rbx", "push rbp", "push rdi", "push rsi",
        "push r12", "push r13", "push r14", "push r15",
        "sub rsp, {xmm}",
        "movdqu [rsp + 0*16], xmm6",  "movdqu [rsp + 1*16], xmm7",
        "movdqu [rsp + 2*16], xmm8",  "movdqu [rsp + 3*16], xmm9",
        "movdqu [rsp + 4*16], xmm10", "movdqu [rsp + 5*16], xmm11",
        "movdqu [rsp + 6*16], xmm12", "movdqu [rsp + 7*16], xmm13",
        "movdqu [rsp + 8*16], xmm14", "movdqu [rsp + 9*16], xmm15",
        "jmp rax",
        xmm = const XMM_SIZE,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn load_00() -> ! {
    naked_asm!(
        "movdqu xmm6, [rsp + 0*16]",  "movdqu xmm7, [rsp + 1*16]",
        "movdqu xmm8, [rsp + 2*16]",  "movdqu xmm9, [rsp + 3*16]",
        "movdqu xmm10, [rsp + 4*16]", "movdqu xmm11, [rsp + 5*16]",
        "movdqu xmm12, [rsp + 6*16]", "movdqu xmm13, [rsp + 7*16]",
        "movdqu xmm14, [rsp + 8*16]", "movdqu xmm15, [rsp + 9*16]",
        "add rsp, {xmm}",
        "pop r15", "pop r14", "pop r13", "pop r12",
        "pop rsi", "pop rdi", "pop rbp", "pop rbx",
        "ret",
        xmm = const XMM_SIZE,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn end_00() -> ! {
    naked_asm!("pop rsp", "jmp {load}", load = sym load_00);
}

#[unsafe(naked)]
unsafe extern "C" fn trampoline_00() -> ! {
    naked_asm!(
        "pop rcx",
        "pop rax",
        // 32 bytes of shadow space plus one word of padding: `rsp` is
        // odd-word aligned here, and the Microsoft x64 ABI requires it
        // 16-byte aligned at `call`. Undone symmetrically before falling
        // into `end`.
        "sub rsp, 40",
        "call rax",
        "add rsp, 40",
        "jmp {end}",
        end = sym end_00,
    );
}

define_variant!(
    _00, false, false, store_00, load_00, end_00, trampoline_00, create_00, start_00, switch_00
);

// ---- (abi_safe = true, fpu = false) ----

#[unsafe(naked)]
unsafe extern "C" fn store_abi() {
    naked_asm!(
        "pop rax",
        "push rbx", "push rbp", "push rdi", "push rsi",
        "push r12", "push r13", "push r14", "push r15",
        "sub rsp, {xmm}",
        "movdqu [rsp + 0*16], xmm6",  "movdqu [rsp + 1*16], xmm7",
        "movdqu [rsp + 2*16], xmm8",  "movdqu [rsp + 3*16], xmm9",
        "movdqu [rsp + 4*16], xmm10", "movdqu [rsp + 5*16], xmm11",
        "movdqu [rsp + 6*16], xmm12", "movdqu [rsp + 7*16], xmm13",
        "movdqu [rsp + 8*16], xmm14", "movdqu [rsp + 9*16], xmm15",
        "mov r10, gs:[0x08]",
        "push r10", // StackBase
        "mov r10, gs:[0x10]",
        "push r10", // StackLimit
        "jmp rax",
        xmm = const XMM_SIZE,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn load_abi() -> ! {
    naked_asm!(
        "pop rax", // StackLimit
        "mov gs:[0x10], rax",
        "pop rax", // StackBase
        "mov gs:[0x08], rax",
        "movdqu xmm6, [rsp + 0*16]",  "movdqu xmm7, [rsp + 1*16]",
        "movdqu xmm8, [rsp + 2*16]",  "movdqu xmm9, [rsp + 3*16]",
        "movdqu xmm10, [rsp + 4*16]", "movdqu xmm11, [rsp + 5*16]",
        "movdqu xmm12, [rsp + 6*16]", "movdqu xmm13, [rsp + 7*16]",
        "movdqu xmm14, [rsp + 8*16]", "movdqu xmm15, [rsp + 9*16]",
        "add rsp, {xmm}",
        "pop r15", "pop r14", "pop r13", "pop r12",
        "pop rsi", "pop rdi", "pop rbp", "pop rbx",
        "ret",
        xmm = const XMM_SIZE,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn end_abi() -> ! {
    naked_asm!("pop rsp", "jmp {load}", load = sym load_abi);
}

#[unsafe(naked)]
unsafe extern "C" fn trampoline_abi() -> ! {
    naked_asm!(
        "pop rcx",
        "pop rax",
        "sub rsp, 40",
        "call rax",
        "add rsp, 40",
        "jmp {end}",
        end = sym end_abi,
    );
}

define_variant!(
    _abi, true, false, store_abi, load_abi, end_abi, trampoline_abi, create_abi, start_abi,
    switch_abi
);

// ---- (abi_safe = false, fpu = true) ----

#[unsafe(naked)]
unsafe extern "C" fn store_fpu() {
    naked_asm!(
        "pop rax",
        "push rbx", "push rbp", "push rdi", "push rsi",
        "push r12", "push r13", "push r14", "push r15",
        "sub rsp, 16",
        "stmxcsr [rsp]",
        "sub rsp, {xmm}",
        "movdqu [rsp + 0*16], xmm6",  "movdqu [rsp + 1*16], xmm7",
        "movdqu [rsp + 2*16], xmm8",  "movdqu [rsp + 3*16], xmm9",
        "movdqu [rsp + 4*16], xmm10", "movdqu [rsp + 5*16], xmm11",
        "movdqu [rsp + 6*16], xmm12", "movdqu [rsp + 7*16], xmm13",
        "movdqu [rsp + 8*16], xmm14", "movdqu [rsp + 9*16], xmm15",
        "jmp rax",
        xmm = const XMM_SIZE,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn load_fpu() -> ! {
    naked_asm!(
        "movdqu xmm6, [rsp + 0*16]",  "movdqu xmm7, [rsp + 1*16]",
        "movdqu xmm8, [rsp + 2*16]",  "movdqu xmm9, [rsp + 3*16]",
        "movdqu xmm10, [rsp + 4*16]", "movdqu xmm11, [rsp + 5*16]",
        "movdqu xmm12, [rsp + 6*16]", "movdqu xmm13, [rsp + 7*16]",
        "movdqu xmm14, [rsp + 8*16]", "movdqu xmm15, [rsp + 9*16]",
        "add rsp, {xmm}",
        "ldmxcsr [rsp]",
        "add rsp, 16",
        "pop r15", "pop r14", "pop r13", "pop r12",
        "pop rsi", "pop rdi", "pop rbp", "pop rbx",
        "ret",
        xmm = const XMM_SIZE,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn end_fpu() -> ! {
    naked_asm!("pop rsp", "jmp {load}", load = sym load_fpu);
}

#[unsafe(naked)]
unsafe extern "C" fn trampoline_fpu() -> ! {
    naked_asm!(
        "pop rcx",
        "pop rax",
        "sub rsp, 40",
        "call rax",
        "add rsp, 40",
        "jmp {end}",
        end = sym end_fpu,
    );
}

define_variant!(
    _fpu, false, true, store_fpu, load_fpu, end_fpu, trampoline_fpu, create_fpu, start_fpu,
    switch_fpu
);

// ---- (abi_safe = true, fpu = true) ----

#[unsafe(naked)]
unsafe extern "C" fn store_both() {
    naked_asm!(
        "pop rax",
        "push rbx", "push rbp", "push rdi", "push rsi",
        "push r12", "push r13", "push r14", "push r15",
        "sub rsp, 16",
        "stmxcsr [rsp]",
        "sub rsp, {xmm}",
        "movdqu [rsp + 0*16], xmm6",  "movdqu [rsp + 1*16], xmm7",
        "movdqu [rsp + 2*16], xmm8",  "movdqu [rsp + 3*16], xmm9",
        "movdqu [rsp + 4*16], xmm10", "movdqu [rsp + 5*16], xmm11",
        "movdqu [rsp + 6*16], xmm12", "movdqu [rsp + 7*16], xmm13",
        "movdqu [rsp + 8*16], xmm14", "movdqu [rsp + 9*16], xmm15",
        "mov r10, gs:[0x08]",
        "push r10",
        "mov r10, gs:[0x10]",
        "push r10",
        "jmp rax",
        xmm = const XMM_SIZE,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn load_both() -> ! {
    naked_asm!(
        "pop rax",
        "mov gs:[0x10], rax",
        "pop rax",
        "mov gs:[0x08], rax",
        "movdqu xmm6, [rsp + 0*16]",  "movdqu xmm7, [rsp + 1*16]",
        "movdqu xmm8, [rsp + 2*16]",  "movdqu xmm9, [rsp + 3*16]",
        "movdqu xmm10, [rsp + 4*16]", "movdqu xmm11, [rsp + 5*16]",
        "movdqu xmm12, [rsp + 6*16]", "movdqu xmm13, [rsp + 7*16]",
        "movdqu xmm14, [rsp + 8*16]", "movdqu xmm15, [rsp + 9*16]",
        "add rsp, {xmm}",
        "ldmxcsr [rsp]",
        "add rsp, 16",
        "pop r15", "pop r14", "pop r13", "pop r12",
        "pop rsi", "pop rdi", "pop rbp", "pop rbx",
        "ret",
        xmm = const XMM_SIZE,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn end_both() -> ! {
    naked_asm!("pop rsp", "jmp {load}", load = sym load_both);
}

#[unsafe(naked)]
unsafe extern "C" fn trampoline_both() -> ! {
    naked_asm!(
        "pop rcx",
        "pop rax",
        "sub rsp, 40",
        "call rax",
        "add rsp, 40",
        "jmp {end}",
        end = sym end_both,
    );
}

define_variant!(
    _both, true, true, store_both, load_both, end_both, trampoline_both, create_both, start_both,
    switch_both
);
