// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{Fiber, FiberFn};

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", not(windows)))] {
        mod x86_64;
        pub use x86_64::STACK_ALIGNMENT;
        pub(crate) use x86_64::api;
    } else if #[cfg(all(target_arch = "x86_64", windows))] {
        mod x86_64_windows;
        pub use x86_64_windows::STACK_ALIGNMENT;
        pub(crate) use x86_64_windows::api;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::STACK_ALIGNMENT;
        pub(crate) use aarch64::api;
    } else {
        compile_error!("Unsupported target architecture");
    }
}

/// Function-pointer triple returned by each backend's `api(abi_safe, fpu)`.
pub(crate) type ApiTriple = (
    unsafe fn(*mut u8, usize, usize, FiberFn, *mut u8) -> *mut Fiber,
    unsafe fn(*mut Fiber),
    unsafe fn(*mut Fiber, *mut Fiber),
);
