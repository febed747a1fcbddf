// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::ptr;

/// Reserves `size` bytes (rounded up to whole pages) plus one leading guard
/// page via `mmap(PROT_NONE)`, then `mprotect`s everything past the guard
/// page read/write. Returns `(ptr, len, guard_len)` where `ptr` points at the
/// guard page, `len` includes it, and `guard_len` is the guard page's size —
/// `[ptr, ptr + guard_len)` is not accessible.
///
/// # Safety
///
/// `size` must be non-zero.
pub(super) unsafe fn allocate(size: usize) -> io::Result<(*mut u8, usize, usize)> {
    let page_size = page_size();
    let len = size
        .checked_add(page_size - 1)
        .expect("integer overflow while calculating stack size")
        & !(page_size - 1);
    let len = len + page_size; // guard page

    cfg_if::cfg_if! {
        if #[cfg(target_os = "openbsd")] {
            let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
        } else {
            let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
        }
    }

    // Safety: forwarded by caller; `len` is a valid mmap length.
    unsafe {
        let base = libc::mmap(ptr::null_mut(), len, libc::PROT_NONE, map_flags, -1, 0);
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        if libc::mprotect(
            base.cast::<u8>().add(page_size).cast(),
            len - page_size,
            libc::PROT_READ | libc::PROT_WRITE,
        ) != 0
        {
            let err = io::Error::last_os_error();
            libc::munmap(base, len);
            return Err(err);
        }

        Ok((base.cast(), len, page_size))
    }
}

/// # Safety
///
/// `ptr`/`len` must be the exact pair returned by a prior [`allocate`] call.
pub(super) unsafe fn deallocate(ptr: *mut u8, len: usize) {
    // Safety: forwarded by caller.
    unsafe {
        let ret = libc::munmap(ptr.cast(), len);
        debug_assert_eq!(ret, 0);
    }
}

fn page_size() -> usize {
    // Safety: `sysconf` with `_SC_PAGESIZE` is always safe to call.
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}
