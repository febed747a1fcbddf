// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::ptr;
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_GUARD, PAGE_READWRITE, VirtualAlloc, VirtualFree,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Reserves the whole region with `VirtualAlloc(MEM_RESERVE)`, then commits
/// everything past a leading guard page. Returns `(ptr, len, guard_len)`
/// where `ptr` points at the guard page, `len` includes it, and `guard_len`
/// is the guard page's size — `[ptr, ptr + guard_len)` must not be touched.
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

    // Safety: forwarded by caller.
    unsafe {
        let base = VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_READWRITE);
        if base.is_null() {
            return Err(io::Error::last_os_error());
        }

        let committed_base = base.cast::<u8>().add(page_size);
        if VirtualAlloc(
            committed_base.cast(),
            len - page_size,
            MEM_COMMIT,
            PAGE_READWRITE,
        )
        .is_null()
        {
            let err = io::Error::last_os_error();
            VirtualFree(base, 0, MEM_RELEASE);
            return Err(err);
        }

        if VirtualAlloc(base, page_size, MEM_COMMIT, PAGE_READWRITE | PAGE_GUARD).is_null() {
            let err = io::Error::last_os_error();
            VirtualFree(base, 0, MEM_RELEASE);
            return Err(err);
        }

        Ok((base.cast(), len, page_size))
    }
}

/// # Safety
///
/// `ptr` must be the base returned by a prior [`allocate`] call; `len` is
/// unused (`VirtualFree(MEM_RELEASE)` always releases the whole reservation).
pub(super) unsafe fn deallocate(ptr: *mut u8, _len: usize) {
    // Safety: forwarded by caller.
    unsafe {
        let ret = VirtualFree(ptr.cast(), 0, MEM_RELEASE);
        debug_assert!(ret != 0);
    }
}

fn page_size() -> usize {
    // Safety: always safe to call.
    unsafe {
        let mut sysinfo: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut sysinfo);
        assert!(sysinfo.dwPageSize.is_power_of_two());
        sysinfo.dwPageSize as usize
    }
}
