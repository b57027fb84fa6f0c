// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A type that owns one anonymous memory mapped region and exposes methods
//! for managing its permissions. A region starts as an inaccessible
//! reservation, is committed read-write, and can later be flipped
//! per-page-range to its final permissions or decommitted without giving
//! the address range back to the OS.

use core::ops::Range;
use core::ptr::NonNull;
use core::slice;

use bitflags::bitflags;

use crate::Result;

bitflags! {
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct Permissions: u8 {
        /// Allow reads from the memory region
        const READ = 1 << 0;
        /// Allow writes to the memory region
        const WRITE = 1 << 1;
        /// Allow code execution from the memory region
        const EXECUTE = 1 << 2;
    }
}

#[derive(Debug)]
pub struct Mmap {
    memory: NonNull<[u8]>,
    decommitted: bool,
}

// Safety: the region is exclusively owned and all permission changes go
// through `&self` OS calls that are thread-safe.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    pub fn new_empty() -> Self {
        Self {
            memory: NonNull::slice_from_raw_parts(NonNull::dangling(), 0),
            decommitted: false,
        }
    }

    /// Reserves `len` bytes of address space without committing any of it.
    pub fn reserve(len: usize) -> Result<Self> {
        assert!(len > 0);
        assert_eq!(len % host_page_size(), 0);

        let ptr = sys::reserve(len)?;
        let memory = NonNull::slice_from_raw_parts(NonNull::new(ptr).unwrap(), len);
        Ok(Self {
            memory,
            decommitted: false,
        })
    }

    /// Commits the whole reservation with read-write access.
    pub fn commit(&mut self) -> Result<()> {
        sys::commit(self.as_ptr() as *mut u8, self.len())
    }

    /// Applies `permissions` to a page-aligned sub-range.
    pub fn protect(&self, range: Range<usize>, permissions: Permissions) -> Result<()> {
        assert!(range.start <= self.len() && range.end <= self.len());
        assert_eq!(
            range.start % host_page_size(),
            0,
            "changing of protections isn't page-aligned",
        );

        let len = range.end.checked_sub(range.start).unwrap();
        // Safety: the range is checked against the mapping above.
        unsafe { sys::protect(self.as_ptr().add(range.start) as *mut u8, len, permissions) }
    }

    pub fn make_executable(&self, range: Range<usize>) -> Result<()> {
        self.protect(range, Permissions::READ | Permissions::EXECUTE)
    }

    pub fn make_readonly(&self, range: Range<usize>) -> Result<()> {
        self.protect(range, Permissions::READ)
    }

    pub fn make_readwrite(&self, range: Range<usize>) -> Result<()> {
        self.protect(range, Permissions::READ | Permissions::WRITE)
    }

    /// Releases the committed pages but keeps the address range claimed, so
    /// stale pointers into the region fault instead of aliasing a mapping
    /// made later.
    pub fn decommit(&mut self) -> Result<()> {
        if self.is_empty() || self.decommitted {
            return Ok(());
        }
        self.decommitted = true;
        sys::decommit(self.as_ptr() as *mut u8, self.len())
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.memory.as_ptr() as *const u8
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.memory.as_ptr().cast()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// The range must be committed with write access and not concurrently
    /// read or executed.
    pub unsafe fn slice_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        assert!(range.end <= self.len());
        let len = range.end.checked_sub(range.start).unwrap();
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr().add(range.start), len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if self.is_empty() || self.decommitted {
            // A decommitted region is deliberately left reserved.
            return;
        }
        // Safety: the mapping is owned and no references to it remain.
        unsafe { sys::release(self.memory.as_ptr().cast(), self.len()) }
    }
}

pub fn host_page_size() -> usize {
    let page_size = sys::page_size();
    assert!(page_size.is_power_of_two());
    page_size
}

#[cfg(unix)]
mod sys {
    use core::ptr;

    use anyhow::Context;
    use rustix::mm::{Advice, MapFlags, MprotectFlags, ProtFlags};

    use super::Permissions;
    use crate::Result;

    pub fn page_size() -> usize {
        rustix::param::page_size()
    }

    pub fn reserve(len: usize) -> Result<*mut u8> {
        // Safety: a null hint lets the kernel pick the placement.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                len,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )
        }
        .context("mmap failed")?;
        Ok(ptr.cast())
    }

    pub fn commit(ptr: *mut u8, len: usize) -> Result<()> {
        // Safety: `ptr..ptr + len` is the reservation made above.
        unsafe {
            rustix::mm::mprotect(
                ptr.cast(),
                len,
                MprotectFlags::READ | MprotectFlags::WRITE,
            )
        }
        .context("mprotect failed")?;
        Ok(())
    }

    pub unsafe fn protect(ptr: *mut u8, len: usize, permissions: Permissions) -> Result<()> {
        let mut flags = MprotectFlags::empty();
        flags.set(MprotectFlags::READ, permissions.contains(Permissions::READ));
        flags.set(
            MprotectFlags::WRITE,
            permissions.contains(Permissions::WRITE),
        );
        flags.set(
            MprotectFlags::EXEC,
            permissions.contains(Permissions::EXECUTE),
        );
        // Safety: caller upholds that the range lies inside the mapping.
        unsafe { rustix::mm::mprotect(ptr.cast(), len, flags) }.context("mprotect failed")?;
        Ok(())
    }

    pub fn decommit(ptr: *mut u8, len: usize) -> Result<()> {
        // Return the backing pages, then revoke access; the range stays
        // claimed so stale pointers into it fault.
        // Safety: the range is the owned mapping.
        unsafe {
            rustix::mm::madvise(ptr.cast(), len, Advice::DontNeed).context("madvise failed")?;
            rustix::mm::mprotect(ptr.cast(), len, MprotectFlags::empty())
                .context("mprotect failed")?;
        }
        Ok(())
    }

    pub unsafe fn release(ptr: *mut u8, len: usize) {
        // Safety: caller upholds that the mapping is owned and unreferenced.
        unsafe { rustix::mm::munmap(ptr.cast(), len) }.expect("munmap failed");
    }
}

#[cfg(windows)]
mod sys {
    use core::ffi::c_void;
    use core::ptr;

    use super::Permissions;
    use crate::Result;

    const MEM_COMMIT: u32 = 0x1000;
    const MEM_RESERVE: u32 = 0x2000;
    const MEM_DECOMMIT: u32 = 0x4000;
    const MEM_RELEASE: u32 = 0x8000;
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READONLY: u32 = 0x02;
    const PAGE_READWRITE: u32 = 0x04;
    const PAGE_EXECUTE: u32 = 0x10;
    const PAGE_EXECUTE_READ: u32 = 0x20;
    const PAGE_EXECUTE_READWRITE: u32 = 0x40;

    #[repr(C)]
    struct SystemInfo {
        processor_arch: u32,
        page_size: u32,
        rest: [usize; 8],
    }

    unsafe extern "system" {
        fn VirtualAlloc(addr: *mut c_void, size: usize, kind: u32, protect: u32) -> *mut c_void;
        fn VirtualProtect(addr: *mut c_void, size: usize, protect: u32, old: *mut u32) -> i32;
        fn VirtualFree(addr: *mut c_void, size: usize, kind: u32) -> i32;
        fn GetSystemInfo(info: *mut SystemInfo);
    }

    pub fn page_size() -> usize {
        let mut info = SystemInfo {
            processor_arch: 0,
            page_size: 0,
            rest: [0; 8],
        };
        unsafe { GetSystemInfo(&mut info) };
        info.page_size as usize
    }

    fn page_protection(permissions: Permissions) -> u32 {
        let read = permissions.contains(Permissions::READ);
        let write = permissions.contains(Permissions::WRITE);
        let execute = permissions.contains(Permissions::EXECUTE);
        match (read, write, execute) {
            (false, false, false) => PAGE_NOACCESS,
            (true, false, false) => PAGE_READONLY,
            (_, true, false) => PAGE_READWRITE,
            (true, false, true) => PAGE_EXECUTE_READ,
            (_, true, true) => PAGE_EXECUTE_READWRITE,
            (false, false, true) => PAGE_EXECUTE,
        }
    }

    pub fn reserve(len: usize) -> Result<*mut u8> {
        let ptr =
            unsafe { VirtualAlloc(ptr::null_mut(), len, MEM_RESERVE, PAGE_NOACCESS) };
        if ptr.is_null() {
            anyhow::bail!("VirtualAlloc failed to reserve {len} bytes");
        }
        Ok(ptr.cast())
    }

    pub fn commit(ptr: *mut u8, len: usize) -> Result<()> {
        let committed = unsafe { VirtualAlloc(ptr.cast(), len, MEM_COMMIT, PAGE_READWRITE) };
        if committed.is_null() {
            anyhow::bail!("VirtualAlloc failed to commit {len} bytes");
        }
        Ok(())
    }

    pub unsafe fn protect(ptr: *mut u8, len: usize, permissions: Permissions) -> Result<()> {
        let mut old = 0;
        let ok =
            unsafe { VirtualProtect(ptr.cast(), len, page_protection(permissions), &mut old) };
        if ok == 0 {
            anyhow::bail!("VirtualProtect failed");
        }
        Ok(())
    }

    pub fn decommit(ptr: *mut u8, len: usize) -> Result<()> {
        let ok = unsafe { VirtualFree(ptr.cast(), len, MEM_DECOMMIT) };
        if ok == 0 {
            anyhow::bail!("VirtualFree failed to decommit");
        }
        Ok(())
    }

    pub unsafe fn release(ptr: *mut u8, _len: usize) {
        let ok = unsafe { VirtualFree(ptr.cast(), 0, MEM_RELEASE) };
        debug_assert_ne!(ok, 0, "VirtualFree failed");
    }
}
