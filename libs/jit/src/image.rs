// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Memory for one loaded module: a single contiguous reservation divided
//! into an executable section, a read-only section, and a read-write
//! section, each a page-aligned bump allocator. The image is committed
//! read-write for loading, flipped to its final permissions exactly once,
//! and decommitted (never released) on teardown.

use crate::mmap::{Mmap, host_page_size};
use crate::unwind::EhFrameRegistration;
use crate::fatal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Code,
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Default)]
struct Section {
    /// Image-relative byte offset of the section start.
    base: usize,
    num_pages: usize,
    num_committed_bytes: usize,
}

#[derive(Debug)]
pub struct ImageMemory {
    mmap: Mmap,
    page_size: usize,
    finalized: bool,

    code: Section,
    read_only: Section,
    read_write: Section,

    eh_frames: Option<EhFrameRegistration>,
}

impl ImageMemory {
    /// Reserves one contiguous read-write image large enough for the three
    /// sections, in the order code, read-only, read-write.
    pub fn reserve(
        num_code_bytes: usize,
        code_alignment: usize,
        num_read_only_bytes: usize,
        read_only_alignment: usize,
        num_read_write_bytes: usize,
        read_write_alignment: usize,
    ) -> Self {
        let page_size = host_page_size();
        debug_assert!(code_alignment <= page_size);
        debug_assert!(read_only_alignment <= page_size);
        debug_assert!(read_write_alignment <= page_size);

        let mut num_code_bytes = num_code_bytes;
        if cfg!(all(windows, target_arch = "x86_64")) {
            // Leave room for the exception trampoline at the end of the
            // code section.
            num_code_bytes += 32;
        }

        let code_pages = num_code_bytes.div_ceil(page_size);
        let read_only_pages = num_read_only_bytes.div_ceil(page_size);
        let read_write_pages = num_read_write_bytes.div_ceil(page_size);
        let total_pages = code_pages + read_only_pages + read_write_pages;

        let mmap = if total_pages == 0 {
            Mmap::new_empty()
        } else {
            let reserved = Mmap::reserve(total_pages * page_size).and_then(|mut mmap| {
                mmap.commit()?;
                Ok(mmap)
            });
            match reserved {
                Ok(mmap) => mmap,
                Err(err) => fatal!("memory allocation for JIT code failed: {err}"),
            }
        };

        let code_base = 0;
        let read_only_base = code_base + code_pages * page_size;
        let read_write_base = read_only_base + read_only_pages * page_size;

        Self {
            mmap,
            page_size,
            finalized: false,
            code: Section {
                base: code_base,
                num_pages: code_pages,
                num_committed_bytes: 0,
            },
            read_only: Section {
                base: read_only_base,
                num_pages: read_only_pages,
                num_committed_bytes: 0,
            },
            read_write: Section {
                base: read_write_base,
                num_pages: read_write_pages,
                num_committed_bytes: 0,
            },
            eh_frames: None,
        }
    }

    /// Places `num_bytes` at the lowest suitably-aligned uncommitted byte
    /// of the section and returns its image-relative offset.
    pub fn allocate(&mut self, kind: SectionKind, num_bytes: usize, alignment: usize) -> usize {
        assert!(alignment.is_power_of_two());
        assert!(!self.finalized, "allocation in a finalized image");

        let page_size = self.page_size;
        let section = self.section_mut(kind);
        let offset_in_section = align_up(section.num_committed_bytes, alignment);
        section.num_committed_bytes = offset_in_section + align_up(num_bytes, alignment);

        if section.num_committed_bytes > section.num_pages * page_size {
            fatal!("didn't reserve enough space in section");
        }

        section.base + offset_in_section
    }

    /// Applies the final page permissions and invalidates the instruction
    /// cache. One-shot.
    pub fn finalize(&mut self) {
        debug_assert!(!self.finalized);
        self.finalized = true;

        if self.mmap.is_empty() {
            return;
        }

        if self.code.num_pages > 0 {
            let range = self.code.base..self.code.base + self.code.num_pages * self.page_size;
            if let Err(err) = self.mmap.make_executable(range) {
                fatal!("failed to make code section executable: {err}");
            }
        }
        if self.read_only.num_pages > 0 {
            let range = self.read_only.base
                ..self.read_only.base + self.read_only.num_pages * self.page_size;
            if let Err(err) = self.mmap.make_readonly(range) {
                fatal!("failed to make read-only section read-only: {err}");
            }
        }
        if self.read_write.num_pages > 0 {
            let range = self.read_write.base
                ..self.read_write.base + self.read_write.num_pages * self.page_size;
            if let Err(err) = self.mmap.make_readwrite(range) {
                fatal!("failed to protect read-write section: {err}");
            }
        }

        invalidate_icache(self.mmap.as_ptr(), self.mmap.len());
    }

    /// Records the unwind-frame range and registers it with the OS
    /// unwinder.
    pub fn register_eh_frames(&mut self, addr: usize, num_bytes: usize) {
        debug_assert!(self.eh_frames.is_none());
        self.eh_frames = Some(EhFrameRegistration::register(
            self.base_addr(),
            addr,
            num_bytes,
        ));
    }

    /// Idempotent; does nothing if frames were never registered.
    pub fn deregister_eh_frames(&mut self) {
        self.eh_frames = None;
    }

    #[inline]
    pub fn base_addr(&self) -> usize {
        self.mmap.as_ptr() as usize
    }

    /// Total size of the image in bytes.
    #[inline]
    pub fn num_bytes(&self) -> usize {
        self.mmap.len()
    }

    /// First address past the image; the module registry's key.
    #[inline]
    pub fn end_addr(&self) -> usize {
        self.base_addr() + self.num_bytes()
    }

    /// # Safety
    ///
    /// The range must not be concurrently read or executed; only valid
    /// before [`ImageMemory::finalize`].
    pub(crate) unsafe fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(!self.finalized);
        unsafe { self.mmap.slice_mut(offset..offset + len) }
    }

    fn section_mut(&mut self, kind: SectionKind) -> &mut Section {
        match kind {
            SectionKind::Code => &mut self.code,
            SectionKind::ReadOnly => &mut self.read_only,
            SectionKind::ReadWrite => &mut self.read_write,
        }
    }
}

impl Drop for ImageMemory {
    fn drop(&mut self) {
        self.deregister_eh_frames();

        // Decommit the image pages, but leave them reserved to catch any
        // references to them that might erroneously remain.
        if let Err(err) = self.mmap.decommit() {
            tracing::error!("failed to decommit image memory: {err}");
        }
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

fn invalidate_icache(start: *const u8, len: usize) {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "x86"))] {
            // Instruction fetch is coherent with the data cache; the
            // permission flip already serialized the stores.
            let _ = (start, len);
        } else {
            unsafe extern "C" {
                fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
            }
            // Safety: the range is a valid mapping owned by this image.
            unsafe { __clear_cache(start.cast_mut().cast(), start.add(len).cast_mut().cast()) }
        }
    }
}
