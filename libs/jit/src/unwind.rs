// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Registration of a loaded image's unwind metadata with the OS unwinder.
//! ELF and Mach-O images carry an `.eh_frame` section; COFF images carry a
//! function table of `.pdata` entries. Deregistration happens when the
//! registration guard drops and is therefore idempotent.

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        use core::ffi::c_void;

        unsafe extern "system" {
            fn RtlAddFunctionTable(table: *const c_void, count: u32, base: u64) -> u8;
            fn RtlDeleteFunctionTable(table: *const c_void) -> u8;
        }

        /// A registered SEH function table.
        #[derive(Debug)]
        pub(crate) struct EhFrameRegistration {
            table: *const c_void,
        }

        // Safety: the table pointer is only handed to the OS unwinder,
        // which synchronizes internally.
        unsafe impl Send for EhFrameRegistration {}
        unsafe impl Sync for EhFrameRegistration {}

        impl EhFrameRegistration {
            pub(crate) fn register(image_base: usize, addr: usize, num_bytes: usize) -> Self {
                // Each RUNTIME_FUNCTION entry is three 32-bit
                // image-relative offsets.
                let count = num_bytes / 12;
                let table = addr as *const c_void;
                // Safety: the entries live in the image's read-only
                // section for the lifetime of this guard.
                unsafe { RtlAddFunctionTable(table, count as u32, image_base as u64) };
                Self { table }
            }
        }

        impl Drop for EhFrameRegistration {
            fn drop(&mut self) {
                // Safety: registered above and not yet deleted.
                unsafe { RtlDeleteFunctionTable(self.table) };
            }
        }
    } else {
        use core::slice;

        unsafe extern "C" {
            fn __register_frame(fde: *const u8);
            fn __deregister_frame(fde: *const u8);
        }

        /// A registered range of call-frame information.
        #[derive(Debug)]
        pub(crate) struct EhFrameRegistration {
            entries: Vec<usize>,
        }

        impl EhFrameRegistration {
            pub(crate) fn register(_image_base: usize, addr: usize, num_bytes: usize) -> Self {
                let entries = if cfg!(any(target_os = "macos", target_os = "ios")) {
                    // libunwind wants each FDE registered individually.
                    fde_starts(addr, num_bytes)
                } else {
                    // libgcc-style unwinders take the whole section in one
                    // call.
                    vec![addr]
                };
                for &entry in &entries {
                    // Safety: the frame data lives in the image for the
                    // lifetime of this guard.
                    unsafe { __register_frame(entry as *const u8) };
                }
                Self { entries }
            }
        }

        impl Drop for EhFrameRegistration {
            fn drop(&mut self) {
                for &entry in &self.entries {
                    // Safety: registered in `register` with the same
                    // pointers.
                    unsafe { __deregister_frame(entry as *const u8) };
                }
            }
        }

        // An `.eh_frame` section is a series of length-prefixed CFI
        // records; a record whose second word is non-zero is an FDE.
        fn fde_starts(addr: usize, num_bytes: usize) -> Vec<usize> {
            // Safety: callers pass a live, readable section range.
            let data = unsafe { slice::from_raw_parts(addr as *const u8, num_bytes) };
            let mut starts = Vec::new();
            let mut offset = 0usize;
            while offset + 8 <= data.len() {
                let length =
                    u32::from_ne_bytes(data[offset..offset + 4].try_into().unwrap());
                if length == 0 {
                    // Terminator record.
                    break;
                }
                if length == u32::MAX {
                    // The backend does not emit 64-bit CFI.
                    break;
                }
                let cie_pointer =
                    u32::from_ne_bytes(data[offset + 4..offset + 8].try_into().unwrap());
                if cie_pointer != 0 {
                    starts.push(addr + offset);
                }
                offset += 4 + length as usize;
            }
            starts
        }
    }
}
