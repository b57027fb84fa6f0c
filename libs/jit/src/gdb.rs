// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The in-process interface debuggers use to discover JIT-compiled code.
//!
//! A descriptor with a well-known symbol name heads a doubly-linked list of
//! code entries, each pointing at a complete object file in memory. After
//! mutating the list the runtime calls an empty, non-inlined hook function;
//! an attached debugger breakpoints that hook and re-reads the list.

use core::ptr;
use std::sync::{Mutex, PoisonError};

const JIT_NOACTION: u32 = 0;
const JIT_REGISTER_FN: u32 = 1;
const JIT_UNREGISTER_FN: u32 = 2;

#[repr(C)]
struct JitCodeEntry {
    next_entry: *mut JitCodeEntry,
    prev_entry: *mut JitCodeEntry,
    symfile_addr: *const u8,
    symfile_size: u64,
}

#[repr(C)]
struct JitDescriptor {
    version: u32,
    action_flag: u32,
    relevant_entry: *mut JitCodeEntry,
    first_entry: *mut JitCodeEntry,
}

#[unsafe(no_mangle)]
#[inline(never)]
extern "C" fn __jit_debug_register_code() {
    // Keep the call site from being optimized away.
    std::hint::black_box(());
}

#[allow(non_upper_case_globals)]
#[unsafe(no_mangle)]
static mut __jit_debug_descriptor: JitDescriptor = JitDescriptor {
    version: 1,
    action_flag: JIT_NOACTION,
    relevant_entry: ptr::null_mut(),
    first_entry: ptr::null_mut(),
};

// The descriptor list is shared with every thread that loads or unloads a
// module; the debugger itself only reads it while the process is stopped.
static LIST_LOCK: Mutex<()> = Mutex::new(());

/// One registered object file; unregisters when dropped.
#[derive(Debug)]
pub(crate) struct GdbRegistration {
    entry: *mut JitCodeEntry,
    _symfile: Box<[u8]>,
}

// Safety: the raw entry is only touched under LIST_LOCK.
unsafe impl Send for GdbRegistration {}
unsafe impl Sync for GdbRegistration {}

pub(crate) fn register_object(object_bytes: &[u8]) -> GdbRegistration {
    // The debugger reads the object lazily, so the registration keeps its
    // own copy alive.
    let symfile: Box<[u8]> = object_bytes.into();
    let entry = Box::into_raw(Box::new(JitCodeEntry {
        next_entry: ptr::null_mut(),
        prev_entry: ptr::null_mut(),
        symfile_addr: symfile.as_ptr(),
        symfile_size: symfile.len() as u64,
    }));

    let _guard = LIST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    // Safety: the descriptor is only mutated under LIST_LOCK.
    unsafe {
        let descriptor = &raw mut __jit_debug_descriptor;
        let first = (*descriptor).first_entry;
        (*entry).next_entry = first;
        if !first.is_null() {
            (*first).prev_entry = entry;
        }
        (*descriptor).first_entry = entry;
        (*descriptor).relevant_entry = entry;
        (*descriptor).action_flag = JIT_REGISTER_FN;
    }
    __jit_debug_register_code();

    GdbRegistration {
        entry,
        _symfile: symfile,
    }
}

impl Drop for GdbRegistration {
    fn drop(&mut self) {
        let _guard = LIST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        // Safety: the entry was linked in `register_object` and the list is
        // only mutated under LIST_LOCK.
        unsafe {
            let descriptor = &raw mut __jit_debug_descriptor;
            let entry = self.entry;
            if !(*entry).prev_entry.is_null() {
                (*(*entry).prev_entry).next_entry = (*entry).next_entry;
            } else {
                (*descriptor).first_entry = (*entry).next_entry;
            }
            if !(*entry).next_entry.is_null() {
                (*(*entry).next_entry).prev_entry = (*entry).prev_entry;
            }
            (*descriptor).relevant_entry = entry;
            (*descriptor).action_flag = JIT_UNREGISTER_FN;
        }
        __jit_debug_register_code();

        // Safety: unlinked above; nothing else refers to the entry.
        unsafe { drop(Box::from_raw(self.entry)) };
    }
}
