// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The JIT-visible layout of per-compartment and per-context runtime data.
//!
//! Generated code addresses its tables, memories, and mutable globals as
//! fixed offsets from a runtime-data base pointer; the loader binds the
//! `tableOffset{n}`/`memoryOffset{n}`/`global{n}` import symbols to the
//! offsets computed here. The structs are `repr(C)` so the offsets are
//! stable against the code generator's assumptions.

use core::mem::offset_of;

/// Table and memory slots addressable by one compartment's code.
pub const MAX_TABLES: usize = 256;
pub const MAX_MEMORIES: usize = 256;

/// Bytes of mutable-global backing store in each context.
pub const MAX_GLOBAL_DATA_BYTES: usize = 4096;

#[repr(C)]
pub struct CompartmentRuntimeData {
    /// Back-pointer to the owning compartment. Also keeps every slot at a
    /// non-zero offset; the backend reserves symbol value zero to mean
    /// "unresolved".
    pub compartment: *mut u8,
    pub table_bases: [*mut u8; MAX_TABLES],
    pub memory_bases: [*mut u8; MAX_MEMORIES],
}

#[repr(C)]
pub struct ContextRuntimeData {
    /// Back-pointer to the owning context; see
    /// [`CompartmentRuntimeData::compartment`].
    pub context: *mut u8,
    /// Backing store for the compartment's mutable globals.
    pub global_data: [u8; MAX_GLOBAL_DATA_BYTES],
}

/// Byte offset of table `id`'s base slot within the compartment runtime
/// data.
pub fn table_base_offset(id: usize) -> usize {
    assert!(id < MAX_TABLES);
    offset_of!(CompartmentRuntimeData, table_bases) + size_of::<*mut u8>() * id
}

/// Byte offset of memory `id`'s base slot within the compartment runtime
/// data.
pub fn memory_base_offset(id: usize) -> usize {
    assert!(id < MAX_MEMORIES);
    offset_of!(CompartmentRuntimeData, memory_bases) + size_of::<*mut u8>() * id
}

/// Byte offset of a mutable global within the context runtime data, given
/// its offset into the global backing store.
pub fn global_data_offset(mutable_data_offset: usize) -> usize {
    assert!(mutable_data_offset < MAX_GLOBAL_DATA_BYTES);
    offset_of!(ContextRuntimeData, global_data) + mutable_data_offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_pointer_strided() {
        assert_eq!(
            table_base_offset(1) - table_base_offset(0),
            size_of::<*mut u8>()
        );
        assert_eq!(
            memory_base_offset(0),
            table_base_offset(0) + MAX_TABLES * size_of::<*mut u8>()
        );
    }

    #[test]
    fn no_slot_sits_at_offset_zero() {
        assert_ne!(table_base_offset(0), 0);
        assert_ne!(memory_base_offset(0), 0);
        assert_ne!(global_data_offset(0), 0);
    }

    #[test]
    #[should_panic]
    fn out_of_range_table_ids_are_rejected() {
        table_base_offset(MAX_TABLES);
    }

    #[test]
    fn global_offsets_stay_inside_the_backing_store() {
        let last = global_data_offset(MAX_GLOBAL_DATA_BYTES - 1);
        assert!(last < size_of::<ContextRuntimeData>());
    }

    #[test]
    #[should_panic]
    fn out_of_range_global_offsets_are_rejected() {
        global_data_offset(MAX_GLOBAL_DATA_BYTES);
    }
}
