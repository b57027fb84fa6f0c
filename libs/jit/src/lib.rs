// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Native code loading and the process-wide JIT module registry.
//!
//! A backend code generator hands this crate a relocatable object file (ELF,
//! Mach-O, or COFF) plus bindings for the module's imports. [`load_module`]
//! maps the object into a fresh executable image, resolves its undefined
//! symbols, registers unwind metadata and the in-process debugger interface,
//! and publishes the module in a global registry. From then on
//! [`function_for_address`] maps any instruction address back to the
//! originating function, including a table translating code offsets to
//! WebAssembly operation indices recovered from the object's DWARF line
//! information.
//!
//! Modules stay resident until [`unload_module`]; their address ranges never
//! alias because a torn-down image's reservation is kept, inaccessible, for
//! the life of the process.

mod gdb;
mod image;
mod intrinsics;
mod mmap;
mod module;
mod obj;
mod registry;
mod resolver;
#[cfg(all(windows, target_arch = "x86_64"))]
mod seh;
mod unwind;
mod vmoffsets;

pub use image::{ImageMemory, SectionKind};
pub use mmap::{Mmap, Permissions, host_page_size};
pub use module::{
    ExceptionTypeBinding, FunctionBinding, GlobalBinding, JitFunction, LoadedModule,
    MemoryBinding, TableBinding, load_module, unload_module,
};
pub use registry::function_for_address;
pub use resolver::SymbolTable;
pub use vmoffsets::{
    CompartmentRuntimeData, ContextRuntimeData, global_data_offset, memory_base_offset,
    table_base_offset,
};

pub type Result<T> = anyhow::Result<T>;

/// Aborts the calling operation on conditions that leave executable memory
/// in an unknown state; recovery after such a failure is unsafe.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        panic!($($arg)*);
    }};
}
pub(crate) use fatal;
