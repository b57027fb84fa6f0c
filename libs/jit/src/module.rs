// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The load driver and the records it produces.
//!
//! [`load_module`] synthesizes the import symbol table from the caller's
//! binding vectors, places the object into image memory, registers unwind
//! and debugger metadata, and walks the loaded symbol table to build one
//! [`JitFunction`] record per defined function. Each record carries the
//! function's address range and a table mapping code offsets to the
//! WebAssembly operation indices the code generator stored as DWARF line
//! numbers.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, Range};
use std::sync::Arc;
use std::time::Instant;

use object::{File, Object, ObjectSection, ObjectSymbol, SymbolKind};

use crate::fatal;
use crate::gdb::{self, GdbRegistration};
use crate::image::ImageMemory;
use crate::obj::{self, LoadedObject};
use crate::registry;
use crate::resolver::SymbolTable;
use crate::vmoffsets;

/// A host function bound to an import; the compiled code calls it with the
/// intrinsic calling convention, so no thunking is involved.
#[derive(Debug, Clone, Copy)]
pub struct FunctionBinding {
    pub native_function: *const u8,
}

/// A table import, identified by its slot in the compartment runtime data.
#[derive(Debug, Clone, Copy)]
pub struct TableBinding {
    pub id: usize,
}

/// A memory import, identified by its slot in the compartment runtime
/// data.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBinding {
    pub id: usize,
}

/// A global import. Mutable globals live in per-context data at a fixed
/// offset; immutable globals are referenced by the address of their value.
#[derive(Debug, Clone, Copy)]
pub enum GlobalBinding {
    Mutable { data_offset: usize },
    Immutable { value: *const u8 },
}

/// An exception type import, bound to the address of its type descriptor.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionTypeBinding {
    pub instance: *const u8,
}

/// One JIT-compiled function: an address range plus the code-offset to
/// operation-index table recovered from debug line information. Immutable
/// once built.
#[derive(Debug)]
pub struct JitFunction {
    base_addr: usize,
    num_bytes: usize,
    offset_to_op_index: BTreeMap<u32, u32>,
}

impl JitFunction {
    #[inline]
    pub fn base_addr(&self) -> usize {
        self.base_addr
    }

    #[inline]
    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        self.base_addr <= address && address < self.base_addr + self.num_bytes
    }

    /// Operation index of the instruction at `code_offset`: the last line
    /// row at or before the offset.
    pub fn op_index_at(&self, code_offset: u32) -> Option<u32> {
        self.offset_to_op_index
            .range(..=code_offset)
            .next_back()
            .map(|(_, &op_index)| op_index)
    }

    pub fn offset_to_op_index(&self) -> &BTreeMap<u32, u32> {
        &self.offset_to_op_index
    }
}

/// A loaded module: its image, its functions, and the lookup indices over
/// them. Lives until [`unload_module`] removes the registry's handle and
/// every caller-held handle drops.
#[derive(Debug)]
pub struct LoadedModule {
    image: ImageMemory,
    functions: Vec<Arc<JitFunction>>,
    name_to_function: HashMap<String, Arc<JitFunction>>,
    /// Keyed by one-past-the-end of each function's range.
    address_to_function: BTreeMap<usize, Arc<JitFunction>>,
    _gdb: GdbRegistration,
}

impl LoadedModule {
    fn new(object_bytes: &[u8], imported_symbols: &SymbolTable) -> Arc<Self> {
        let start_time = Instant::now();

        let object = match File::parse(object_bytes) {
            Ok(object) => object,
            Err(err) => fatal!("failed to open object file: {err}"),
        };

        #[cfg(all(windows, target_arch = "x86_64"))]
        let seh_snapshot = crate::seh::snapshot(&object);

        // COFF debug sections carry relocation types the loader does not
        // implement; skip them there.
        let process_all_sections = cfg!(not(windows));
        let (mut image, loaded) = obj::load(&object, imported_symbols, process_all_sections);

        #[cfg(all(windows, target_arch = "x86_64"))]
        crate::seh::apply_fixups(&mut image, &object, &loaded, seh_snapshot, imported_symbols);

        #[cfg(not(windows))]
        if let Some(section) = object.section_by_name(".eh_frame") {
            if let Some(addr) = loaded.section_addr(&image, section.index()) {
                image.register_eh_frames(addr, section.size() as usize);
            }
        }

        image.finalize();

        let gdb = gdb::register_object(object_bytes);

        // Line rows translate loaded addresses back to the operation
        // indices the code generator recorded as line numbers.
        let line_rows = read_line_rows(&object, &image, &loaded);

        let mut functions = Vec::new();
        let mut name_to_function = HashMap::new();
        let mut address_to_function = BTreeMap::new();
        for symbol in object.symbols() {
            if symbol.kind() != SymbolKind::Text || symbol.size() == 0 {
                continue;
            }
            let Ok(name) = symbol.name() else {
                continue;
            };
            let Some(section_index) = symbol.section_index() else {
                continue;
            };
            let Some(section_addr) = loaded.section_addr(&image, section_index) else {
                continue;
            };

            let base_addr = section_addr + symbol.address() as usize;
            let num_bytes = symbol.size() as usize;
            debug_assert!(base_addr + num_bytes <= image.end_addr());

            let function = Arc::new(JitFunction {
                base_addr,
                num_bytes,
                offset_to_op_index: offsets_for_range(
                    &line_rows,
                    base_addr as u64,
                    num_bytes as u64,
                ),
            });

            functions.push(Arc::clone(&function));
            let previous = name_to_function.insert(name.to_string(), Arc::clone(&function));
            assert!(previous.is_none(), "duplicate function symbol {name:?}");
            address_to_function.insert(base_addr + num_bytes, function);
        }

        let module = Arc::new(Self {
            image,
            functions,
            name_to_function,
            address_to_function,
            _gdb: gdb,
        });
        registry::register(Arc::clone(&module));

        tracing::debug!(
            num_bytes = object_bytes.len(),
            num_functions = module.functions.len(),
            elapsed = ?start_time.elapsed(),
            "loaded object"
        );

        module
    }

    pub fn function_by_name(&self, name: &str) -> Option<&Arc<JitFunction>> {
        self.name_to_function.get(name)
    }

    /// The module's functions in symbol-table order.
    pub fn functions(&self) -> impl ExactSizeIterator<Item = &Arc<JitFunction>> {
        self.functions.iter()
    }

    pub fn image_range(&self) -> Range<usize> {
        self.image.base_addr()..self.image.end_addr()
    }

    pub(crate) fn image_end(&self) -> usize {
        self.image.end_addr()
    }

    /// The function whose range contains `address`, if any. The map is
    /// immutable after construction, so this takes no lock.
    pub(crate) fn function_containing(&self, address: usize) -> Option<Arc<JitFunction>> {
        let (_, function) = self
            .address_to_function
            .range((Bound::Excluded(address), Bound::Unbounded))
            .next()?;
        function.contains(address).then(|| Arc::clone(function))
    }
}

fn read_line_rows(object: &File<'_>, image: &ImageMemory, loaded: &LoadedObject) -> Vec<(u64, u32)> {
    match try_read_line_rows(object, image, loaded) {
        Ok(rows) => rows,
        Err(err) => {
            tracing::warn!("ignoring malformed debug info: {err}");
            Vec::new()
        }
    }
}

fn try_read_line_rows(
    object: &File<'_>,
    image: &ImageMemory,
    loaded: &LoadedObject,
) -> Result<Vec<(u64, u32)>, gimli::Error> {
    let load_section = |id: gimli::SectionId| {
        let data = object
            .section_by_name(id.name())
            .and_then(|section| {
                let offset = loaded.section_offset(section.index())?;
                let len = section.size() as usize;
                // Safety: the section was copied into the image, which
                // outlives this walk.
                Some(unsafe {
                    core::slice::from_raw_parts((image.base_addr() + offset) as *const u8, len)
                })
            })
            .unwrap_or(&[]);
        Ok::<_, gimli::Error>(gimli::EndianSlice::new(data, gimli::NativeEndian))
    };
    let dwarf = gimli::Dwarf::load(load_section)?;

    let mut rows = Vec::new();
    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let Some(program) = unit.line_program.clone() else {
            continue;
        };
        let mut state_machine = program.rows();
        while let Some((_, row)) = state_machine.next_row()? {
            if row.end_sequence() {
                continue;
            }
            let Some(line) = row.line() else {
                continue;
            };
            rows.push((row.address(), line.get() as u32));
        }
    }
    rows.sort_unstable_by_key(|&(address, _)| address);
    Ok(rows)
}

// `rows` is sorted by address; keep the ones inside `[base, base + len)`,
// rebased to function-relative offsets.
fn offsets_for_range(rows: &[(u64, u32)], base: u64, len: u64) -> BTreeMap<u32, u32> {
    let start = rows.partition_point(|&(address, _)| address < base);
    let mut map = BTreeMap::new();
    for &(address, op_index) in &rows[start..] {
        if address >= base + len {
            break;
        }
        map.insert((address - base) as u32, op_index);
    }
    map
}

fn external_name(prefix: &str, index: usize) -> String {
    format!("{prefix}{index}")
}

/// Loads a compiled module, binding its imports to the given host values.
///
/// Returns the module handle plus the functions the module defines, in
/// definition order (resolved through their `functionDef{n}` symbol
/// names). Any failure to open, relocate, or place the object is fatal: a
/// malformed object here means the code generator produced garbage, and
/// the process's executable memory can no longer be trusted.
#[allow(clippy::too_many_arguments)]
pub fn load_module(
    object_bytes: &[u8],
    intrinsic_exports: &[(String, FunctionBinding)],
    function_imports: &[FunctionBinding],
    num_function_defs: usize,
    tables: &[TableBinding],
    memories: &[MemoryBinding],
    globals: &[GlobalBinding],
    exception_types: &[ExceptionTypeBinding],
    default_memory: MemoryBinding,
    default_table: TableBinding,
) -> (Arc<LoadedModule>, Vec<Arc<JitFunction>>) {
    let mut import_symbols = SymbolTable::new();

    // Intrinsic exports keep their exported names.
    for (name, binding) in intrinsic_exports {
        import_symbols.insert(name.clone(), binding.native_function as usize);
    }

    for (index, import) in function_imports.iter().enumerate() {
        import_symbols.insert(
            external_name("functionImport", index),
            import.native_function as usize,
        );
    }

    // Tables and memories resolve to offsets into the compartment runtime
    // data rather than addresses.
    for (index, table) in tables.iter().enumerate() {
        import_symbols.insert(
            external_name("tableOffset", index),
            vmoffsets::table_base_offset(table.id),
        );
    }
    for (index, memory) in memories.iter().enumerate() {
        import_symbols.insert(
            external_name("memoryOffset", index),
            vmoffsets::memory_base_offset(memory.id),
        );
    }

    for (index, global) in globals.iter().enumerate() {
        let value = match *global {
            GlobalBinding::Mutable { data_offset } => vmoffsets::global_data_offset(data_offset),
            GlobalBinding::Immutable { value } => value as usize,
        };
        import_symbols.insert(external_name("global", index), value);
    }

    for (index, exception_type) in exception_types.iter().enumerate() {
        import_symbols.insert(
            external_name("exceptionType", index),
            exception_type.instance as usize,
        );
    }

    import_symbols.insert(
        "defaultMemoryOffset".to_string(),
        vmoffsets::memory_base_offset(default_memory.id),
    );
    import_symbols.insert(
        "defaultTableOffset".to_string(),
        vmoffsets::table_base_offset(default_table.id),
    );

    let module = LoadedModule::new(object_bytes, &import_symbols);

    let mut function_defs = Vec::with_capacity(num_function_defs);
    for index in 0..num_function_defs {
        let name = external_name("functionDef", index);
        let Some(function) = module.function_by_name(&name) else {
            fatal!("loaded object is missing function definition {name:?}");
        };
        function_defs.push(Arc::clone(function));
    }

    (module, function_defs)
}

/// Removes the module from the global registry. The image is torn down
/// when the last handle drops, so a lookup that already holds the module
/// stays valid; new lookups no longer observe it.
pub fn unload_module(module: Arc<LoadedModule>) {
    registry::unregister(&module);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_rows_rebase_to_function_offsets() {
        let rows = [(0x1000, 1), (0x1004, 2), (0x1010, 7), (0x1040, 9)];
        let map = offsets_for_range(&rows, 0x1000, 0x40);
        assert_eq!(
            map.into_iter().collect::<Vec<_>>(),
            vec![(0, 1), (4, 2), (0x10, 7)]
        );

        let map = offsets_for_range(&rows, 0x1004, 0x10);
        assert_eq!(map.into_iter().collect::<Vec<_>>(), vec![(0, 2)]);

        assert!(offsets_for_range(&rows, 0x2000, 0x40).is_empty());
    }

    #[test]
    fn op_index_lookup_takes_the_preceding_row() {
        let function = JitFunction {
            base_addr: 0x1000,
            num_bytes: 0x40,
            offset_to_op_index: [(0u32, 0u32), (8, 3), (24, 5)].into_iter().collect(),
        };
        assert_eq!(function.op_index_at(0), Some(0));
        assert_eq!(function.op_index_at(7), Some(0));
        assert_eq!(function.op_index_at(8), Some(3));
        assert_eq!(function.op_index_at(63), Some(5));
    }

    #[test]
    fn external_names_concatenate() {
        assert_eq!(external_name("functionImport", 3), "functionImport3");
        assert_eq!(external_name("functionDef", 0), "functionDef0");
    }
}
