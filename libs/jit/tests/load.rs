// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Whole-module loading against synthetic relocatable objects.

use std::sync::Arc;

use jit::{
    FunctionBinding, GlobalBinding, JitFunction, LoadedModule, MemoryBinding, TableBinding,
    function_for_address, load_module, memory_base_offset, unload_module,
};
use object::write::{Object, Relocation, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};

fn new_object() -> Object<'static> {
    Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little)
}

fn add_text(obj: &mut Object<'_>, len: usize) -> object::write::SectionId {
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    // Fill with `ret` so the section holds real instructions.
    obj.append_section_data(text, &vec![0xC3u8; len], 16);
    text
}

fn add_function(
    obj: &mut Object<'_>,
    text: object::write::SectionId,
    name: &str,
    offset: u64,
    size: u64,
) -> object::write::SymbolId {
    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: offset,
        size,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    })
}

fn add_import(obj: &mut Object<'_>, name: &str) -> object::write::SymbolId {
    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Unknown,
        scope: SymbolScope::Unknown,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    })
}

fn abs64(symbol: object::write::SymbolId, offset: u64) -> Relocation {
    Relocation {
        offset,
        symbol,
        addend: 0,
        flags: RelocationFlags::Generic {
            kind: RelocationKind::Absolute,
            encoding: RelocationEncoding::Generic,
            size: 64,
        },
    }
}

fn build_object(functions: &[(&str, u64, u64)], text_len: usize) -> Vec<u8> {
    let mut obj = new_object();
    let text = add_text(&mut obj, text_len);
    for &(name, offset, size) in functions {
        add_function(&mut obj, text, name, offset, size);
    }
    obj.write().unwrap()
}

fn load(
    bytes: &[u8],
    imports: &[FunctionBinding],
    num_defs: usize,
) -> (Arc<LoadedModule>, Vec<Arc<JitFunction>>) {
    load_module(
        bytes,
        &[],
        imports,
        num_defs,
        &[],
        &[],
        &[],
        &[],
        MemoryBinding { id: 0 },
        TableBinding { id: 0 },
    )
}

#[test]
fn lookup_covers_exact_function_ranges() {
    let bytes = build_object(&[("A", 0, 100), ("B", 256, 50)], 512);
    let (module, _) = load(&bytes, &[], 0);

    let a = module.function_by_name("A").unwrap();
    let b = module.function_by_name("B").unwrap();
    assert_eq!(a.num_bytes(), 100);
    assert_eq!(b.base_addr(), a.base_addr() + 256);
    // No debug info in the object, so the operation table is empty.
    assert!(a.offset_to_op_index().is_empty());

    assert!(function_for_address(a.base_addr() - 1).is_none());
    assert_eq!(
        function_for_address(a.base_addr()).unwrap().base_addr(),
        a.base_addr()
    );
    assert_eq!(
        function_for_address(a.base_addr() + 99).unwrap().base_addr(),
        a.base_addr()
    );
    // One past the end belongs to nobody; the next function starts later.
    assert!(function_for_address(a.base_addr() + 100).is_none());
    assert_eq!(
        function_for_address(b.base_addr() + 25).unwrap().base_addr(),
        b.base_addr()
    );
    assert!(function_for_address(b.base_addr() + 50).is_none());

    unload_module(module);
}

#[test]
fn abutting_functions_split_at_the_boundary() {
    let bytes = build_object(&[("A", 0, 100), ("B", 100, 50)], 256);
    let (module, _) = load(&bytes, &[], 0);

    let a = module.function_by_name("A").unwrap();
    assert_eq!(
        function_for_address(a.base_addr() + 99).unwrap().base_addr(),
        a.base_addr()
    );
    assert_eq!(
        function_for_address(a.base_addr() + 100).unwrap().base_addr(),
        a.base_addr() + 100
    );

    unload_module(module);
}

#[test]
fn unloading_removes_every_address() {
    let bytes = build_object(&[("A", 0, 100), ("B", 256, 50)], 512);
    let (module, _) = load(&bytes, &[], 0);
    let a_base = module.function_by_name("A").unwrap().base_addr();
    let b_base = module.function_by_name("B").unwrap().base_addr();
    let range = module.image_range();

    unload_module(module);

    for address in [a_base, a_base + 99, b_base, b_base + 25, range.start, range.end - 1] {
        assert!(function_for_address(address).is_none());
    }
}

#[test]
fn unloaded_images_never_alias_new_ones() {
    let bytes = build_object(&[("A", 0, 64)], 128);

    let (first, _) = load(&bytes, &[], 0);
    let first_range = first.image_range();
    unload_module(first);

    // The torn-down image's reservation is retained, so the new module
    // cannot land on top of it.
    let (second, _) = load(&bytes, &[], 0);
    let second_range = second.image_range();
    assert!(second_range.start >= first_range.end || second_range.end <= first_range.start);

    assert!(function_for_address(first_range.start).is_none());
    assert!(function_for_address(second_range.start).is_some());

    unload_module(second);
}

#[test]
fn function_defs_come_back_in_definition_order() {
    let bytes = build_object(&[("functionDef0", 0, 16), ("functionDef1", 32, 16)], 64);
    let (module, defs) = load(&bytes, &[], 2);

    assert_eq!(defs.len(), 2);
    assert_eq!(
        defs[0].base_addr(),
        module.function_by_name("functionDef0").unwrap().base_addr()
    );
    assert_eq!(defs[1].base_addr(), defs[0].base_addr() + 32);

    unload_module(module);
}

extern "C" fn host_import() {}

#[test]
fn absolute_relocations_bind_imports() {
    let mut obj = new_object();
    let text = add_text(&mut obj, 64);
    add_function(&mut obj, text, "A", 0, 16);
    let import = add_import(&mut obj, "functionImport0");
    obj.add_relocation(text, abs64(import, 16)).unwrap();
    let bytes = obj.write().unwrap();

    let binding = FunctionBinding {
        native_function: host_import as *const u8,
    };
    let (module, _) = load(&bytes, &[binding], 0);

    // The code section leads the image, so the slot sits at a known spot.
    let slot = module.image_range().start + 16;
    let loaded = unsafe { std::ptr::read_unaligned(slot as *const u64) };
    assert_eq!(loaded, host_import as u64);

    unload_module(module);
}

#[test]
fn pc_relative_relocations_resolve_within_the_image() {
    let mut obj = new_object();
    let text = add_text(&mut obj, 512);
    add_function(&mut obj, text, "A", 0, 16);
    let b = add_function(&mut obj, text, "B", 256, 16);
    obj.add_relocation(
        text,
        Relocation {
            offset: 16,
            symbol: b,
            addend: 0,
            flags: RelocationFlags::Generic {
                kind: RelocationKind::Relative,
                encoding: RelocationEncoding::Generic,
                size: 32,
            },
        },
    )
    .unwrap();
    let bytes = obj.write().unwrap();

    let (module, _) = load(&bytes, &[], 0);
    let slot = module.image_range().start + 16;
    let delta = unsafe { std::ptr::read_unaligned(slot as *const i32) };
    assert_eq!(delta, 240);

    unload_module(module);
}

#[test]
fn offset_symbols_carry_runtime_data_offsets() {
    let mut obj = new_object();
    let text = add_text(&mut obj, 64);
    add_function(&mut obj, text, "A", 0, 16);
    let memory = add_import(&mut obj, "memoryOffset0");
    let global = add_import(&mut obj, "global0");
    obj.add_relocation(text, abs64(memory, 16)).unwrap();
    obj.add_relocation(text, abs64(global, 24)).unwrap();
    let bytes = obj.write().unwrap();

    static IMMUTABLE_VALUE: u64 = 77;
    let (module, _) = load_module(
        &bytes,
        &[],
        &[],
        0,
        &[],
        &[MemoryBinding { id: 3 }],
        &[GlobalBinding::Immutable {
            value: &raw const IMMUTABLE_VALUE as *const u8,
        }],
        &[],
        MemoryBinding { id: 0 },
        TableBinding { id: 0 },
    );

    let base = module.image_range().start;
    let memory_slot = unsafe { std::ptr::read_unaligned((base + 16) as *const u64) };
    let global_slot = unsafe { std::ptr::read_unaligned((base + 24) as *const u64) };
    assert_eq!(memory_slot, memory_base_offset(3) as u64);
    assert_eq!(global_slot, &raw const IMMUTABLE_VALUE as u64);

    unload_module(module);
}

#[test]
fn data_and_bss_sections_load() {
    let mut obj = new_object();
    let text = add_text(&mut obj, 64);
    add_function(&mut obj, text, "A", 0, 16);
    let rodata = obj.add_section(Vec::new(), b".rodata".to_vec(), SectionKind::ReadOnlyData);
    obj.append_section_data(rodata, &[1, 2, 3, 4], 8);
    let data = obj.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
    obj.append_section_data(data, &[5, 6, 7, 8], 8);
    let bss = obj.add_section(
        Vec::new(),
        b".bss".to_vec(),
        SectionKind::UninitializedData,
    );
    obj.append_section_bss(bss, 4096, 16);
    let bytes = obj.write().unwrap();

    let (module, _) = load(&bytes, &[], 0);
    let a = module.function_by_name("A").unwrap();
    assert!(function_for_address(a.base_addr()).is_some());

    unload_module(module);
}

#[test]
fn concurrent_lookups_share_the_registry() {
    let bytes = build_object(&[("A", 0, 64)], 128);
    let (module, _) = load(&bytes, &[], 0);
    let base = module.function_by_name("A").unwrap().base_addr();

    let threads: Vec<_> = (0..4)
        .map(|thread| {
            std::thread::spawn(move || {
                for i in 0..1_000usize {
                    let address = base + (thread + i) % 64;
                    assert_eq!(
                        function_for_address(address).unwrap().base_addr(),
                        base
                    );
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    unload_module(module);
}

#[test]
#[should_panic(expected = "duplicate function symbol")]
fn duplicate_function_names_fail_loudly() {
    let bytes = build_object(&[("A", 0, 16), ("A", 32, 16)], 64);
    let _ = load(&bytes, &[], 0);
}

#[test]
#[should_panic(expected = "undefined symbol")]
fn unresolvable_imports_are_fatal() {
    let mut obj = new_object();
    let text = add_text(&mut obj, 64);
    add_function(&mut obj, text, "A", 0, 16);
    let import = add_import(&mut obj, "functionImport0");
    obj.add_relocation(text, abs64(import, 16)).unwrap();
    let bytes = obj.write().unwrap();

    let _ = load(&bytes, &[], 0);
}

#[test]
#[should_panic(expected = "failed to open object file")]
fn garbage_objects_are_fatal() {
    let _ = load(&[0u8; 32], &[], 0);
}

#[test]
#[should_panic(expected = "missing function definition")]
fn missing_function_defs_are_fatal() {
    let bytes = build_object(&[("functionDef0", 0, 16)], 64);
    let _ = load(&bytes, &[], 2);
}
