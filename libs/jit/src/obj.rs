// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Placement of a relocatable object into image memory.
//!
//! Loading runs in three passes: size the image sections the same way
//! allocation will consume them, bump-allocate and copy each object
//! section, then resolve and apply every relocation. Undefined symbols go
//! through the caller's symbol table; a symbol nobody provides is fatal,
//! as is any relocation form the backend is not expected to emit.

use std::collections::HashMap;

use object::{
    File, Object, ObjectSection, ObjectSymbol, Relocation, RelocationKind, RelocationTarget,
    SectionIndex,
};

use crate::fatal;
use crate::image::{ImageMemory, SectionKind};
use crate::mmap::host_page_size;
use crate::resolver::SymbolTable;

/// Where each object section landed; offsets are image-relative.
#[derive(Debug, Default)]
pub(crate) struct LoadedObject {
    section_offsets: HashMap<SectionIndex, usize>,
}

impl LoadedObject {
    pub(crate) fn section_offset(&self, index: SectionIndex) -> Option<usize> {
        self.section_offsets.get(&index).copied()
    }

    pub(crate) fn section_addr(&self, image: &ImageMemory, index: SectionIndex) -> Option<usize> {
        self.section_offset(index)
            .map(|offset| image.base_addr() + offset)
    }
}

fn placement(
    section: &object::Section<'_, '_>,
    process_all_sections: bool,
) -> Option<SectionKind> {
    use object::SectionKind as K;
    match section.kind() {
        K::Text => Some(SectionKind::Code),
        K::ReadOnlyData | K::ReadOnlyDataWithRel | K::ReadOnlyString => {
            Some(SectionKind::ReadOnly)
        }
        K::Data | K::UninitializedData => Some(SectionKind::ReadWrite),
        // Debug sections get image space too, so DWARF is interpreted
        // against loaded, relocated bytes.
        K::Debug if process_all_sections => Some(SectionKind::ReadOnly),
        _ => None,
    }
}

fn section_alignment(section: &object::Section<'_, '_>) -> usize {
    let align = section.align() as usize;
    let align = if align == 0 { 1 } else { align };
    if align > host_page_size() {
        fatal!(
            "section {:?} demands {align}-byte alignment, beyond the page size",
            section.name()
        );
    }
    align
}

#[derive(Debug, Default)]
struct SectionSizes {
    bytes: usize,
    align: usize,
}

impl SectionSizes {
    // Mirrors the bump allocator's consumption.
    fn tally(&mut self, size: usize, align: usize) {
        self.bytes = align_up(self.bytes, align) + align_up(size, align);
        self.align = self.align.max(align);
    }
}

/// Loads `object` into a fresh image, leaving it read-write; the caller
/// applies any late fixups and then finalizes.
pub(crate) fn load(
    object: &File<'_>,
    resolver: &SymbolTable,
    process_all_sections: bool,
) -> (ImageMemory, LoadedObject) {
    let mut code = SectionSizes::default();
    let mut read_only = SectionSizes::default();
    let mut read_write = SectionSizes::default();
    for section in object.sections() {
        let Some(kind) = placement(&section, process_all_sections) else {
            continue;
        };
        let sizes = match kind {
            SectionKind::Code => &mut code,
            SectionKind::ReadOnly => &mut read_only,
            SectionKind::ReadWrite => &mut read_write,
        };
        sizes.tally(section.size() as usize, section_alignment(&section));
    }

    let mut image = ImageMemory::reserve(
        code.bytes,
        code.align.max(1),
        read_only.bytes,
        read_only.align.max(1),
        read_write.bytes,
        read_write.align.max(1),
    );

    let mut loaded = LoadedObject::default();
    for section in object.sections() {
        let Some(kind) = placement(&section, process_all_sections) else {
            continue;
        };
        let size = section.size() as usize;
        let offset = image.allocate(kind, size, section_alignment(&section));
        if section.kind() != object::SectionKind::UninitializedData && size != 0 {
            let data = match section.data() {
                Ok(data) => data,
                Err(err) => fatal!("failed to read section {:?}: {err}", section.name()),
            };
            // Freshly committed pages are zeroed; only file-backed bytes
            // need copying.
            // Safety: the image is still read-write and `offset` was just
            // allocated for this section.
            unsafe { image.slice_mut(offset, data.len()) }.copy_from_slice(data);
        }
        loaded.section_offsets.insert(section.index(), offset);
    }

    for section in object.sections() {
        let Some(place_offset) = loaded.section_offset(section.index()) else {
            continue;
        };
        for (relocation_offset, relocation) in section.relocations() {
            apply_relocation(
                object,
                &mut image,
                &loaded,
                resolver,
                place_offset + relocation_offset as usize,
                &relocation,
            );
        }
    }

    (image, loaded)
}

// The address the relocation refers to, before the addend.
pub(crate) fn resolve_target(
    object: &File<'_>,
    image: &ImageMemory,
    loaded: &LoadedObject,
    resolver: &SymbolTable,
    target: RelocationTarget,
) -> u64 {
    match target {
        RelocationTarget::Symbol(index) => {
            let symbol = match object.symbol_by_index(index) {
                Ok(symbol) => symbol,
                Err(err) => fatal!("malformed relocation symbol: {err}"),
            };
            if symbol.is_undefined() {
                let name = symbol.name().unwrap_or("<unnamed>");
                match resolver.resolve(name) {
                    Some(address) => address as u64,
                    None => fatal!("undefined symbol {name:?}"),
                }
            } else {
                let Some(section_index) = symbol.section_index() else {
                    fatal!("symbol {:?} is not section-relative", symbol.name());
                };
                let Some(section_addr) = loaded.section_addr(image, section_index) else {
                    fatal!("symbol {:?} lives in an unloaded section", symbol.name());
                };
                section_addr as u64 + symbol.address()
            }
        }
        RelocationTarget::Section(index) => match loaded.section_addr(image, index) {
            Some(addr) => addr as u64,
            None => fatal!("relocation against an unloaded section"),
        },
        RelocationTarget::Absolute => 0,
        other => fatal!("unsupported relocation target {other:?}"),
    }
}

fn apply_relocation(
    object: &File<'_>,
    image: &mut ImageMemory,
    loaded: &LoadedObject,
    resolver: &SymbolTable,
    image_offset: usize,
    relocation: &Relocation,
) {
    let target = resolve_target(object, image, loaded, resolver, relocation.target());

    // ELF carries explicit addends; COFF and Mach-O store them in place.
    let addend = if relocation.has_implicit_addend() {
        // Safety: the image is still read-write and the offset lies in a
        // loaded section.
        match relocation.size() {
            32 => {
                let place = unsafe { image.slice_mut(image_offset, 4) };
                i64::from(i32::from_le_bytes(place[..4].try_into().unwrap()))
            }
            64 => {
                let place = unsafe { image.slice_mut(image_offset, 8) };
                i64::from_le_bytes(place[..8].try_into().unwrap())
            }
            other => fatal!("unsupported relocation width {other}"),
        }
    } else {
        relocation.addend()
    };

    let value = target.wrapping_add(addend as u64);
    let place_addr = (image.base_addr() + image_offset) as u64;

    match (relocation.kind(), relocation.size()) {
        (RelocationKind::Absolute, 64) => {
            write_in_place(image, image_offset, &value.to_le_bytes());
        }
        (RelocationKind::Absolute, 32) => {
            // Accept either the zero-extended or the sign-extended 32-bit
            // form; each must round-trip to the full address.
            let zext_ok = value <= u64::from(u32::MAX);
            let sext_ok = i32::try_from(value as i64).is_ok();
            if !zext_ok && !sext_ok {
                fatal!("32-bit absolute relocation overflow: {value:#x}");
            }
            write_in_place(image, image_offset, &(value as u32).to_le_bytes());
        }
        (RelocationKind::Relative | RelocationKind::PltRelative, 32) => {
            let delta = value.wrapping_sub(place_addr) as i64;
            let Ok(delta) = i32::try_from(delta) else {
                fatal!("PC-relative relocation overflow: {delta:#x}");
            };
            write_in_place(image, image_offset, &delta.to_le_bytes());
        }
        (RelocationKind::Relative, 64) => {
            let delta = value.wrapping_sub(place_addr);
            write_in_place(image, image_offset, &delta.to_le_bytes());
        }
        (kind, size) => fatal!("unsupported relocation {kind:?} ({size} bits)"),
    }
}

fn write_in_place(image: &mut ImageMemory, offset: usize, bytes: &[u8]) {
    // Safety: permissions are not final yet and the offset was allocated
    // during placement.
    unsafe { image.slice_mut(offset, bytes.len()) }.copy_from_slice(bytes);
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
