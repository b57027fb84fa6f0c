// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Structured-exception-handling fixups for COFF images.
//!
//! A COFF object's `.pdata` section holds RUNTIME_FUNCTION entries whose
//! fields are 32-bit image-relative offsets, and its `.xdata` section the
//! unwind info they reference, including the language-specific handler.
//! The handler routine may lie outside the image's 2 GB window, so its
//! slot cannot hold an image-relative offset directly. Loading snapshots
//! the raw sections before relocation, emits a 16-byte trampoline in code
//! memory that jumps to the real handler, rewrites both sections with
//! correct image-relative values, and registers the patched table with
//! the OS unwinder.

use object::{File, Object, ObjectSection, ObjectSymbol, RelocationKind, RelocationTarget,
    SectionIndex};

use crate::fatal;
use crate::image::{ImageMemory, SectionKind};
use crate::obj::{self, LoadedObject};
use crate::resolver::SymbolTable;

const SEH_HANDLER_SYMBOL: &str = "__C_specific_handler";

pub(crate) struct SehSnapshot {
    pdata: Option<(SectionIndex, Vec<u8>)>,
    xdata: Option<(SectionIndex, Vec<u8>)>,
}

/// Copies the raw unwind sections aside before relocation clobbers their
/// image-relative slots with truncated absolute addresses.
pub(crate) fn snapshot(object: &File<'_>) -> SehSnapshot {
    let copy = |name: &str| {
        object.section_by_name(name).and_then(|section| {
            let data = section.data().ok()?;
            Some((section.index(), data.to_vec()))
        })
    };
    SehSnapshot {
        pdata: copy(".pdata"),
        xdata: copy(".xdata"),
    }
}

pub(crate) fn apply_fixups(
    image: &mut ImageMemory,
    object: &File<'_>,
    loaded: &LoadedObject,
    snapshot: SehSnapshot,
    resolver: &SymbolTable,
) {
    let Some((pdata_index, pdata_copy)) = snapshot.pdata else {
        return;
    };

    let Some(handler) = resolver.resolve(SEH_HANDLER_SYMBOL) else {
        fatal!("no binding for the exception handler {SEH_HANDLER_SYMBOL:?}");
    };

    // jmp [rip+0] followed by the handler's absolute address.
    let trampoline_offset = image.allocate(SectionKind::Code, 16, 16);
    let mut trampoline = [0u8; 16];
    trampoline[0] = 0xFF;
    trampoline[1] = 0x25;
    trampoline[6..14].copy_from_slice(&(handler as u64).to_le_bytes());
    // Safety: freshly allocated, permissions not final yet.
    unsafe { image.slice_mut(trampoline_offset, 16) }.copy_from_slice(&trampoline);
    let trampoline_addr = image.base_addr() + trampoline_offset;

    let mut fixup_section = |index: SectionIndex, original: &[u8]| {
        let Some(offset) = loaded.section_offset(index) else {
            return;
        };
        // Restore the pre-relocation bytes, then redo every slot as a
        // proper image-relative offset.
        // Safety: the section was placed at `offset` and the image is not
        // finalized.
        unsafe { image.slice_mut(offset, original.len()) }.copy_from_slice(original);

        let section = match object.section_by_index(index) {
            Ok(section) => section,
            Err(err) => fatal!("lost unwind section during fixup: {err}"),
        };
        for (slot_offset, relocation) in section.relocations() {
            if relocation.kind() != RelocationKind::ImageOffset || relocation.size() != 32 {
                fatal!(
                    "unsupported relocation {:?} in unwind section",
                    relocation.kind()
                );
            }

            let target = match relocation.target() {
                RelocationTarget::Symbol(symbol_index) => {
                    let symbol = match object.symbol_by_index(symbol_index) {
                        Ok(symbol) => symbol,
                        Err(err) => fatal!("malformed relocation symbol: {err}"),
                    };
                    if symbol.is_undefined()
                        && symbol.name().is_ok_and(|name| name == SEH_HANDLER_SYMBOL)
                    {
                        // The handler is reachable only through the
                        // trampoline.
                        trampoline_addr as u64
                    } else {
                        obj::resolve_target(object, image, loaded, resolver, relocation.target())
                    }
                }
                other => obj::resolve_target(object, image, loaded, resolver, other),
            };

            let slot = offset + slot_offset as usize;
            // Safety: the slot lies inside the restored section.
            let place = unsafe { image.slice_mut(slot, 4) };
            let addend = u32::from_le_bytes(place[..4].try_into().unwrap());
            let image_relative = target
                .wrapping_add(u64::from(addend))
                .wrapping_sub(image.base_addr() as u64);
            let Ok(image_relative) = u32::try_from(image_relative) else {
                fatal!("unwind fixup target lies outside the image");
            };
            place.copy_from_slice(&image_relative.to_le_bytes());
        }
    };

    fixup_section(pdata_index, &pdata_copy);
    if let Some((xdata_index, xdata_copy)) = snapshot.xdata {
        fixup_section(xdata_index, &xdata_copy);
    }

    if let Some(pdata_addr) = loaded.section_addr(image, pdata_index) {
        image.register_eh_frames(pdata_addr, pdata_copy.len());
    }
}
