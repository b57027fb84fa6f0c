// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Resolution of a compiled object's undefined symbols against the
//! host-provided import bindings, with a fallback to the built-in
//! intrinsics table.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::intrinsics;

/// An immutable name-to-address mapping built by the load driver before
/// the object is opened. Queried concurrently by relocation processing;
/// never mutated afterwards.
#[derive(Debug, Default)]
pub struct SymbolTable {
    map: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to `address`. Two bindings for the same name mean the
    /// import vectors disagree with the compiled object, which is a bug in
    /// the caller.
    pub fn insert(&mut self, name: String, address: usize) {
        match self.map.entry(name) {
            Entry::Occupied(entry) => panic!("duplicate symbol {:?}", entry.key()),
            Entry::Vacant(entry) => {
                entry.insert(address);
            }
        }
    }

    /// Looks up `name`, falling back to the intrinsics table. Returns
    /// `None` for a symbol neither the imports nor the intrinsics provide.
    pub fn resolve(&self, name: &str) -> Option<usize> {
        if let Some(&address) = self.map.get(name) {
            // The backend reserves zero to mean "unresolved".
            assert_ne!(address, 0, "symbol {name:?} bound to the null address");
            return Some(address);
        }
        intrinsics::lookup(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imports_win_over_intrinsics() {
        let mut table = SymbolTable::new();
        table.insert("memcpy".to_string(), 0x1234);
        assert_eq!(table.resolve("memcpy"), Some(0x1234));
    }

    #[test]
    fn intrinsics_fill_the_gaps() {
        let table = SymbolTable::new();
        assert_eq!(table.resolve("memcpy"), Some(libc::memcpy as usize));
        assert_eq!(table.resolve("no-such-symbol"), None);
    }

    #[test]
    #[should_panic(expected = "duplicate symbol")]
    fn duplicate_bindings_fail_loudly() {
        let mut table = SymbolTable::new();
        table.insert("functionImport0".to_string(), 0x1000);
        table.insert("functionImport0".to_string(), 0x2000);
    }

    #[test]
    #[should_panic(expected = "null address")]
    fn the_null_address_is_reserved() {
        let mut table = SymbolTable::new();
        table.insert("functionImport0".to_string(), 0);
        table.resolve("functionImport0");
    }
}
