// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide mapping from instruction addresses to loaded modules.
//!
//! Lookup is two ordered searches: the registry maps each image's
//! one-past-the-end address to its module, and each module maps each
//! function's one-past-the-end address to its record. The global mutex is
//! held only long enough to clone a module handle; the per-module map is
//! immutable after construction and needs no lock, so lookups are safe
//! from stack walkers and unwinding paths on any thread.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, PoisonError};

use crate::module::{JitFunction, LoadedModule};

static ADDRESS_TO_MODULE: Mutex<BTreeMap<usize, Arc<LoadedModule>>> =
    Mutex::new(BTreeMap::new());

fn map() -> std::sync::MutexGuard<'static, BTreeMap<usize, Arc<LoadedModule>>> {
    // Lookups must keep working during unwinding, even if a panic poisoned
    // the lock.
    ADDRESS_TO_MODULE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn register(module: Arc<LoadedModule>) {
    let previous = map().insert(module.image_end(), module);
    debug_assert!(previous.is_none(), "overlapping module images");
}

pub(crate) fn unregister(module: &LoadedModule) {
    map().remove(&module.image_end());
}

/// The JIT function whose code range contains `address`, or `None` for an
/// address outside every live module.
pub fn function_for_address(address: usize) -> Option<Arc<JitFunction>> {
    let module = {
        let map = map();
        let (_, module) = map
            .range((Bound::Excluded(address), Bound::Unbounded))
            .next()?;
        Arc::clone(module)
    };
    module.function_containing(address)
}
