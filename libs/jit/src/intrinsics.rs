// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Host functions generated code may call directly: the C memory routines
//! the backend emits for bulk operations, and float rounding helpers with
//! the C calling convention.

unsafe extern "C" fn floorf32(x: f32) -> f32 {
    x.floor()
}
unsafe extern "C" fn ceilf32(x: f32) -> f32 {
    x.ceil()
}
unsafe extern "C" fn truncf32(x: f32) -> f32 {
    x.trunc()
}
unsafe extern "C" fn nearbyintf32(x: f32) -> f32 {
    x.round_ties_even()
}
unsafe extern "C" fn floorf64(x: f64) -> f64 {
    x.floor()
}
unsafe extern "C" fn ceilf64(x: f64) -> f64 {
    x.ceil()
}
unsafe extern "C" fn truncf64(x: f64) -> f64 {
    x.trunc()
}
unsafe extern "C" fn nearbyintf64(x: f64) -> f64 {
    x.round_ties_even()
}

#[cfg(all(windows, target_arch = "x86_64"))]
unsafe extern "C" {
    fn __C_specific_handler();
}

pub(crate) fn lookup(name: &str) -> Option<usize> {
    let address = match name {
        "memcpy" => libc::memcpy as usize,
        "memmove" => libc::memmove as usize,
        "memset" => libc::memset as usize,
        "floorf" => floorf32 as usize,
        "ceilf" => ceilf32 as usize,
        "truncf" => truncf32 as usize,
        "nearbyintf" => nearbyintf32 as usize,
        "floor" => floorf64 as usize,
        "ceil" => ceilf64 as usize,
        "trunc" => truncf64 as usize,
        "nearbyint" => nearbyintf64 as usize,
        #[cfg(all(windows, target_arch = "x86_64"))]
        "__C_specific_handler" => __C_specific_handler as usize,
        _ => return None,
    };
    Some(address)
}
