// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Streaming binary serialization for compiled WebAssembly modules.
//!
//! The wire format is built from three layers: raw little-endian values,
//! LEB128 variable-length integers with a per-call bit budget and value
//! range, and composites (strings and homogeneous sequences) expressed in
//! terms of the first two.
//!
//! Writing goes through an [`OutputStream`], an extensible byte buffer:
//!
//! ```
//! use serialization::OutputStream;
//!
//! let mut out = OutputStream::new();
//! out.write_var_u32(16384).unwrap();
//! assert_eq!(out.finish(), vec![0x80, 0x80, 0x01]);
//! ```
//!
//! Reading goes through an [`InputStream`] over borrowed bytes:
//!
//! ```
//! use serialization::InputStream;
//!
//! let mut input = InputStream::new(&[0x80, 0x80, 0x01]);
//! assert_eq!(input.read_var_u32().unwrap(), 16384);
//! ```
//!
//! Every violation (truncated input, an over-long or over-wide encoding, a
//! value outside the caller's range) surfaces as a typed [`Error`] so the
//! caller can report a malformed module instead of aborting.

mod error;
mod stream;
mod varint;

pub use error::{Error, Result};
pub use stream::{InputStream, OutputStream};
pub use varint::{read_signed, read_unsigned, write_signed, write_unsigned};
