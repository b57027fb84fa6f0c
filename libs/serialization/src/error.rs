// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use thiserror::Error;

/// Errors raised by the codec.
///
/// All of them indicate input that cannot be (de)serialized; none of them
/// leave the process in an inconsistent state, so callers are free to catch
/// them and surface an I/O failure to their user.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A read demanded more bytes than the stream holds.
    #[error("expected data but found end of stream")]
    UnexpectedEof,
    /// The final byte of a LEB sequence uses bits beyond the bit budget.
    #[error("Invalid LEB encoding: invalid final byte")]
    InvalidFinalByte,
    /// A value fell outside the inclusive range the caller demanded.
    ///
    /// The bounds are carried as `i128` so a single variant covers the full
    /// unsigned and signed 64-bit ranges.
    #[error("out-of-range value: {min} <= {value} <= {max}")]
    OutOfRange { min: i128, value: i128, max: i128 },
    /// A decoded constant did not match the expected one.
    #[error("{message}: loaded {loaded} but was expecting {expected}")]
    ConstantMismatch {
        message: &'static str,
        loaded: u64,
        expected: u64,
    },
    /// A string's bytes were not valid UTF-8.
    #[error("invalid UTF-8 in string")]
    InvalidString,
}

pub type Result<T> = core::result::Result<T, Error>;
