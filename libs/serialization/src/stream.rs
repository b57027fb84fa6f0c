// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{Error, Result, varint};

/// An extensible output byte buffer.
///
/// Bytes in `[0, cursor)` are finalized, bytes in `[cursor, capacity)` are
/// scratch. [`OutputStream::advance`] hands out scratch and moves the
/// cursor; [`OutputStream::finish`] truncates to the cursor and transfers
/// the buffer by move.
#[derive(Debug, Default)]
pub struct OutputStream {
    bytes: Vec<u8>,
    next: usize,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of finalized bytes.
    pub fn len(&self) -> usize {
        self.next
    }

    pub fn is_empty(&self) -> bool {
        self.next == 0
    }

    /// Allocated buffer size, including scratch beyond the cursor.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Reserves `num_bytes` at the cursor and returns the writable scratch,
    /// advancing the cursor past it.
    pub fn advance(&mut self, num_bytes: usize) -> &mut [u8] {
        if self.next + num_bytes > self.bytes.len() {
            self.extend_buffer(num_bytes);
        }
        debug_assert!(self.next + num_bytes <= self.bytes.len());

        let start = self.next;
        self.next += num_bytes;
        &mut self.bytes[start..start + num_bytes]
    }

    // Grow the buffer by larger and larger increments so the time spent
    // growing is amortized O(1).
    fn extend_buffer(&mut self, num_bytes: usize) {
        let new_len = usize::max(self.next + num_bytes, self.bytes.len() * 7 / 5 + 32);
        self.bytes.resize(new_len, 0);
    }

    /// Truncates to the finalized bytes and moves them out.
    pub fn finish(mut self) -> Vec<u8> {
        self.bytes.truncate(self.next);
        self.bytes
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.advance(bytes.len()).copy_from_slice(bytes);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.advance(1)[0] = value;
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// A var-uint-32 byte count followed by the raw bytes.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        varint::write_unsigned(self, value.len() as u64, 0, u64::from(u32::MAX))?;
        self.write_bytes(value.as_bytes());
        Ok(())
    }

    /// A var-uint-32 element count followed by each element, encoded by
    /// `write_element`.
    pub fn write_seq<T>(
        &mut self,
        items: &[T],
        mut write_element: impl FnMut(&mut Self, &T) -> Result<()>,
    ) -> Result<()> {
        varint::write_unsigned(self, items.len() as u64, 0, u64::from(u32::MAX))?;
        for item in items {
            write_element(self, item)?;
        }
        Ok(())
    }
}

/// A bounded read-only view of a byte range with a cursor.
///
/// A demand for more bytes than remain fails with
/// [`Error::UnexpectedEof`].
#[derive(Debug)]
pub struct InputStream<'a> {
    bytes: &'a [u8],
    next: usize,
}

impl<'a> InputStream<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, next: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.next
    }

    /// Returns the next `num_bytes` without moving the cursor.
    pub fn peek(&self, num_bytes: usize) -> Result<&'a [u8]> {
        if self.remaining() < num_bytes {
            return Err(Error::UnexpectedEof);
        }
        Ok(&self.bytes[self.next..self.next + num_bytes])
    }

    /// Returns the next `num_bytes` and moves the cursor past them.
    pub fn advance(&mut self, num_bytes: usize) -> Result<&'a [u8]> {
        let data = self.peek(num_bytes)?;
        self.next += num_bytes;
        Ok(data)
    }

    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        dst.copy_from_slice(self.advance(dst.len())?);
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.advance(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.advance(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.advance(8)?.try_into().unwrap()))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.advance(1)?[0] as i8)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.advance(4)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.advance(8)?.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.advance(4)?.try_into().unwrap()))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.advance(8)?.try_into().unwrap()))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_var_u32()? as usize;
        let bytes = self.advance(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidString)
    }

    pub fn read_seq<T>(
        &mut self,
        mut read_element: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        let len = self.read_var_u32()? as usize;
        // Cap the pre-reservation; a hostile count fails at read time.
        let mut items = Vec::with_capacity(len.min(1 << 16));
        for _ in 0..len {
            items.push(read_element(self)?);
        }
        Ok(items)
    }

    /// Reads a fixed-width value and fails unless it matches `expected`.
    pub fn expect_u32(&mut self, expected: u32, message: &'static str) -> Result<()> {
        let loaded = self.read_u32()?;
        if loaded != expected {
            return Err(Error::ConstantMismatch {
                message,
                loaded: u64::from(loaded),
                expected: u64::from(expected),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_hands_out_scratch_and_finish_truncates() {
        let mut out = OutputStream::new();
        out.advance(3).copy_from_slice(&[1, 2, 3]);
        assert_eq!(out.len(), 3);
        assert!(out.capacity() >= 3);
        assert_eq!(out.finish(), vec![1, 2, 3]);
    }

    #[test]
    fn growth_is_amortized() {
        let mut out = OutputStream::new();
        let mut reallocations = 0;
        let mut capacity = out.capacity();
        for i in 0..10_000u32 {
            out.write_u8(i as u8);
            if out.capacity() != capacity {
                capacity = out.capacity();
                reallocations += 1;
            }
        }
        assert_eq!(out.len(), 10_000);
        // 7/5 growth reaches 10k bytes in well under 32 steps.
        assert!(reallocations <= 32, "{reallocations} reallocations");
        let bytes = out.finish();
        assert_eq!(bytes.len(), 10_000);
        assert_eq!(bytes[255], 255);
    }

    #[test]
    fn fixed_width_round_trip() {
        let mut out = OutputStream::new();
        out.write_u8(0xAB);
        out.write_u32(0xDEAD_BEEF);
        out.write_u64(u64::MAX - 1);
        out.write_i32(-12345);
        out.write_i64(i64::MIN);
        out.write_f32(1.5);
        out.write_f64(-0.25);
        let bytes = out.finish();

        let mut input = InputStream::new(&bytes);
        assert_eq!(input.read_u8().unwrap(), 0xAB);
        assert_eq!(input.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(input.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(input.read_i32().unwrap(), -12345);
        assert_eq!(input.read_i64().unwrap(), i64::MIN);
        assert_eq!(input.read_f32().unwrap(), 1.5);
        assert_eq!(input.read_f64().unwrap(), -0.25);
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn little_endian_on_the_wire() {
        let mut out = OutputStream::new();
        out.write_u32(0x0102_0304);
        assert_eq!(out.finish(), vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn peek_does_not_consume() {
        let bytes = [1u8, 2, 3];
        let mut input = InputStream::new(&bytes);
        assert_eq!(input.peek(2).unwrap(), &[1, 2]);
        assert_eq!(input.remaining(), 3);
        assert_eq!(input.advance(2).unwrap(), &[1, 2]);
        assert_eq!(input.remaining(), 1);
    }

    #[test]
    fn underflow_is_a_typed_fault() {
        let mut input = InputStream::new(&[1, 2]);
        assert_eq!(input.peek(3).unwrap_err(), Error::UnexpectedEof);
        assert_eq!(input.read_u32().unwrap_err(), Error::UnexpectedEof);
        // The failed read did not consume anything.
        assert_eq!(input.advance(2).unwrap(), &[1, 2]);
    }

    #[test]
    fn string_round_trip() {
        let mut out = OutputStream::new();
        out.write_string("hello, wasm").unwrap();
        let bytes = out.finish();
        assert_eq!(bytes[0], 11);

        let mut input = InputStream::new(&bytes);
        assert_eq!(input.read_string().unwrap(), "hello, wasm");
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let mut input = InputStream::new(&[2, 0xFF, 0xFE]);
        assert_eq!(input.read_string().unwrap_err(), Error::InvalidString);
    }

    #[test]
    fn truncated_string_is_eof() {
        let mut input = InputStream::new(&[5, b'a', b'b']);
        assert_eq!(input.read_string().unwrap_err(), Error::UnexpectedEof);
    }

    #[test]
    fn seq_round_trip() {
        let values = [3u32, 0, 0xFFFF_FFFF];
        let mut out = OutputStream::new();
        out.write_seq(&values, |out, v| out.write_var_u32(*v)).unwrap();
        let bytes = out.finish();

        let mut input = InputStream::new(&bytes);
        let decoded = input.read_seq(|input| input.read_var_u32()).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn constant_mismatch() {
        let mut out = OutputStream::new();
        out.write_u32(0x6D73_6100);
        let bytes = out.finish();

        let mut input = InputStream::new(&bytes);
        let err = input.expect_u32(0x1234_5678, "bad magic number").unwrap_err();
        assert_eq!(
            err,
            Error::ConstantMismatch {
                message: "bad magic number",
                loaded: 0x6D73_6100,
                expected: 0x1234_5678,
            }
        );

        let mut input = InputStream::new(&bytes);
        input.expect_u32(0x6D73_6100, "bad magic number").unwrap();
    }
}
