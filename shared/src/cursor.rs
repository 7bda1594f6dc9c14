//! Bounds-checked little-endian reader/writer over plain byte slices.
//!
//! Every multi-byte read goes through [`ByteCursor::take`], so a short buffer
//! turns into a [`Truncated`] error instead of an out-of-bounds access.

use thiserror::Error;

use crate::utf16;

/// Word width of the producer, used for pointer-sized fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordWidth {
    Bits32,
    Bits64,
}

impl WordWidth {
    /// Width of the platform this binary was built for.
    pub const fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            WordWidth::Bits64
        } else {
            WordWidth::Bits32
        }
    }

    pub const fn bytes(self) -> usize {
        match self {
            WordWidth::Bits32 => 4,
            WordWidth::Bits64 => 8,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("truncated input: need {need} bytes at offset {at}, buffer holds {len}")]
pub struct Truncated {
    pub need: usize,
    pub at: usize,
    pub len: usize,
}

pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Truncated> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len());
        match end {
            Some(end) => {
                let out = &self.buf[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(Truncated { need: n, at: self.pos, len: self.buf.len() }),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Truncated> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), Truncated> {
        self.take(n).map(|_| ())
    }

    pub fn read_u16(&mut self) -> Result<u16, Truncated> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, Truncated> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32, Truncated> {
        self.array().map(i32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, Truncated> {
        self.array().map(u64::from_le_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64, Truncated> {
        self.array().map(i64::from_le_bytes)
    }

    /// Pointer-sized unsigned value, widened to `u64`.
    pub fn read_word(&mut self, width: WordWidth) -> Result<u64, Truncated> {
        match width {
            WordWidth::Bits32 => self.read_u32().map(u64::from),
            WordWidth::Bits64 => self.read_u64(),
        }
    }

    /// `wchar_t[capacity]` field; consumes the whole field regardless of the NUL.
    pub fn read_wide(&mut self, capacity: usize) -> Result<String, Truncated> {
        self.take(capacity * 2).map(utf16::decode_le_bytes)
    }

    /// Fixed-size ASCII field, NUL-terminated or full.
    pub fn read_ascii(&mut self, capacity: usize) -> Result<String, Truncated> {
        let raw = self.take(capacity)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

/// Append-only counterpart of [`ByteCursor`].
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn with_capacity(n: usize) -> Self {
        Self { buf: Vec::with_capacity(n) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Pointer-sized value; truncated to 32 bits on the 32-bit layout.
    pub fn put_word(&mut self, v: u64, width: WordWidth) -> &mut Self {
        match width {
            WordWidth::Bits32 => self.put_u32(v as u32),
            WordWidth::Bits64 => self.put_u64(v),
        }
    }

    pub fn put_wide(&mut self, s: &str, capacity: usize) -> &mut Self {
        self.buf.extend_from_slice(&utf16::encode_le_bytes(s, capacity));
        self
    }

    pub fn put_ascii(&mut self, s: &str, capacity: usize) -> &mut Self {
        let bytes = s.as_bytes();
        let n = bytes.len().min(capacity);
        self.buf.extend_from_slice(&bytes[..n]);
        self.zeros(capacity - n)
    }

    pub fn zeros(&mut self, n: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + n, 0);
        self
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields_in_order() {
        let mut w = ByteWriter::default();
        w.put_i32(-7).put_u64(0xdead_beef_0000_0001).put_word(0x1234, WordWidth::Bits32);
        let bytes = w.into_inner();
        assert_eq!(bytes.len(), 16);

        let mut c = ByteCursor::new(&bytes);
        assert_eq!(c.read_i32().unwrap(), -7);
        assert_eq!(c.read_u64().unwrap(), 0xdead_beef_0000_0001);
        assert_eq!(c.read_word(WordWidth::Bits32).unwrap(), 0x1234);
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn short_buffer_reports_truncation() {
        let bytes = [1u8, 2, 3];
        let mut c = ByteCursor::new(&bytes);
        let err = c.read_u32().unwrap_err();
        assert_eq!(err, Truncated { need: 4, at: 0, len: 3 });
        // a failed read does not move the cursor
        assert_eq!(c.position(), 0);
    }

    #[test]
    fn ascii_field_round_trips() {
        let mut w = ByteWriter::default();
        w.put_ascii("abc", 8);
        let bytes = w.into_inner();
        assert_eq!(bytes.len(), 8);
        assert_eq!(ByteCursor::new(&bytes).read_ascii(8).unwrap(), "abc");
    }
}
