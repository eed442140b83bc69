//! Variable-length integer framing primitives.
//!
//! Unsigned integers use the standard LEB128-style layout: seven payload bits
//! per byte, least significant group first, high bit set on every byte except
//! the last. Byte strings are a varint length followed by the raw bytes;
//! strings are UTF-8 byte strings.
//!
//! ```text
//! 300 = 0b1_0010_1100  →  [0xAC, 0x02]
//! ```

use crate::error::ProtocolError;

/// Longest varint accepted for a `u64` (ceil(64 / 7)).
const MAX_VARINT_LEN: usize = 10;

/// Append-only frame writer.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_var(&mut self, mut value: u64) -> &mut Self {
        while value >= 0x80 {
            self.buf.push((value as u8 & 0x7F) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
        self
    }

    /// Length-prefixed byte string.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_var(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn write_string(&mut self, s: &str) -> &mut Self {
        self.write_bytes(s.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Zero-copy frame reader over a borrowed slice.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_var(&mut self) -> Result<u64, ProtocolError> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = *self.buf.get(self.pos).ok_or(ProtocolError::UnexpectedEof)?;
            self.pos += 1;

            let group = u64::from(byte & 0x7F);
            // The tenth byte may only carry the single remaining bit.
            if i == MAX_VARINT_LEN - 1 && group > 1 {
                return Err(ProtocolError::VarIntOverflow);
            }
            value |= group << (7 * i);

            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::VarIntOverflow)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_var()?;
        let len = usize::try_from(len).map_err(|_| ProtocolError::UnexpectedEof)?;
        if len > self.remaining() {
            return Err(ProtocolError::UnexpectedEof);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_string(&mut self) -> Result<&'a str, ProtocolError> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}
