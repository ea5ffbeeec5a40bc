//! XDR (External Data Representation) codec as specified in RFC 4506.
//!
//! All XDR data is big-endian and aligned to 4-byte boundaries. The encoder
//! appends to a growable buffer and keeps it 4-byte aligned after every
//! call; the decoder walks a borrowed byte slice and fails with
//! [`XdrError::Underflow`] when a read would run past the end of the input.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// Alignment unit for all XDR items.
const ALIGNMENT: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum XdrError {
    /// A read would exceed the end of the input buffer.
    #[error("XDR decode: buffer underflow")]
    Underflow,
    /// A length prefix or discriminant carried a value the decoder cannot
    /// represent.
    #[error("XDR decode: invalid value ({0})")]
    InvalidValue(&'static str),
}

pub type XdrResult<T> = Result<T, XdrError>;

/// Append-only XDR encoder over a growable byte buffer.
#[derive(Debug, Default)]
pub struct XdrEncoder {
    buf: Vec<u8>,
}

impl XdrEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
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

    fn pad_to_alignment(&mut self) {
        while self.buf.len() % ALIGNMENT != 0 {
            self.buf.push(0);
        }
    }

    pub fn encode_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn encode_i32(&mut self, v: i32) {
        self.encode_u32(v as u32);
    }

    pub fn encode_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn encode_i64(&mut self, v: i64) {
        self.encode_u64(v as u64);
    }

    pub fn encode_bool(&mut self, v: bool) {
        self.encode_u32(u32::from(v));
    }

    /// Fixed-length opaque: raw bytes, zero-padded to a 4-byte multiple.
    pub fn encode_opaque_fixed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.pad_to_alignment();
    }

    /// Variable-length opaque: u32 length prefix, bytes, zero padding.
    pub fn encode_opaque(&mut self, data: &[u8]) {
        self.encode_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self.pad_to_alignment();
    }

    /// XDR string: variable-length opaque over the UTF-8 bytes.
    pub fn encode_string(&mut self, s: &str) {
        self.encode_opaque(s.as_bytes());
    }
}

/// Cursor-based XDR decoder over a borrowed byte slice.
#[derive(Debug)]
pub struct XdrDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> XdrDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn check(&self, n: usize) -> XdrResult<()> {
        if self.pos.checked_add(n).is_none_or(|end| end > self.data.len()) {
            return Err(XdrError::Underflow);
        }
        Ok(())
    }

    fn skip_pad(&mut self) -> XdrResult<()> {
        let rem = self.pos % ALIGNMENT;
        if rem != 0 {
            self.check(ALIGNMENT - rem)?;
            self.pos += ALIGNMENT - rem;
        }
        Ok(())
    }

    pub fn decode_u32(&mut self) -> XdrResult<u32> {
        self.check(4)?;
        let v = BigEndian::read_u32(&self.data[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    pub fn decode_i32(&mut self) -> XdrResult<i32> {
        Ok(self.decode_u32()? as i32)
    }

    pub fn decode_u64(&mut self) -> XdrResult<u64> {
        self.check(8)?;
        let v = BigEndian::read_u64(&self.data[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    pub fn decode_i64(&mut self) -> XdrResult<i64> {
        Ok(self.decode_u64()? as i64)
    }

    pub fn decode_bool(&mut self) -> XdrResult<bool> {
        Ok(self.decode_u32()? != 0)
    }

    pub fn decode_opaque_fixed(&mut self, out: &mut [u8]) -> XdrResult<()> {
        self.check(out.len())?;
        out.copy_from_slice(&self.data[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        self.skip_pad()
    }

    pub fn decode_opaque(&mut self) -> XdrResult<Vec<u8>> {
        let len = self.decode_u32()? as usize;
        self.check(len)?;
        let out = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        self.skip_pad()?;
        Ok(out)
    }

    pub fn decode_string(&mut self) -> XdrResult<String> {
        let bytes = self.decode_opaque()?;
        String::from_utf8(bytes).map_err(|_| XdrError::InvalidValue("string is not UTF-8"))
    }

    /// Consume and return everything left in the input.
    pub fn take_remaining(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

/// Decode a length-prefixed bitmap (array of u32 words).
pub fn decode_bitmap(dec: &mut XdrDecoder<'_>) -> XdrResult<Vec<u32>> {
    let count = dec.decode_u32()? as usize;
    let mut bm = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        bm.push(dec.decode_u32()?);
    }
    Ok(bm)
}

/// Encode a bitmap, trimming trailing zero words first.
pub fn encode_bitmap(enc: &mut XdrEncoder, bm: &[u32]) {
    let mut len = bm.len();
    while len > 0 && bm[len - 1] == 0 {
        len -= 1;
    }
    enc.encode_u32(len as u32);
    for word in &bm[..len] {
        enc.encode_u32(*word);
    }
}

/// Set bit `bit` in a bitmap, growing the word array as needed.
pub fn bitmap_set(bm: &mut Vec<u32>, bit: u32) {
    let word = (bit / 32) as usize;
    if bm.len() <= word {
        bm.resize(word + 1, 0);
    }
    bm[word] |= 1 << (bit % 32);
}

/// Test bit `bit` in a bitmap.
pub fn bitmap_isset(bm: &[u32], bit: u32) -> bool {
    let word = (bit / 32) as usize;
    bm.get(word).is_some_and(|w| w & (1 << (bit % 32)) != 0)
}
