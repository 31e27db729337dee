//! Protocol codec
//!
//! Bounds-checked primitives shared by every header, record and table.
//!
//! ## Conventions
//! - Multi-byte integers are little-endian regardless of host byte order.
//! - Nothing is read from a peer buffer before its size has been checked
//!   against the declared layout.
//! - Variable strings live after a fixed record and are addressed by a
//!   `{length: u16, offset: u16}` slot; the offset is relative to the first
//!   byte of the owning record and the bytes are NUL-terminated.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{HapiError, Result};

/// A fixed-size structure with a byte-exact little-endian layout
pub trait WireLayout: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Name used in error messages.
    const NAME: &'static str;

    /// Append the encoded form to `buf`.
    fn write_to(&self, buf: &mut BytesMut);

    /// Decode from `src`, which the caller guarantees holds at least `SIZE` bytes.
    fn read_from(src: &[u8]) -> Result<Self>;

    /// Decode from the front of `src`, checking its length first.
    fn decode(src: &[u8]) -> Result<Self> {
        ensure_len(src, Self::SIZE, Self::NAME)?;
        Self::read_from(&src[..Self::SIZE])
    }

    /// Encode into a fresh buffer.
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.write_to(&mut buf);
        buf.freeze()
    }
}

/// Fail with `ShortBuffer` unless `buf` holds at least `need` bytes.
#[inline]
pub fn ensure_len(buf: &[u8], need: usize, context: &'static str) -> Result<()> {
    if buf.len() < need {
        return Err(HapiError::short_buffer(need, buf.len(), context));
    }
    Ok(())
}

/// Decode the fixed `B` that follows header `H` in `buffer`.
///
/// `additional` is the number of bytes the caller expects to follow `B`
/// (for example the declared size of trailing strings). The whole span is
/// checked before any field of `B` is read.
pub fn decode_body<H: WireLayout, B: WireLayout>(buffer: &[u8], additional: usize) -> Result<B> {
    let need = H::SIZE
        .checked_add(B::SIZE)
        .and_then(|n| n.checked_add(additional))
        .ok_or_else(|| HapiError::InvalidArg(format!("{} size overflow", B::NAME)))?;
    ensure_len(buffer, need, B::NAME)?;
    B::read_from(&buffer[H::SIZE..H::SIZE + B::SIZE])
}

/// Bytes of `buffer` following header `H`.
pub fn body_after<H: WireLayout>(buffer: &[u8]) -> Result<&[u8]> {
    ensure_len(buffer, H::SIZE, H::NAME)?;
    Ok(&buffer[H::SIZE..])
}

/// Resolve a `{offset, length}` slot against the reference point `head`.
///
/// The slot must point inside `buffer` and the byte after the string must be
/// the NUL terminator.
pub fn read_cstring(buffer: &[u8], head: usize, offset: u16, length: u16) -> Result<String> {
    let start = head + offset as usize;
    let end = start + length as usize;
    // Terminator included
    ensure_len(buffer, end + 1, "variable string")?;
    if buffer[end] != 0 {
        return Err(HapiError::InvalidArg(format!(
            "string at offset {} is not NUL-terminated",
            offset
        )));
    }
    String::from_utf8(buffer[start..end].to_vec())
        .map_err(|e| HapiError::InvalidArg(format!("string at offset {}: {}", offset, e)))
}

/// Append `value` plus its terminator and return the `(offset, length)` slot
/// relative to `head`.
pub fn write_cstring(buf: &mut BytesMut, head: usize, value: &str) -> Result<(u16, u16)> {
    let offset = u16::try_from(buf.len() - head)
        .map_err(|_| HapiError::InvalidArg("variable string offset exceeds 65535".to_string()))?;
    let length = u16::try_from(value.len()).map_err(|_| {
        HapiError::InvalidArg(format!("string of {} bytes is too long", value.len()))
    })?;
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Ok((offset, length))
}

/// Overwrite two bytes at `pos` with `value` (little-endian).
#[inline]
pub(crate) fn patch_u16_le(buf: &mut BytesMut, pos: usize, value: u16) {
    buf[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
}

/// Overwrite four bytes at `pos` with `value` (little-endian).
#[inline]
pub(crate) fn patch_u32_le(buf: &mut BytesMut, pos: usize, value: u32) {
    buf[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}
