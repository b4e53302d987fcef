//! Deterministic binary coding for on-disk persistence.
//!
//! Every persistent format in StratumDB (write-ahead log, table files,
//! MANIFEST edits, write batches) is assembled from the primitives in this
//! module. Because the crate owns this format, the on-disk representation
//! **never** changes due to a dependency upgrade.
//!
//! # Wire format
//!
//! | Primitive       | Encoding                                        |
//! |-----------------|-------------------------------------------------|
//! | `fixed32`       | 4 bytes, little-endian                          |
//! | `fixed64`       | 8 bytes, little-endian                          |
//! | `varint32`      | LEB128, 1–5 bytes, 7 value bits per byte        |
//! | `varint64`      | LEB128, 1–10 bytes                              |
//! | length-prefixed | `varint32 len` followed by `len` raw bytes      |
//!
//! Multi-byte integers are **little-endian** throughout. Varints store the
//! low 7 bits per byte with the high bit set on every byte except the last.
//!
//! # Zero-panic guarantee
//!
//! No function in this module uses `unwrap()`, `expect()`, or indexing that
//! can go out of bounds. Truncated or malformed input is reported through
//! [`EncodingError`].


use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while decoding wire data.
#[derive(Debug, Clone, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A varint ran past its maximum width without terminating.
    #[error("malformed varint: no terminator within {max_width} bytes")]
    MalformedVarint {
        /// Maximum legal byte width for this varint flavor.
        max_width: usize,
    },

    /// A decoded length field points past the end of the buffer.
    #[error("length prefix {len} exceeds remaining buffer ({available} bytes)")]
    BadLengthPrefix {
        /// The decoded length.
        len: usize,
        /// Bytes actually remaining after the prefix.
        available: usize,
    },
}

/// Verify that `buf` has at least `needed` bytes.
#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Fixed-width integers
// ------------------------------------------------------------------------------------------------

/// Append a little-endian `u32`.
#[inline]
pub fn put_fixed32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a little-endian `u64`.
#[inline]
pub fn put_fixed64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Decode a little-endian `u32` from the start of `buf`.
#[inline]
pub fn get_fixed32(buf: &[u8]) -> Result<u32, EncodingError> {
    require(buf, 4)?;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[..4]);
    Ok(u32::from_le_bytes(bytes))
}

/// Decode a little-endian `u64` from the start of `buf`.
#[inline]
pub fn get_fixed64(buf: &[u8]) -> Result<u64, EncodingError> {
    require(buf, 8)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    Ok(u64::from_le_bytes(bytes))
}

// ------------------------------------------------------------------------------------------------
// Varints
// ------------------------------------------------------------------------------------------------

/// Maximum encoded width of a varint32.
pub const MAX_VARINT32_WIDTH: usize = 5;

/// Maximum encoded width of a varint64.
pub const MAX_VARINT64_WIDTH: usize = 10;

/// Append a varint-encoded `u32`.
#[inline]
pub fn put_varint32(buf: &mut Vec<u8>, value: u32) {
    put_varint64(buf, u64::from(value));
}

/// Append a varint-encoded `u64`.
pub fn put_varint64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decode a varint-encoded `u32` from the start of `buf`.
///
/// Returns `(value, bytes_consumed)` so callers can advance a cursor.
#[inline]
pub fn get_varint32(buf: &[u8]) -> Result<(u32, usize), EncodingError> {
    let (value, consumed) = get_varint_raw(buf, MAX_VARINT32_WIDTH)?;
    Ok((value as u32, consumed))
}

/// Decode a varint-encoded `u64` from the start of `buf`.
///
/// Returns `(value, bytes_consumed)`.
#[inline]
pub fn get_varint64(buf: &[u8]) -> Result<(u64, usize), EncodingError> {
    get_varint_raw(buf, MAX_VARINT64_WIDTH)
}

fn get_varint_raw(buf: &[u8], max_width: usize) -> Result<(u64, usize), EncodingError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().take(max_width).enumerate() {
        if byte < 0x80 {
            result |= u64::from(byte) << shift;
            return Ok((result, i + 1));
        }
        result |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }
    if buf.len() < max_width {
        Err(EncodingError::UnexpectedEof {
            needed: buf.len() + 1,
            available: buf.len(),
        })
    } else {
        Err(EncodingError::MalformedVarint { max_width })
    }
}

/// Number of bytes `put_varint64` would emit for `value`.
#[inline]
pub fn varint_length(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

// ------------------------------------------------------------------------------------------------
// Length-prefixed slices
// ------------------------------------------------------------------------------------------------

/// Append `varint32(data.len())` followed by the raw bytes of `data`.
#[inline]
pub fn put_length_prefixed_slice(buf: &mut Vec<u8>, data: &[u8]) {
    put_varint32(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

/// Decode a length-prefixed slice from the start of `buf`.
///
/// Returns `(slice, bytes_consumed)`; the slice borrows from `buf`.
pub fn get_length_prefixed_slice(buf: &[u8]) -> Result<(&[u8], usize), EncodingError> {
    let (len, prefix) = get_varint32(buf)?;
    let len = len as usize;
    let rest = &buf[prefix..];
    if rest.len() < len {
        return Err(EncodingError::BadLengthPrefix {
            len,
            available: rest.len(),
        });
    }
    Ok((&rest[..len], prefix + len))
}
