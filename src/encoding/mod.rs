//! Little-endian encoding of spill metadata.
//!
//! Spill segments carry three fixed-layout structures: the segment header,
//! one header per block, and one header per record. Each is written field
//! by field through [`Encode`] and read back through [`Decode`], usually
//! via a [`FieldReader`] that tracks the offset between fields.
//!
//! # Wire format
//!
//! | Rust type  | Encoding                                     |
//! |------------|----------------------------------------------|
//! | `u8`       | 1 byte                                       |
//! | `u32`      | 4 bytes, little-endian                       |
//! | `u64`      | 8 bytes, little-endian                       |
//! | `i64`      | 8 bytes, little-endian, two's complement     |
//! | `[u8; N]`  | `N` raw bytes, no length prefix              |
//!
//! Structures have no padding and no length prefix; their size is implied
//! by the segment version.
//!
//! Decoding never panics on short input. Data read back from disk may be
//! truncated, so every read is bounds-checked and reported as
//! [`EncodingError::UnexpectedEof`].

#[cfg(test)]
mod tests;

use std::mem::size_of;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while encoding or decoding spill metadata.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ended in the middle of a field.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes the field requires.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// A length does not fit its 32-bit field.
    #[error("length {0} does not fit in 32 bits")]
    LengthOverflow(usize),
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// Appends the wire form of `self` to a buffer.
pub trait Encode {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Reads a value from the start of a buffer.
///
/// Returns the value and the number of bytes it occupied. Trailing bytes
/// are left alone.
pub trait Decode: Sized {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Encodes `value` into a new buffer.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Narrows a length to its `u32` wire field.
#[inline]
pub fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len).map_err(|_| EncodingError::LengthOverflow(len))
}

// ------------------------------------------------------------------------------------------------
// Field reader
// ------------------------------------------------------------------------------------------------

/// Sequential decoder over one buffer.
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Decodes the next field.
    #[inline]
    pub fn read<T: Decode>(&mut self) -> Result<T, EncodingError> {
        let rest = self.buf.get(self.pos..).unwrap_or_default();
        let (value, n) = T::decode_from(rest)?;
        self.pos += n;
        Ok(value)
    }

    /// Bytes consumed so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }
}

#[inline]
fn take<const N: usize>(buf: &[u8]) -> Result<[u8; N], EncodingError> {
    match buf.get(..N) {
        Some(bytes) => {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes);
            Ok(out)
        }
        None => Err(EncodingError::UnexpectedEof {
            needed: N,
            available: buf.len(),
        }),
    }
}

// ------------------------------------------------------------------------------------------------
// Implementations
// ------------------------------------------------------------------------------------------------

macro_rules! le_integer {
    ($($ty:ty),* $(,)?) => {$(
        impl Encode for $ty {
            #[inline]
            fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                buf.extend_from_slice(&self.to_le_bytes());
                Ok(())
            }
        }

        impl Decode for $ty {
            #[inline]
            fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
                const N: usize = size_of::<$ty>();
                Ok((<$ty>::from_le_bytes(take::<N>(buf)?), N))
            }
        }
    )*};
}

le_integer!(u8, u32, u64, i64);

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        Ok((take::<N>(buf)?, N))
    }
}
