//! Binary record layout shared by partition pages and spill segments.
//!
//! ```text
//! [key: i64 LE][next: u64 LE][len: u32 LE][row bytes ...]
//! ```
//!
//! - `key` is the join key extracted once at ingestion.
//! - `next` chains build records that share a key inside one resident
//!   partition ([`NO_NEXT`] terminates). It carries no meaning on the probe
//!   side or once a page has been spilled.
//! - A record never straddles a page, so a page payload, and therefore any
//!   spill block built from whole pages, holds whole records only.

use crate::encoding::{Decode, EncodingError, FieldReader};
use crate::memory::Page;

/// Size of the fixed record header.
pub(crate) const RECORD_HEADER_SIZE: usize = 8 + 8 + 4;

/// Chain terminator for `next`.
pub(crate) const NO_NEXT: u64 = u64::MAX;

// ------------------------------------------------------------------------------------------------
// Record header
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub key: i64,
    pub next: u64,
    pub len: u32,
}

impl RecordHeader {
    /// Reads a header from in-memory page bytes written by [`PageBuf::append`].
    ///
    /// `buf` must start at a record boundary inside the used part of a page.
    #[inline]
    pub fn read(buf: &[u8]) -> Self {
        let mut key = [0u8; 8];
        let mut next = [0u8; 8];
        let mut len = [0u8; 4];
        key.copy_from_slice(&buf[0..8]);
        next.copy_from_slice(&buf[8..16]);
        len.copy_from_slice(&buf[16..20]);
        Self {
            key: i64::from_le_bytes(key),
            next: u64::from_le_bytes(next),
            len: u32::from_le_bytes(len),
        }
    }

    #[inline]
    fn write(&self, dst: &mut [u8]) {
        dst[0..8].copy_from_slice(&self.key.to_le_bytes());
        dst[8..16].copy_from_slice(&self.next.to_le_bytes());
        dst[16..20].copy_from_slice(&self.len.to_le_bytes());
    }
}

// Replayed spill blocks come from disk and are decoded defensively.
impl Decode for RecordHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut fields = FieldReader::new(buf);
        let header = Self {
            key: fields.read()?,
            next: fields.read()?,
            len: fields.read()?,
        };
        Ok((header, fields.position()))
    }
}

// ------------------------------------------------------------------------------------------------
// Record address
// ------------------------------------------------------------------------------------------------

/// Location of a record inside one partition: `(page_index << 32) | offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordAddress(pub u64);

impl RecordAddress {
    #[inline]
    pub fn new(page: usize, offset: usize) -> Self {
        Self(((page as u64) << 32) | offset as u64)
    }

    #[inline]
    pub fn page(self) -> usize {
        (self.0 >> 32) as usize
    }

    #[inline]
    pub fn offset(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    pub fn is_end(self) -> bool {
        self.0 == NO_NEXT
    }
}

// ------------------------------------------------------------------------------------------------
// Page buffer
// ------------------------------------------------------------------------------------------------

/// A page being filled with records, plus its fill level.
pub(crate) struct PageBuf {
    page: Page,
    len: usize,
}

impl PageBuf {
    pub fn new(page: Page) -> Self {
        Self { page, len: 0 }
    }

    /// Bytes still free at the end of the page.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.page.size() - self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The used part of the page: a run of whole records.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.page.as_slice()[..self.len]
    }

    /// Appends a record with an unset chain pointer and returns its offset.
    ///
    /// The caller checks `remaining() >= RECORD_HEADER_SIZE + row.len()`.
    pub fn append(&mut self, key: i64, row: &[u8]) -> usize {
        let offset = self.len;
        let header = RecordHeader {
            key,
            next: NO_NEXT,
            len: row.len() as u32,
        };
        let dst = self.page.as_mut_slice();
        header.write(&mut dst[offset..offset + RECORD_HEADER_SIZE]);
        let start = offset + RECORD_HEADER_SIZE;
        dst[start..start + row.len()].copy_from_slice(row);
        self.len = start + row.len();
        offset
    }

    /// Header and row bytes of the record at `offset`.
    #[inline]
    pub fn record_at(&self, offset: usize) -> (RecordHeader, &[u8]) {
        let bytes = self.page.as_slice();
        let header = RecordHeader::read(&bytes[offset..]);
        let start = offset + RECORD_HEADER_SIZE;
        (header, &bytes[start..start + header.len as usize])
    }

    /// Rewrites the chain pointer of the record at `offset`.
    #[inline]
    pub fn set_next(&mut self, offset: usize, next: u64) {
        self.page.as_mut_slice()[offset + 8..offset + 16].copy_from_slice(&next.to_le_bytes());
    }

    /// Offsets of every record in the page, in insertion order.
    pub fn offsets(&self) -> RecordOffsets<'_> {
        RecordOffsets { buf: self, pos: 0 }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn into_page(self) -> Page {
        self.page
    }
}

/// Iterator over record offsets of a [`PageBuf`].
pub(crate) struct RecordOffsets<'a> {
    buf: &'a PageBuf,
    pos: usize,
}

impl Iterator for RecordOffsets<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.pos >= self.buf.len {
            return None;
        }
        let offset = self.pos;
        let header = RecordHeader::read(&self.buf.page.as_slice()[offset..]);
        self.pos = offset + RECORD_HEADER_SIZE + header.len as usize;
        Some(offset)
    }
}
