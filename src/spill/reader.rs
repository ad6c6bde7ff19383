//! Spill segment reader.
//!
//! The segment is memory-mapped and walked block by block. Stored blocks
//! are served straight from the mapping; compressed blocks are decoded into
//! a reusable buffer. Records are handed out as borrowed slices that stay
//! valid until the next call to [`SegmentReader::next_record`].

use std::{fs::File, path::Path};

use memmap2::Mmap;
use tracing::trace;

use super::{
    BLOCK_HEADER_SIZE, BlockHeader, CODEC_NONE, CODEC_ZSTD, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC,
    SEGMENT_VERSION, SegmentHeader, SpillError, checksum,
};
use crate::encoding::Decode;
use crate::record::RecordHeader;

/// Where the current block's raw bytes live.
#[derive(Clone, Copy)]
enum Current {
    Mapped { start: usize, end: usize },
    Decoded,
}

/// Sequential reader over the records of one spill segment.
pub struct SegmentReader {
    mmap: Mmap,
    header: SegmentHeader,
    /// File offset of the next block header.
    pos: usize,
    current: Current,
    decoded: Vec<u8>,
    /// Offset of the next record inside the current block.
    cursor: usize,
    blocks_read: u64,
}

impl SegmentReader {
    /// Maps the segment at `path` and validates its header.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { Mmap::map(...) }`. Segments are write-once: a file is
    /// only opened for reading after its writer was closed and synced, and
    /// nothing writes to it afterwards. Every block boundary is checked
    /// against the mapping before slicing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SpillError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < SEGMENT_HEADER_SIZE {
            return Err(SpillError::InvalidHeader("file too small".into()));
        }

        let header_len = SEGMENT_HEADER_SIZE - 4;
        let (header, _) = SegmentHeader::decode_from(&mmap[..header_len])?;
        let (stored_crc, _) = u32::decode_from(&mmap[header_len..SEGMENT_HEADER_SIZE])?;
        if stored_crc != checksum(&mmap[..header_len]) {
            return Err(SpillError::InvalidHeader("header checksum mismatch".into()));
        }
        if header.magic != SEGMENT_MAGIC {
            return Err(SpillError::InvalidHeader("magic mismatch".into()));
        }
        if header.version != SEGMENT_VERSION {
            return Err(SpillError::InvalidHeader(format!(
                "unsupported version {}",
                header.version
            )));
        }
        if header.codec != CODEC_NONE && header.codec != CODEC_ZSTD {
            return Err(SpillError::InvalidHeader(format!(
                "unknown codec {}",
                header.codec
            )));
        }

        Ok(Self {
            mmap,
            header,
            pos: SEGMENT_HEADER_SIZE,
            current: Current::Decoded,
            decoded: Vec::new(),
            cursor: 0,
            blocks_read: 0,
        })
    }

    /// Page size of the writer that produced the segment.
    pub fn page_size(&self) -> usize {
        self.header.page_size as usize
    }

    pub fn blocks_read(&self) -> u64 {
        self.blocks_read
    }

    /// Returns the next `(key, row)` pair, or `None` at the end of the
    /// segment.
    pub fn next_record(&mut self) -> Result<Option<(i64, &[u8])>, SpillError> {
        while self.cursor >= self.current_block().len() {
            if !self.load_next_block()? {
                return Ok(None);
            }
        }

        let (key, start, end) = {
            let block = self.current_block();
            let (header, n) = RecordHeader::decode_from(&block[self.cursor..])?;
            let start = self.cursor + n;
            let end = start
                .checked_add(header.len as usize)
                .filter(|&end| end <= block.len())
                .ok_or_else(|| {
                    SpillError::Corrupt(format!(
                        "record of {} bytes overruns its block",
                        header.len
                    ))
                })?;
            (header.key, start, end)
        };
        self.cursor = end;
        Ok(Some((key, &self.current_block()[start..end])))
    }

    fn current_block(&self) -> &[u8] {
        match self.current {
            Current::Mapped { start, end } => &self.mmap[start..end],
            Current::Decoded => &self.decoded,
        }
    }

    /// Moves to the next block. Returns `false` at the end of the segment.
    fn load_next_block(&mut self) -> Result<bool, SpillError> {
        let offset = self.pos;
        let file_len = self.mmap.len();
        if offset == file_len {
            return Ok(false);
        }
        if file_len - offset < BLOCK_HEADER_SIZE {
            return Err(SpillError::Corrupt(format!(
                "truncated block header at offset {offset}"
            )));
        }

        let (header, n) = BlockHeader::decode_from(&self.mmap[offset..])?;
        let start = offset + n;
        let end = start + header.stored_len as usize;
        if end > file_len {
            return Err(SpillError::Corrupt(format!(
                "truncated block at offset {offset}"
            )));
        }
        let stored = &self.mmap[start..end];
        if checksum(stored) != header.crc {
            return Err(SpillError::ChecksumMismatch { offset });
        }

        self.current = match header.codec {
            CODEC_NONE => {
                if header.raw_len != header.stored_len {
                    return Err(SpillError::Corrupt(format!(
                        "stored block at offset {offset} has mismatched lengths"
                    )));
                }
                Current::Mapped { start, end }
            }
            CODEC_ZSTD => {
                let raw_len = header.raw_len as usize;
                self.decoded = zstd::bulk::decompress(stored, raw_len).map_err(|e| {
                    SpillError::Corrupt(format!("block at offset {offset}: {e}"))
                })?;
                if self.decoded.len() != raw_len {
                    return Err(SpillError::Corrupt(format!(
                        "block at offset {offset} decoded to {} bytes, expected {raw_len}",
                        self.decoded.len()
                    )));
                }
                Current::Decoded
            }
            other => {
                return Err(SpillError::Corrupt(format!(
                    "unknown codec {other} in block at offset {offset}"
                )));
            }
        };

        trace!(offset, raw_len = header.raw_len, "spill block loaded");
        self.pos = end;
        self.cursor = 0;
        self.blocks_read += 1;
        Ok(true)
    }
}
