//! # Spill Segments
//!
//! Sequential, write-once byte streams on secondary storage holding the
//! pages of a spilled partition (one segment for the build side, one for
//! the probe side).
//!
//! # On-disk layout
//!
//! ```text
//! [SegmentHeader][HEADER_CRC32_LE]
//! [BlockHeader][STORED_BYTES]
//! [BlockHeader][STORED_BYTES]
//! ...
//! ```
//!
//! - **Segment header**: magic `HJSG`, format version, codec tag, and the
//!   page size of the writer, followed by a CRC32 of those bytes.
//! - **Block header**: raw (uncompressed) length, stored length, codec of
//!   this block, and a CRC32 computed over the stored bytes.
//! - **Stored bytes**: one or more whole page payloads, either verbatim or
//!   compressed with zstd.
//!
//! A block is filled with page payloads up to the configured block size and
//! is never split inside a page. Since a page holds whole records, every
//! block decodes to whole records on its own.
//!
//! # Compression
//!
//! Compression is a transport detail. When it is enabled each block is
//! compressed independently, and stored verbatim if compression would not
//! shrink it. Record order within a segment is unaffected.
//!
//! # Durability and failure
//!
//! A segment is only valid once [`SegmentWriter::close`] succeeded, which
//! flushes and syncs the file. A writer dropped without `close` deletes its
//! partial file. A [`SpilledSegment`] deletes its file when dropped.

#[cfg(test)]
mod tests;

mod reader;
mod writer;

pub use reader::SegmentReader;
pub use writer::SegmentWriter;

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{self, Decode, Encode, EncodingError, FieldReader};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Segment magic.
pub const SEGMENT_MAGIC: [u8; 4] = *b"HJSG";

/// Current segment format version.
pub const SEGMENT_VERSION: u32 = 1;

/// Encoded size of [`SegmentHeader`] plus its CRC.
pub(crate) const SEGMENT_HEADER_SIZE: usize = 4 + 4 + 1 + 4 + 4;

/// Encoded size of [`BlockHeader`].
pub(crate) const BLOCK_HEADER_SIZE: usize = 4 + 4 + 1 + 4;

const CODEC_NONE: u8 = 0;
const CODEC_ZSTD: u8 = 1;

/// Sequence for spill directory names, unique within the process.
static SPILL_DIR_SEQ: AtomicU64 = AtomicU64::new(0);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by spill segment I/O.
#[derive(Debug, Error)]
pub enum SpillError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Header encoding or decoding failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Segment header failed validation.
    #[error("invalid segment header: {0}")]
    InvalidHeader(String),

    /// A block's stored bytes do not match its checksum.
    #[error("checksum mismatch in block at offset {offset}")]
    ChecksumMismatch {
        /// File offset of the block header.
        offset: usize,
    },

    /// Structurally invalid segment contents.
    #[error("corrupt segment: {0}")]
    Corrupt(String),

    /// The background writer thread stopped.
    #[error("spill writer failed: {0}")]
    WriterFailed(String),
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Block codec of a spill segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillCodec {
    /// Blocks are stored verbatim.
    None,
    /// Blocks are compressed with zstd at the given level.
    Zstd {
        /// Compression level (1..=22).
        level: i32,
    },
}

impl SpillCodec {
    fn tag(self) -> u8 {
        match self {
            SpillCodec::None => CODEC_NONE,
            SpillCodec::Zstd { .. } => CODEC_ZSTD,
        }
    }
}

/// How spill segments are written.
#[derive(Debug, Clone)]
pub struct SpillOptions {
    pub codec: SpillCodec,

    /// Target size of one block before compression. Blocks never split a
    /// page, so a block may exceed this by less than one page.
    pub block_size: usize,

    /// Hand blocks to a background writer thread instead of writing inline.
    pub async_io: bool,
}

// ------------------------------------------------------------------------------------------------
// Headers
// ------------------------------------------------------------------------------------------------

/// Fixed header at the start of every segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub codec: u8,
    pub page_size: u32,
}

impl Encode for SegmentHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.codec.encode_to(buf)?;
        self.page_size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SegmentHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut fields = FieldReader::new(buf);
        let header = Self {
            magic: fields.read()?,
            version: fields.read()?,
            codec: fields.read()?,
            page_size: fields.read()?,
        };
        Ok((header, fields.position()))
    }
}

/// Header in front of every block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    pub raw_len: u32,
    pub stored_len: u32,
    pub codec: u8,
    pub crc: u32,
}

impl Encode for BlockHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.raw_len.encode_to(buf)?;
        self.stored_len.encode_to(buf)?;
        self.codec.encode_to(buf)?;
        self.crc.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut fields = FieldReader::new(buf);
        let header = Self {
            raw_len: fields.read()?,
            stored_len: fields.read()?,
            codec: fields.read()?,
            crc: fields.read()?,
        };
        Ok((header, fields.position()))
    }
}

/// CRC32 of `data`.
#[inline]
pub(crate) fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Encodes a segment header followed by its CRC.
pub(crate) fn encode_segment_header(header: &SegmentHeader) -> Result<Vec<u8>, SpillError> {
    let mut bytes = encoding::encode_to_vec(header)?;
    let crc = checksum(&bytes);
    crc.encode_to(&mut bytes)?;
    Ok(bytes)
}

// ------------------------------------------------------------------------------------------------
// Spilled segment
// ------------------------------------------------------------------------------------------------

/// A closed, durable spill segment.
///
/// Owns its file: dropping the value deletes it.
pub struct SpilledSegment {
    path: PathBuf,
    blocks: u64,
    raw_bytes: u64,
    stored_bytes: u64,
}

impl SpilledSegment {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of blocks in the segment.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Sum of page payload bytes written.
    pub fn raw_bytes(&self) -> u64 {
        self.raw_bytes
    }

    /// Bytes on disk, headers included.
    pub fn stored_bytes(&self) -> u64 {
        self.stored_bytes
    }

    /// Opens a sequential reader over the segment's records.
    pub fn open_reader(&self) -> Result<SegmentReader, SpillError> {
        SegmentReader::open(&self.path)
    }
}

impl fmt::Debug for SpilledSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpilledSegment")
            .field("path", &self.path)
            .field("blocks", &self.blocks)
            .field("stored_bytes", &self.stored_bytes)
            .finish()
    }
}

impl Drop for SpilledSegment {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "spill segment deleted"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to delete spill segment: {e}"),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Spill directory
// ------------------------------------------------------------------------------------------------

/// Which input a segment holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Build,
    Probe,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Build => f.write_str("build"),
            Side::Probe => f.write_str("probe"),
        }
    }
}

/// A private directory holding one join's spill segments.
///
/// Created on first use under `root`, removed by [`remove_all`](Self::remove_all)
/// or on drop.
pub struct SpillDirectory {
    root: PathBuf,
    dir: Option<PathBuf>,
    next_file: u64,
}

impl SpillDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dir: None,
            next_file: 0,
        }
    }

    /// The directory, if it has been created.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// A fresh file path for a segment of partition `partition` at `level`.
    pub fn next_segment_path(
        &mut self,
        level: u32,
        partition: usize,
        side: Side,
    ) -> Result<PathBuf, SpillError> {
        let dir = self.ensure_dir()?;
        let id = self.next_file;
        self.next_file += 1;
        Ok(dir.join(format!("l{level}-p{partition}-{side}-{id:06}.spill")))
    }

    fn ensure_dir(&mut self) -> Result<PathBuf, SpillError> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        fs::create_dir_all(&self.root)?;
        loop {
            let seq = SPILL_DIR_SEQ.fetch_add(1, Ordering::Relaxed);
            let candidate = self
                .root
                .join(format!("hybridjoin-{}-{seq}", process::id()));
            match fs::create_dir(&candidate) {
                Ok(()) => {
                    debug!(path = %candidate.display(), "spill directory created");
                    self.dir = Some(candidate.clone());
                    return Ok(candidate);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Removes the directory and everything left in it. Idempotent.
    pub fn remove_all(&mut self) {
        if let Some(dir) = self.dir.take() {
            match fs::remove_dir_all(&dir) {
                Ok(()) => debug!(path = %dir.display(), "spill directory removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %dir.display(), "failed to remove spill directory: {e}"),
            }
        }
    }
}

impl Drop for SpillDirectory {
    fn drop(&mut self) {
        self.remove_all();
    }
}
