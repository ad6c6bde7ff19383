//! Spill segment writer: sequential, block-framed, optionally compressed
//! and optionally asynchronous.
//!
//! Page payloads are staged into a block buffer. When the next payload would
//! overflow the block size the block is framed (`[BlockHeader][stored]`) and
//! handed to the sink. The synchronous sink writes through a `BufWriter`;
//! the asynchronous sink ships frames over a bounded channel to a dedicated
//! writer thread, so the caller only blocks when the queue is full.

use std::{
    borrow::Cow,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    mem,
    path::{Path, PathBuf},
    thread,
};

use crossbeam::channel::{self, Sender};
use tracing::{debug, trace, warn};

use super::{
    BlockHeader, SEGMENT_MAGIC, SEGMENT_VERSION, SegmentHeader, SpillCodec, SpillError,
    SpillOptions, SpilledSegment, checksum, encode_segment_header,
};
use crate::encoding::{Encode, len_to_u32};

/// Frames queued ahead of the background writer.
const ASYNC_QUEUE_DEPTH: usize = 4;

// ------------------------------------------------------------------------------------------------
// Sinks
// ------------------------------------------------------------------------------------------------

enum Sink {
    Sync(BufWriter<File>),
    Async(AsyncSink),
}

struct AsyncSink {
    sender: Option<Sender<Vec<u8>>>,
    worker: Option<thread::JoinHandle<std::io::Result<()>>>,
}

impl AsyncSink {
    fn spawn(file: File) -> Result<Self, SpillError> {
        let (sender, receiver) = channel::bounded::<Vec<u8>>(ASYNC_QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name("hybridjoin-spill".into())
            .spawn(move || {
                let mut out = BufWriter::new(file);
                for frame in receiver {
                    out.write_all(&frame)?;
                }
                out.flush()?;
                out.get_ref().sync_data()
            })?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Drops the sender and waits for the worker to drain the queue.
    fn join(&mut self) -> Result<(), SpillError> {
        drop(self.sender.take());
        match self.worker.take() {
            Some(worker) => match worker.join() {
                Ok(result) => result.map_err(SpillError::from),
                Err(_) => Err(SpillError::WriterFailed("writer thread panicked".into())),
            },
            None => Ok(()),
        }
    }
}

impl Sink {
    fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), SpillError> {
        match self {
            Sink::Sync(out) => {
                out.write_all(&frame)?;
                Ok(())
            }
            Sink::Async(sink) => {
                let sent = match &sink.sender {
                    Some(sender) => sender.send(frame).is_ok(),
                    None => false,
                };
                if sent {
                    return Ok(());
                }
                // The worker hung up; its own error is the useful one.
                sink.join()?;
                Err(SpillError::WriterFailed(
                    "writer thread exited early".into(),
                ))
            }
        }
    }

    fn finish(&mut self) -> Result<(), SpillError> {
        match self {
            Sink::Sync(out) => {
                out.flush()?;
                out.get_ref().sync_data()?;
                Ok(())
            }
            Sink::Async(sink) => sink.join(),
        }
    }
}

impl Drop for AsyncSink {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            warn!("abandoned spill writer failed: {e}");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentWriter
// ------------------------------------------------------------------------------------------------

/// Writes one spill segment. See the [module-level documentation](super).
pub struct SegmentWriter {
    path: PathBuf,
    sink: Option<Sink>,
    codec: SpillCodec,
    block_size: usize,
    staging: Vec<u8>,
    blocks: u64,
    raw_bytes: u64,
    stored_bytes: u64,
}

impl SegmentWriter {
    /// Creates the segment file and writes its header.
    ///
    /// The file must not exist yet.
    pub fn create(
        path: impl AsRef<Path>,
        options: &SpillOptions,
        page_size: usize,
    ) -> Result<Self, SpillError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;

        let header = SegmentHeader {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            codec: options.codec.tag(),
            page_size: len_to_u32(page_size)?,
        };
        let header_bytes = encode_segment_header(&header)?;

        let sink = if options.async_io {
            Sink::Async(AsyncSink::spawn(file)?)
        } else {
            Sink::Sync(BufWriter::new(file))
        };

        let mut writer = Self {
            path,
            sink: Some(sink),
            codec: options.codec,
            block_size: options.block_size,
            staging: Vec::with_capacity(options.block_size.max(page_size)),
            blocks: 0,
            raw_bytes: 0,
            stored_bytes: 0,
        };
        writer.stored_bytes = header_bytes.len() as u64;
        writer.sink_mut()?.write_frame(header_bytes)?;

        debug!(path = %writer.path.display(), codec = ?writer.codec, "spill segment opened");
        Ok(writer)
    }

    /// Appends one page payload (a run of whole records).
    pub fn write_page(&mut self, payload: &[u8]) -> Result<(), SpillError> {
        if payload.is_empty() {
            return Ok(());
        }
        if !self.staging.is_empty() && self.staging.len() + payload.len() > self.block_size {
            self.flush_block()?;
        }
        self.staging.extend_from_slice(payload);
        self.raw_bytes += payload.len() as u64;
        if self.staging.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Payload bytes accepted so far.
    pub fn raw_bytes(&self) -> u64 {
        self.raw_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes staged data, syncs the file, and turns the writer into a
    /// durable [`SpilledSegment`].
    pub fn close(mut self) -> Result<SpilledSegment, SpillError> {
        if !self.staging.is_empty() {
            self.flush_block()?;
        }
        self.sink_mut()?.finish()?;
        self.sink = None;

        debug!(
            path = %self.path.display(),
            blocks = self.blocks,
            raw_bytes = self.raw_bytes,
            stored_bytes = self.stored_bytes,
            "spill segment closed"
        );

        Ok(SpilledSegment {
            path: mem::take(&mut self.path),
            blocks: self.blocks,
            raw_bytes: self.raw_bytes,
            stored_bytes: self.stored_bytes,
        })
    }

    fn sink_mut(&mut self) -> Result<&mut Sink, SpillError> {
        self.sink
            .as_mut()
            .ok_or_else(|| SpillError::WriterFailed("segment already closed".into()))
    }

    fn flush_block(&mut self) -> Result<(), SpillError> {
        let (codec, stored): (SpillCodec, Cow<'_, [u8]>) = match self.codec {
            SpillCodec::None => (SpillCodec::None, Cow::Borrowed(self.staging.as_slice())),
            SpillCodec::Zstd { level } => {
                let compressed = zstd::bulk::compress(&self.staging, level)?;
                if compressed.len() < self.staging.len() {
                    (self.codec, Cow::Owned(compressed))
                } else {
                    (SpillCodec::None, Cow::Borrowed(self.staging.as_slice()))
                }
            }
        };

        let header = BlockHeader {
            raw_len: len_to_u32(self.staging.len())?,
            stored_len: len_to_u32(stored.len())?,
            codec: codec.tag(),
            crc: checksum(&stored),
        };
        let mut frame = Vec::with_capacity(super::BLOCK_HEADER_SIZE + stored.len());
        header.encode_to(&mut frame)?;
        frame.extend_from_slice(&stored);
        drop(stored);

        trace!(
            raw_len = header.raw_len,
            stored_len = header.stored_len,
            "spill block written"
        );

        self.stored_bytes += frame.len() as u64;
        self.blocks += 1;
        self.staging.clear();
        self.sink_mut()?.write_frame(frame)
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        // Only an unclosed writer still owns a sink; its file is partial.
        if self.sink.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), "failed to delete partial spill segment: {e}");
            } else {
                debug!(path = %self.path.display(), "partial spill segment discarded");
            }
        }
    }
}
