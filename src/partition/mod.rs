//! # Partitions
//!
//! A partition is one disjoint slice of the key space at one recursion
//! level. It starts out **resident**: build records are appended to pages it
//! owns, and at the end of the build phase a [`BucketDirectory`] is laid
//! over those pages. Under memory pressure it may become **spilled**: its
//! pages are written to a build-side [`SegmentWriter`] and released, except
//! one page kept as a write buffer. A spilled partition stays spilled for
//! the rest of its set's lifetime. Probe records routed to it are buffered
//! into the same page and written to a probe-side segment.
//!
//! When the probe phase of its set ends, a spilled partition is detached
//! as a [`SpilledPartition`]: both closed segments plus the counts the
//! recursion controller needs to decide how to process it.
//!
//! All pages flow through the [`Workspace`]'s [`MemoryBudget`]; every path
//! out of a partition (spill, finish, release) hands its pages back.

#[cfg(test)]
mod tests;

mod bucket;
mod set;

pub(crate) use bucket::BucketDirectory;
pub(crate) use set::{PartitionSet, ProbeOutcome};

use std::fmt;

use bloomfilter::Bloom;
use tracing::{debug, warn};

use crate::memory::{MemoryBudget, Page};
use crate::record::{PageBuf, RECORD_HEADER_SIZE, RecordAddress, RecordHeader};
use crate::spill::{
    SegmentWriter, Side, SpillDirectory, SpillError, SpillOptions, SpilledSegment,
};
use crate::{JoinError, JoinStats};

/// False positive rate of probe-side bloom filters.
const PROBE_BLOOM_FP_RATE: f64 = 0.01;

// ------------------------------------------------------------------------------------------------
// Workspace
// ------------------------------------------------------------------------------------------------

/// Resources shared by every partition of one join.
pub(crate) struct Workspace {
    pub memory: MemoryBudget,
    pub spill_dir: SpillDirectory,
    pub spill_options: SpillOptions,
    /// Build a bloom filter over each spilled partition's build keys.
    pub bloom_filter: bool,
    pub stats: JoinStats,
}

impl Workspace {
    fn open_segment(
        &mut self,
        level: u32,
        partition: usize,
        side: Side,
    ) -> Result<SegmentWriter, SpillError> {
        let path = self.spill_dir.next_segment_path(level, partition, side)?;
        let writer = SegmentWriter::create(path, &self.spill_options, self.memory.page_size())?;
        self.stats.spill_files += 1;
        Ok(writer)
    }
}

// ------------------------------------------------------------------------------------------------
// Partition
// ------------------------------------------------------------------------------------------------

struct SpillState {
    /// Write buffer for whichever side is currently being spilled.
    buffer: PageBuf,
    build_writer: Option<SegmentWriter>,
    build: Option<SpilledSegment>,
    /// Page payloads written to the build segment.
    build_pages: usize,
    probe_writer: Option<SegmentWriter>,
    bloom: Option<Bloom<i64>>,
}

impl SpillState {
    /// Writes the buffer to the probe segment, opening it on first use.
    fn flush_probe(
        &mut self,
        ws: &mut Workspace,
        level: u32,
        partition: usize,
    ) -> Result<(), JoinError> {
        if self.probe_writer.is_none() {
            self.probe_writer = Some(ws.open_segment(level, partition, Side::Probe)?);
        }
        if let Some(writer) = self.probe_writer.as_mut() {
            writer.write_page(self.buffer.payload())?;
        }
        self.buffer.clear();
        Ok(())
    }
}

pub(crate) struct Partition {
    index: usize,
    level: u32,
    pages: Vec<PageBuf>,
    directory: Option<BucketDirectory>,
    spill: Option<SpillState>,
    build_records: u64,
    probe_records: u64,
}

impl Partition {
    pub fn new(index: usize, level: u32) -> Self {
        Self {
            index,
            level,
            pages: Vec::new(),
            directory: None,
            spill: None,
            build_records: 0,
            probe_records: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// Record pages held while resident.
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    /// Every page held: record pages, directory pages, and the spill buffer.
    pub fn held_pages(&self) -> usize {
        self.pages.len()
            + self.directory.as_ref().map_or(0, BucketDirectory::page_count)
            + usize::from(self.spill.is_some())
    }

    pub fn build_records(&self) -> u64 {
        self.build_records
    }

    pub fn probe_records(&self) -> u64 {
        self.probe_records
    }

    /// Appends a build record without acquiring memory.
    ///
    /// Returns `false` when a resident partition needs another page first.
    pub fn try_append_build(&mut self, key: i64, row: &[u8]) -> Result<bool, JoinError> {
        let need = RECORD_HEADER_SIZE + row.len();
        match &mut self.spill {
            Some(spill) => {
                if spill.buffer.remaining() < need {
                    let writer = spill.build_writer.as_mut().ok_or_else(|| {
                        SpillError::WriterFailed("build segment already closed".into())
                    })?;
                    writer.write_page(spill.buffer.payload())?;
                    spill.build_pages += 1;
                    spill.buffer.clear();
                }
                spill.buffer.append(key, row);
            }
            None => match self.pages.last_mut() {
                Some(page) if page.remaining() >= need => {
                    page.append(key, row);
                }
                _ => return Ok(false),
            },
        }
        self.build_records += 1;
        Ok(true)
    }

    /// Adds an empty record page.
    pub fn push_page(&mut self, page: Page) {
        self.pages.push(PageBuf::new(page));
    }

    /// Writes the resident pages to a new build segment and releases all
    /// but one of them, which becomes the spill buffer.
    ///
    /// Returns the number of pages released.
    pub fn spill(&mut self, ws: &mut Workspace) -> Result<usize, JoinError> {
        if self.spill.is_some() || self.pages.is_empty() {
            return Ok(0);
        }

        let mut writer = ws.open_segment(self.level, self.index, Side::Build)?;
        for page in &self.pages {
            writer.write_page(page.payload())?;
        }

        let build_pages = self.pages.len();
        let mut pages = std::mem::take(&mut self.pages);
        let Some(mut buffer) = pages.pop() else {
            return Ok(0);
        };
        buffer.clear();
        let freed = pages.len();
        ws.memory.release_all(pages.into_iter().map(PageBuf::into_page));

        self.spill = Some(SpillState {
            buffer,
            build_writer: Some(writer),
            build: None,
            build_pages,
            probe_writer: None,
            bloom: None,
        });
        ws.stats.spilled_partitions += 1;

        debug!(
            level = self.level,
            partition = self.index,
            records = self.build_records,
            pages = build_pages,
            "partition spilled"
        );
        Ok(freed)
    }

    /// Closes the build segment of a spilled partition. No-op when resident.
    pub fn finish_build(&mut self, ws: &mut Workspace) -> Result<(), JoinError> {
        let Some(spill) = self.spill.as_mut() else {
            return Ok(());
        };
        let Some(mut writer) = spill.build_writer.take() else {
            return Ok(());
        };
        if !spill.buffer.is_empty() {
            writer.write_page(spill.buffer.payload())?;
            spill.build_pages += 1;
            spill.buffer.clear();
        }
        let segment = writer.close()?;
        ws.stats.spilled_bytes += segment.stored_bytes();

        if ws.bloom_filter && self.build_records > 0 {
            spill.bloom = build_key_filter(&segment, self.build_records)?;
        }
        spill.build = Some(segment);
        Ok(())
    }

    /// Directory pages a resident partition needs at the end of the build.
    pub fn directory_pages_needed(&self, page_size: usize) -> usize {
        if self.spill.is_some() {
            return 0;
        }
        BucketDirectory::pages_needed(self.build_records, page_size)
    }

    /// Indexes the resident pages. No-op for spilled or empty partitions.
    pub fn build_directory(&mut self, ws: &mut Workspace) -> Result<(), JoinError> {
        if self.spill.is_some() || self.build_records == 0 || self.directory.is_some() {
            return Ok(());
        }

        let needed = BucketDirectory::pages_needed(self.build_records, ws.memory.page_size());
        let mut pages = Vec::with_capacity(needed);
        for _ in 0..needed {
            match ws.memory.acquire() {
                Ok(page) => pages.push(page),
                Err(e) => {
                    ws.memory.release_all(pages);
                    return Err(e.into());
                }
            }
        }

        let mut directory = BucketDirectory::new(pages, self.build_records);
        for (page_idx, page) in self.pages.iter_mut().enumerate() {
            let offsets: Vec<usize> = page.offsets().collect();
            for offset in offsets {
                let (header, _) = page.record_at(offset);
                let previous = directory.insert(header.key, RecordAddress::new(page_idx, offset));
                page.set_next(offset, previous);
            }
        }
        debug!(
            level = self.level,
            partition = self.index,
            keys = directory.keys(),
            pages = directory.page_count(),
            "bucket directory built"
        );
        self.directory = Some(directory);
        Ok(())
    }

    /// Head of the build chain for `key` in a resident partition.
    pub fn lookup(&self, key: i64) -> Option<RecordAddress> {
        self.directory.as_ref()?.lookup(key)
    }

    /// Build rows of the chain starting at `head`.
    pub fn chain(&self, head: RecordAddress) -> BuildSideIter<'_> {
        BuildSideIter {
            pages: &self.pages,
            next: head,
        }
    }

    /// Buffers a probe record of a spilled partition for replay.
    ///
    /// Returns `false` if the bloom filter proved the key absent and the
    /// record was dropped.
    pub fn spill_probe(
        &mut self,
        key: i64,
        row: &[u8],
        ws: &mut Workspace,
    ) -> Result<bool, JoinError> {
        let (level, index) = (self.level, self.index);
        let Some(spill) = self.spill.as_mut() else {
            return Ok(false);
        };
        if spill.bloom.as_ref().is_some_and(|bloom| !bloom.check(&key)) {
            ws.stats.probe_records_filtered += 1;
            return Ok(false);
        }

        if spill.buffer.remaining() < RECORD_HEADER_SIZE + row.len() {
            spill.flush_probe(ws, level, index)?;
        }
        spill.buffer.append(key, row);
        self.probe_records += 1;
        Ok(true)
    }

    /// Ends the probe phase.
    ///
    /// A resident partition releases its pages and returns `None`. A
    /// spilled partition closes its probe segment, releases its buffer,
    /// and is detached as a [`SpilledPartition`].
    pub fn finish_probe(
        &mut self,
        ws: &mut Workspace,
    ) -> Result<Option<SpilledPartition>, JoinError> {
        let (level, index) = (self.level, self.index);
        let Some(spill) = self.spill.as_mut() else {
            self.release(ws);
            return Ok(None);
        };

        if !spill.buffer.is_empty() {
            spill.flush_probe(ws, level, index)?;
        }
        let probe = spill.probe_writer.take().map(SegmentWriter::close).transpose()?;
        if let Some(segment) = &probe {
            ws.stats.spilled_bytes += segment.stored_bytes();
        }

        let build = spill.build.take().ok_or_else(|| {
            SpillError::WriterFailed("build segment was never closed".into())
        })?;
        let build_pages = spill.build_pages;
        self.release(ws);

        Ok(Some(SpilledPartition {
            level,
            index,
            build,
            probe,
            build_records: self.build_records,
            probe_records: self.probe_records,
            build_pages,
        }))
    }

    /// Returns every page to the budget and drops open segments.
    pub fn release(&mut self, ws: &mut Workspace) {
        ws.memory.release_all(self.pages.drain(..).map(PageBuf::into_page));
        if let Some(directory) = self.directory.take() {
            ws.memory.release_all(directory.into_pages());
        }
        if let Some(spill) = self.spill.take() {
            ws.memory.release(spill.buffer.into_page());
        }
    }
}

/// Builds a key filter from a closed build segment.
fn build_key_filter(
    segment: &SpilledSegment,
    records: u64,
) -> Result<Option<Bloom<i64>>, JoinError> {
    let items = usize::try_from(records).unwrap_or(usize::MAX);
    let mut bloom = match Bloom::new_for_fp_rate(items, PROBE_BLOOM_FP_RATE) {
        Ok(bloom) => bloom,
        Err(e) => {
            warn!("probe filter disabled for {}: {e}", segment.path().display());
            return Ok(None);
        }
    };
    let mut reader = segment.open_reader()?;
    while let Some((key, _)) = reader.next_record()? {
        bloom.set(&key);
    }
    Ok(Some(bloom))
}

// ------------------------------------------------------------------------------------------------
// Build-side iterator
// ------------------------------------------------------------------------------------------------

/// The build rows sharing the current probe key.
///
/// Borrowed from the resident partition that holds them; obtain a fresh
/// one from the join to walk the group again.
pub struct BuildSideIter<'a> {
    pages: &'a [PageBuf],
    next: RecordAddress,
}

impl BuildSideIter<'_> {
    pub(crate) fn empty() -> Self {
        BuildSideIter {
            pages: &[],
            next: RecordAddress(crate::record::NO_NEXT),
        }
    }
}

impl<'a> Iterator for BuildSideIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.next.is_end() {
            return None;
        }
        let page = self.pages.get(self.next.page())?;
        let (header, row): (RecordHeader, &'a [u8]) = page.record_at(self.next.offset());
        self.next = RecordAddress(header.next);
        Some(row)
    }
}

impl fmt::Debug for BuildSideIter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildSideIter")
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Spilled partition
// ------------------------------------------------------------------------------------------------

/// A partition whose build and probe records live on disk.
///
/// Produced when the probe phase of a partition set ends. The recursion
/// controller either reloads it, repartitions it one level deeper, or
/// hands it to the sort-merge fallback, in which case the segments stay
/// readable through
/// [`HybridHashJoin::spilled_partition_build_iter`](crate::HybridHashJoin::spilled_partition_build_iter)
/// and
/// [`HybridHashJoin::spilled_partition_probe_iter`](crate::HybridHashJoin::spilled_partition_probe_iter).
///
/// Dropping the value deletes both segment files.
pub struct SpilledPartition {
    level: u32,
    index: usize,
    build: SpilledSegment,
    probe: Option<SpilledSegment>,
    build_records: u64,
    probe_records: u64,
    build_pages: usize,
}

impl SpilledPartition {
    /// Recursion level of the set the partition belonged to.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Index within its partition set.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Build records in the build segment.
    pub fn build_records(&self) -> u64 {
        self.build_records
    }

    /// Probe records in the probe segment.
    pub fn probe_records(&self) -> u64 {
        self.probe_records
    }

    /// Pages the build side occupied when it was written.
    pub fn build_pages(&self) -> usize {
        self.build_pages
    }

    /// Bytes on disk across both segments.
    pub fn spilled_bytes(&self) -> u64 {
        self.build.stored_bytes() + self.probe.as_ref().map_or(0, SpilledSegment::stored_bytes)
    }

    pub(crate) fn build_segment(&self) -> &SpilledSegment {
        &self.build
    }

    pub(crate) fn probe_segment(&self) -> Option<&SpilledSegment> {
        self.probe.as_ref()
    }

    /// Gives up the probe segment, keeping the build segment alive.
    pub(crate) fn take_probe(&mut self) -> Option<SpilledSegment> {
        self.probe.take()
    }
}

impl fmt::Debug for SpilledPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpilledPartition")
            .field("level", &self.level)
            .field("index", &self.index)
            .field("build_records", &self.build_records)
            .field("probe_records", &self.probe_records)
            .field("build_pages", &self.build_pages)
            .finish_non_exhaustive()
    }
}
