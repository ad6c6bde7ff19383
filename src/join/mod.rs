//! # Hybrid Hash Join
//!
//! [`HybridHashJoin`] drives one join through its phases and exposes the
//! caller-facing iteration protocol.
//!
//! ## Protocol
//!
//! ```text
//! put_build_row* ─► end_build ─► (try_probe ─► build_side_iter*)* ─► (next_matching ─► build_side_iter*)*
//! ```
//!
//! 1. **Build.** Every build row is routed to a partition of the root
//!    [`PartitionSet`]. Under memory pressure the largest resident partition
//!    spills.
//! 2. **Live probe.** `try_probe` answers immediately for resident
//!    partitions. Probe rows of spilled partitions are written to disk and
//!    `false` is returned.
//! 3. **Drain.** The first `next_matching` ends the live stream. Spilled
//!    partitions are then processed one at a time by the recursion
//!    controller (see [`replay`]), and every probe row that finds build rows
//!    is surfaced as one match group.
//!
//! Each state transition is explicit in [`ProbeState`]; calling an operation
//! in the wrong state fails with [`JoinError::InvalidState`] instead of
//! silently misbehaving.
//!
//! ## Memory
//!
//! All pages come from the [`PagePool`] through a [`MemoryBudget`] capped at
//! `memory_budget_pages`. At most one partition set is alive at a time: the
//! live set is released before the first spilled partition is reloaded, and
//! every reloaded set is released before the next one is created. `free`
//! (also run on drop) returns every page and removes the spill directory.

#[cfg(test)]
mod tests;

mod replay;

pub use replay::{SpilledRow, SpilledRows};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::hash::fanout_for;
use crate::memory::{HeapPagePool, MemoryBudget, PagePool};
use crate::partition::{BuildSideIter, PartitionSet, ProbeOutcome, SpilledPartition, Workspace};
use crate::record::RecordAddress;
use crate::row::RowAccessor;
use crate::spill::{SegmentReader, SpillDirectory, SpilledSegment};
use crate::{JoinConfig, JoinError, JoinStats};

// ------------------------------------------------------------------------------------------------
// Probe state
// ------------------------------------------------------------------------------------------------

/// Where the current match group came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    /// A row passed to `try_probe`.
    Live,
    /// A probe row replayed from a spilled partition.
    Replay,
}

/// Position of a join in its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Accepting build rows.
    Building,
    /// Build finished; accepting live probe rows.
    Probing,
    /// A match group is positioned; its build rows are available.
    DrainingMatches(MatchSource),
    /// A spilled partition is loaded and its probe rows are being replayed.
    ReplayingSpill,
    /// No further match groups exist.
    Exhausted,
    /// `close` or `free` was called.
    Closed,
}

/// The probe row currently positioned and the head of its build chain.
struct MatchGroup {
    key: i64,
    partition: usize,
    head: RecordAddress,
    probe_row: Vec<u8>,
}

/// A spilled probe segment being replayed against the active set.
struct ProbeReplay {
    // Declared first: the mapping must be dropped before the segment
    // deletes its file.
    reader: SegmentReader,
    _segment: SpilledSegment,
}

// ------------------------------------------------------------------------------------------------
// HybridHashJoin
// ------------------------------------------------------------------------------------------------

/// A partitioned, spill-capable hash join over `i64` keys.
///
/// See the [module-level documentation](self) for the protocol.
///
/// # Thread safety
///
/// A join is driven by a single caller; every operation takes `&mut self`.
/// The [`PagePool`] behind it may be shared with other joins.
///
/// # Cleanup
///
/// Call [`free`](Self::free) when done. Dropping the join frees it as well.
pub struct HybridHashJoin<A: RowAccessor> {
    accessor: A,
    config: JoinConfig,
    workspace: Workspace,
    /// The partition set being built or probed, live or replayed.
    active: Option<PartitionSet>,
    replay: Option<ProbeReplay>,
    /// Spilled partitions waiting for the recursion controller, FIFO.
    pending: VecDeque<SpilledPartition>,
    pending_smj: Vec<SpilledPartition>,
    state: ProbeState,
    current: Option<MatchGroup>,
    freed: bool,
}

impl<A: RowAccessor> HybridHashJoin<A> {
    /// Creates a join drawing pages from `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError::InvalidConfig`] if a configuration parameter is
    /// out of range or the pool's page size differs from
    /// `config.page_size`.
    pub fn new(accessor: A, pool: Arc<dyn PagePool>, config: JoinConfig) -> Result<Self, JoinError> {
        config.validate()?;
        if pool.page_size() != config.page_size {
            return Err(JoinError::InvalidConfig(format!(
                "pool page size {} does not match page_size {}",
                pool.page_size(),
                config.page_size
            )));
        }

        let budget = config.memory_budget_pages;
        let fanout = fanout_for(budget, config.partition_count_hint);
        let workspace = Workspace {
            memory: MemoryBudget::new(pool, budget),
            spill_dir: SpillDirectory::new(&config.spill_dir),
            spill_options: config.spill_options(),
            bloom_filter: config.probe_bloom_filter,
            stats: JoinStats::default(),
        };

        info!(
            page_size = config.page_size,
            budget,
            fanout,
            compression = config.compression,
            "hash join created"
        );

        Ok(Self {
            accessor,
            config,
            workspace,
            active: Some(PartitionSet::new(0, fanout)),
            replay: None,
            pending: VecDeque::new(),
            pending_smj: Vec::new(),
            state: ProbeState::Building,
            current: None,
            freed: false,
        })
    }

    /// Creates a join with a private [`HeapPagePool`] of exactly
    /// `memory_budget_pages` pages.
    pub fn with_heap_pool(accessor: A, config: JoinConfig) -> Result<Self, JoinError> {
        let pool = Arc::new(HeapPagePool::new(
            config.page_size,
            config.memory_budget_pages,
        ));
        Self::new(accessor, pool, config)
    }

    /// Current protocol state.
    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Counters for the work done so far.
    pub fn stats(&self) -> JoinStats {
        let mut stats = self.workspace.stats.clone();
        stats.pages_held = self.workspace.memory.held();
        stats.peak_pages = self.workspace.memory.peak();
        stats.pending_smj = self.pending_smj.len();
        stats
    }

    fn check(&self, op: &'static str, allowed: impl Fn(ProbeState) -> bool) -> Result<(), JoinError> {
        match self.state {
            ProbeState::Closed => Err(JoinError::Closed),
            state if allowed(state) => Ok(()),
            state => Err(JoinError::InvalidState { op, state }),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Build phase
    // --------------------------------------------------------------------------------------------

    /// Adds one build row, in the binary form the accessor understands.
    ///
    /// May spill partitions to stay within the page budget.
    ///
    /// # Errors
    ///
    /// - [`JoinError::RecordTooLarge`] if the row cannot fit in one page.
    /// - [`JoinError::Allocation`] if the pool cannot grant a page even
    ///   after every resident partition was spilled.
    /// - [`JoinError::Spill`] if writing a spill segment fails.
    pub fn put_build_row(&mut self, row: &[u8]) -> Result<(), JoinError> {
        self.check("put_build_row", |s| s == ProbeState::Building)?;
        let key = self.accessor.build_key(row);
        let Some(set) = self.active.as_mut() else {
            return Err(JoinError::InvalidState {
                op: "put_build_row",
                state: self.state,
            });
        };
        set.insert_build(key, row, &mut self.workspace)?;
        self.workspace.stats.build_records += 1;
        Ok(())
    }

    /// Ends the build phase: builds bucket directories for resident
    /// partitions and closes build segments of spilled ones.
    pub fn end_build(&mut self) -> Result<(), JoinError> {
        self.check("end_build", |s| s == ProbeState::Building)?;
        let Some(set) = self.active.as_mut() else {
            return Err(JoinError::InvalidState {
                op: "end_build",
                state: self.state,
            });
        };
        set.end_build(&mut self.workspace)?;
        self.state = ProbeState::Probing;

        info!(
            build_records = self.workspace.stats.build_records,
            spilled = set.spilled_count(),
            fanout = set.fanout(),
            held = self.workspace.memory.held(),
            "build finished"
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Probe phase
    // --------------------------------------------------------------------------------------------

    /// Probes one live row.
    ///
    /// Returns `true` if the row's key has build rows in a resident
    /// partition; they are then available through
    /// [`build_side_iter`](Self::build_side_iter) until the next call.
    /// Returns `false` for a miss, and for a row deferred to a spilled
    /// partition, which [`next_matching`](Self::next_matching) surfaces
    /// later.
    pub fn try_probe(&mut self, row: &A::ProbeRow) -> Result<bool, JoinError> {
        self.check("try_probe", |s| {
            matches!(
                s,
                ProbeState::Probing | ProbeState::DrainingMatches(MatchSource::Live)
            )
        })?;

        let key = self.accessor.probe_key(row);
        let binary = self.accessor.probe_to_binary(row);
        self.workspace.stats.probe_records += 1;

        let Some(set) = self.active.as_mut() else {
            return Err(JoinError::InvalidState {
                op: "try_probe",
                state: self.state,
            });
        };
        match set.probe(key, &binary, &mut self.workspace)? {
            ProbeOutcome::Hit { partition, head } => {
                position(&mut self.current, key, partition, head, &binary);
                self.state = ProbeState::DrainingMatches(MatchSource::Live);
                Ok(true)
            }
            ProbeOutcome::Miss | ProbeOutcome::Spilled | ProbeOutcome::Filtered => {
                self.current = None;
                self.state = ProbeState::Probing;
                Ok(false)
            }
        }
    }

    /// Advances to the next match group from spilled partitions.
    ///
    /// The first call ends the live probe stream. Returns `false` once no
    /// match group remains anywhere; later calls keep returning `false`.
    pub fn next_matching(&mut self) -> Result<bool, JoinError> {
        self.check("next_matching", |s| s != ProbeState::Building)?;

        match self.state {
            ProbeState::Exhausted => return Ok(false),
            ProbeState::Probing | ProbeState::DrainingMatches(MatchSource::Live) => {
                self.finish_active()?;
            }
            _ => {}
        }

        loop {
            if self.replay.is_some() {
                if self.advance_replay()? {
                    self.state = ProbeState::DrainingMatches(MatchSource::Replay);
                    return Ok(true);
                }
                self.finish_active()?;
                continue;
            }

            let Some(partition) = self.pending.pop_front() else {
                self.current = None;
                self.state = ProbeState::Exhausted;
                info!(
                    pending_smj = self.pending_smj.len(),
                    max_level = self.workspace.stats.max_recursion_level,
                    "probe exhausted"
                );
                return Ok(false);
            };
            self.schedule(partition)?;
        }
    }

    /// The probe row of the current match group, in binary form.
    pub fn current_probe_row(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|m| m.probe_row.as_slice())
    }

    /// The join key of the current match group.
    pub fn current_key(&self) -> Option<i64> {
        self.current.as_ref().map(|m| m.key)
    }

    /// Build rows sharing the current probe row's key.
    ///
    /// Every call starts over from the first row of the group. Empty when
    /// no group is positioned.
    pub fn build_side_iter(&self) -> BuildSideIter<'_> {
        match (&self.current, &self.active) {
            (Some(group), Some(set)) => set.chain(group.partition, group.head),
            _ => BuildSideIter::empty(),
        }
    }

    /// Ends the probe phase of the active set and queues its spilled
    /// partitions.
    fn finish_active(&mut self) -> Result<(), JoinError> {
        self.current = None;
        if let Some(replay) = self.replay.take() {
            debug!(blocks = replay.reader.blocks_read(), "probe replay finished");
        }
        if let Some(set) = self.active.as_mut() {
            let spilled = set.finish_probe(&mut self.workspace)?;
            self.pending.extend(spilled);
        }
        self.active = None;
        Ok(())
    }

    /// Replays probe rows until one hits. Returns `false` at the end of the
    /// probe segment.
    fn advance_replay(&mut self) -> Result<bool, JoinError> {
        let (Some(replay), Some(set)) = (self.replay.as_mut(), self.active.as_mut()) else {
            return Ok(false);
        };
        while let Some((key, row)) = replay.reader.next_record()? {
            if let ProbeOutcome::Hit { partition, head } =
                set.probe(key, row, &mut self.workspace)?
            {
                position(&mut self.current, key, partition, head, row);
                return Ok(true);
            }
        }
        Ok(false)
    }

    // --------------------------------------------------------------------------------------------
    // Sort-merge fallback
    // --------------------------------------------------------------------------------------------

    /// Spilled partitions the hash join gave up on, in the order they were
    /// deferred. Their records are not part of any match group; join them
    /// with the spilled-partition iterators instead.
    pub fn partitions_pending_for_smj(&self) -> &[SpilledPartition] {
        &self.pending_smj
    }

    /// Every build row of a spilled partition, in spill order.
    pub fn spilled_partition_build_iter(
        &self,
        partition: &SpilledPartition,
    ) -> Result<SpilledRows, JoinError> {
        let reader = partition.build_segment().open_reader()?;
        Ok(SpilledRows::new(Some(reader)))
    }

    /// Every probe row of a spilled partition, in spill order.
    pub fn spilled_partition_probe_iter(
        &self,
        partition: &SpilledPartition,
    ) -> Result<SpilledRows, JoinError> {
        let reader = partition
            .probe_segment()
            .map(SpilledSegment::open_reader)
            .transpose()?;
        Ok(SpilledRows::new(reader))
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Stops the join: releases every page, closes open segments, and
    /// discards spilled partitions still waiting to be processed.
    ///
    /// Partitions pending for sort-merge join stay readable until
    /// [`free`](Self::free). Subsequent build and probe calls return
    /// [`JoinError::Closed`]. Calling `close` more than once is harmless.
    pub fn close(&mut self) {
        if self.state == ProbeState::Closed {
            return;
        }
        self.current = None;
        self.replay = None;
        if let Some(mut set) = self.active.take() {
            set.release(&mut self.workspace);
        }
        self.pending.clear();
        self.state = ProbeState::Closed;
        info!(held = self.workspace.memory.held(), "hash join closed");
    }

    /// Releases everything the join holds: pages, spill files, and the
    /// spill directory. Idempotent, and safe on a join that never ran.
    pub fn free(&mut self) {
        if self.freed {
            return;
        }
        self.close();
        self.pending_smj.clear();
        self.workspace.spill_dir.remove_all();
        self.freed = true;

        let stats = self.stats();
        info!(
            peak_pages = stats.peak_pages,
            spilled_partitions = stats.spilled_partitions,
            spilled_bytes = stats.spilled_bytes,
            "hash join freed"
        );
    }
}

/// Positions `current` on a new match group, reusing its row buffer.
fn position(
    current: &mut Option<MatchGroup>,
    key: i64,
    partition: usize,
    head: RecordAddress,
    probe_row: &[u8],
) {
    let mut buf = current.take().map(|m| m.probe_row).unwrap_or_default();
    buf.clear();
    buf.extend_from_slice(probe_row);
    *current = Some(MatchGroup {
        key,
        partition,
        head,
        probe_row: buf,
    });
}

impl<A: RowAccessor> Drop for HybridHashJoin<A> {
    fn drop(&mut self) {
        self.free();
    }
}

impl<A: RowAccessor> fmt::Debug for HybridHashJoin<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridHashJoin")
            .field("state", &self.state)
            .field("level", &self.active.as_ref().map(PartitionSet::level))
            .field("pending", &self.pending.len())
            .field("pending_smj", &self.pending_smj.len())
            .field("memory", &self.workspace.memory)
            .finish_non_exhaustive()
    }
}
