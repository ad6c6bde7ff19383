//! Recursion controller and spilled-row iteration.
//!
//! Spilled partitions are taken from the FIFO queue one at a time. For each
//! one the controller decides:
//!
//! 1. **Skip** when it has no build rows or no probe rows. Nothing can
//!    match, so its segments are deleted.
//! 2. **Reload** when its build pages plus a bucket directory fit in the
//!    pages still available. It becomes a single-partition set one level
//!    deeper. If the page pool cannot supply those pages and the set spills,
//!    the reload is dropped and the partition falls through to step 3.
//! 3. **Repartition** when it does not fit or could not be reloaded, and
//!    its level is below `max_recursion_depth`. Its build rows are routed
//!    into a new set one level deeper, with that level's hash seed, where
//!    partitions may spill again.
//! 4. **Defer** to the sort-merge fallback otherwise. The partition and
//!    both its segments are kept until `free`.
//!
//! After a reload or repartition the probe segment is replayed against the
//! new set. Partitions of that set that spilled are queued behind the
//! current ones, so the recursion is a flat work queue: no set outlives the
//! processing of its parent's partition. Only repartitioning queues new
//! partitions, so deferred partitions never sit deeper than
//! `max_recursion_depth`.

use tracing::{debug, info};

use super::{HybridHashJoin, ProbeReplay, ProbeState};
use crate::hash::fanout_for;
use crate::partition::{BucketDirectory, PartitionSet, SpilledPartition};
use crate::row::RowAccessor;
use crate::spill::SegmentReader;
use crate::JoinError;

impl<A: RowAccessor> HybridHashJoin<A> {
    /// Processes one spilled partition; see the module documentation.
    pub(super) fn schedule(&mut self, partition: SpilledPartition) -> Result<(), JoinError> {
        if partition.build_records() == 0
            || partition.probe_records() == 0
            || partition.probe_segment().is_none()
        {
            debug!(
                level = partition.level(),
                partition = partition.index(),
                build_records = partition.build_records(),
                probe_records = partition.probe_records(),
                "spilled partition cannot match, skipped"
            );
            return Ok(());
        }

        let memory = &self.workspace.memory;
        let available = memory.available();
        let needed = partition.build_pages()
            + BucketDirectory::pages_needed(partition.build_records(), memory.page_size());
        let level = partition.level() + 1;

        if needed <= available {
            debug!(
                level,
                partition = partition.index(),
                needed,
                available,
                "reloading spilled partition"
            );
            if self.load_build(&partition, level, 1)? {
                return self.start_replay(partition);
            }
            info!(
                level,
                partition = partition.index(),
                needed,
                "page pool cannot hold reloaded partition"
            );
        }

        if partition.level() < self.config.max_recursion_depth {
            let available = self.workspace.memory.available();
            let fanout = fanout_for(available, self.config.partition_count_hint).max(2);
            info!(
                level,
                partition = partition.index(),
                build_records = partition.build_records(),
                needed,
                available,
                fanout,
                "repartitioning spilled partition"
            );
            self.load_build(&partition, level, fanout)?;
            return self.start_replay(partition);
        }

        info!(
            level = partition.level(),
            partition = partition.index(),
            build_records = partition.build_records(),
            probe_records = partition.probe_records(),
            "recursion limit reached, deferring to sort-merge join"
        );
        self.pending_smj.push(partition);
        Ok(())
    }

    /// Routes every build row of `partition` into a new active set at
    /// `level` and ends its build phase.
    ///
    /// A reload (`fanout == 1`) that had to spill is undone: its pages and
    /// segments are released and `false` is returned, so a partition the
    /// pool cannot hold is never requeued at the next level.
    fn load_build(
        &mut self,
        partition: &SpilledPartition,
        level: u32,
        fanout: usize,
    ) -> Result<bool, JoinError> {
        let stats = &mut self.workspace.stats;
        stats.max_recursion_level = stats.max_recursion_level.max(level);

        // Owned by the join before loading so `free` releases it on error.
        let set = self.active.insert(PartitionSet::new(level, fanout));
        let mut reader = partition.build_segment().open_reader()?;
        while let Some((key, row)) = reader.next_record()? {
            set.insert_build(key, row, &mut self.workspace)?;
        }
        set.end_build(&mut self.workspace)?;

        if fanout == 1 && set.spilled_count() > 0 {
            set.release(&mut self.workspace);
            self.active = None;
            return Ok(false);
        }
        Ok(true)
    }

    /// Replays the probe segment of `partition` against the active set.
    fn start_replay(&mut self, mut partition: SpilledPartition) -> Result<(), JoinError> {
        let Some(probe) = partition.take_probe() else {
            return self.finish_active();
        };
        drop(partition);

        let reader = probe.open_reader()?;
        self.replay = Some(ProbeReplay {
            reader,
            _segment: probe,
        });
        self.state = ProbeState::ReplayingSpill;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Spilled rows
// ------------------------------------------------------------------------------------------------

/// One row read back from a spilled segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpilledRow {
    /// Join key extracted when the row was ingested.
    pub key: i64,
    /// The row in binary form.
    pub row: Vec<u8>,
}

/// Rows of one side of a spilled partition, in spill order.
///
/// Yields `Err` once if the segment turns out to be damaged, then ends.
pub struct SpilledRows {
    reader: Option<SegmentReader>,
}

impl SpilledRows {
    pub(crate) fn new(reader: Option<SegmentReader>) -> Self {
        Self { reader }
    }
}

impl Iterator for SpilledRows {
    type Item = Result<SpilledRow, JoinError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        match reader.next_record() {
            Ok(Some((key, row))) => Some(Ok(SpilledRow {
                key,
                row: row.to_vec(),
            })),
            Ok(None) => {
                self.reader = None;
                None
            }
            Err(e) => {
                self.reader = None;
                Some(Err(e.into()))
            }
        }
    }
}

impl std::fmt::Debug for SpilledRows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpilledRows")
            .field("done", &self.reader.is_none())
            .finish()
    }
}
