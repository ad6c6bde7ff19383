//! Partition set: every partition of one recursion level, plus the
//! eviction policy that keeps them inside the page budget.
//!
//! ## Eviction
//!
//! When the budget (or the pool behind it) refuses a page, the set spills
//! its largest resident partition and retries. "Largest" is measured in
//! record pages; ties go to the partition with more build records, then to
//! the lowest index. Spilling keeps one page as the partition's write
//! buffer, so a spill frees `pages - 1` pages. The caller only sees an
//! allocation error once no resident partition is left to spill.
//!
//! ## End of build
//!
//! Resident partitions need directory pages on top of their record pages.
//! `end_build` keeps spilling the largest resident partition until the
//! remaining ones' directories fit the budget, then builds them. A partition
//! whose directory still cannot be allocated, because the shared pool ran
//! dry, is spilled as well.

use std::cmp::Reverse;

use tracing::debug;

use super::{BuildSideIter, Partition, SpilledPartition, Workspace};
use crate::hash::partition_index;
use crate::memory::MemoryError;
use crate::record::{RECORD_HEADER_SIZE, RecordAddress};
use crate::JoinError;

/// Rejects rows that cannot share a page with their record header.
fn check_record_size(row: &[u8], page_size: usize) -> Result<(), JoinError> {
    if RECORD_HEADER_SIZE + row.len() > page_size {
        return Err(JoinError::RecordTooLarge {
            size: row.len(),
            max: page_size.saturating_sub(RECORD_HEADER_SIZE),
        });
    }
    Ok(())
}

/// Where a probe record went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    /// The key has build records in a resident partition.
    Hit { partition: usize, head: RecordAddress },
    /// The key has no build records.
    Miss,
    /// The record was deferred to a spilled partition.
    Spilled,
    /// The record was routed to a spilled partition and dropped by its
    /// bloom filter.
    Filtered,
}

pub(crate) struct PartitionSet {
    level: u32,
    partitions: Vec<Partition>,
}

impl PartitionSet {
    /// Creates `fanout` empty partitions at `level`.
    pub fn new(level: u32, fanout: usize) -> Self {
        let fanout = fanout.max(1);
        Self {
            level,
            partitions: (0..fanout).map(|i| Partition::new(i, level)).collect(),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn fanout(&self) -> usize {
        self.partitions.len()
    }

    #[cfg(test)]
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn spilled_count(&self) -> usize {
        self.partitions.iter().filter(|p| p.is_spilled()).count()
    }

    /// Pages held by all partitions.
    pub fn held_pages(&self) -> usize {
        self.partitions.iter().map(Partition::held_pages).sum()
    }

    fn route(&self, key: i64) -> usize {
        partition_index(key, self.level, self.partitions.len())
    }

    /// Routes a build record to its partition, evicting under pressure.
    ///
    /// # Errors
    ///
    /// - [`JoinError::RecordTooLarge`] if the record cannot fit in one page.
    /// - [`JoinError::Allocation`] if no page can be obtained even after
    ///   every resident partition has been spilled.
    /// - [`JoinError::Spill`] if spilling fails.
    pub fn insert_build(
        &mut self,
        key: i64,
        row: &[u8],
        ws: &mut Workspace,
    ) -> Result<(), JoinError> {
        check_record_size(row, ws.memory.page_size())?;

        let idx = self.route(key);
        loop {
            if self.partitions[idx].try_append_build(key, row)? {
                return Ok(());
            }
            match ws.memory.acquire() {
                Ok(page) => self.partitions[idx].push_page(page),
                Err(err @ MemoryError::PageSizeMismatch { .. }) => return Err(err.into()),
                Err(err) => {
                    if self.spill_largest(ws)?.is_none() {
                        return Err(err.into());
                    }
                }
            }
        }
    }

    /// Spills the largest resident partition. Returns its index, or `None`
    /// if no resident partition holds pages.
    pub fn spill_largest(&mut self, ws: &mut Workspace) -> Result<Option<usize>, JoinError> {
        let victim = self
            .partitions
            .iter()
            .filter(|p| !p.is_spilled() && p.resident_pages() > 0)
            .max_by_key(|p| (p.resident_pages(), p.build_records(), Reverse(p.index())))
            .map(Partition::index);

        if let Some(idx) = victim {
            let freed = self.partitions[idx].spill(ws)?;
            debug!(
                level = self.level,
                partition = idx,
                freed,
                held = ws.memory.held(),
                "evicted largest partition"
            );
        }
        Ok(victim)
    }

    /// Ends the build phase: closes build segments of spilled partitions and
    /// builds the directories of resident ones.
    pub fn end_build(&mut self, ws: &mut Workspace) -> Result<(), JoinError> {
        for partition in &mut self.partitions {
            partition.finish_build(ws)?;
        }

        let page_size = ws.memory.page_size();
        loop {
            let needed: usize = self
                .partitions
                .iter()
                .map(|p| p.directory_pages_needed(page_size))
                .sum();
            if needed <= ws.memory.available() {
                break;
            }
            match self.spill_largest(ws)? {
                Some(idx) => self.partitions[idx].finish_build(ws)?,
                None => break,
            }
        }

        // The pool may still refuse pages the budget allows. A partition
        // whose directory cannot be allocated spills instead.
        for partition in &mut self.partitions {
            match partition.build_directory(ws) {
                Ok(()) => {}
                Err(JoinError::Allocation(
                    err @ (MemoryError::BudgetExhausted { .. } | MemoryError::PoolExhausted { .. }),
                )) => {
                    debug!(
                        level = self.level,
                        partition = partition.index(),
                        "no pages for directory, spilling: {err}"
                    );
                    partition.spill(ws)?;
                    partition.finish_build(ws)?;
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            level = self.level,
            fanout = self.partitions.len(),
            spilled = self.spilled_count(),
            held = self.held_pages(),
            "build phase finished"
        );
        Ok(())
    }

    /// Routes a probe record: looks it up when its partition is resident,
    /// defers it when the partition is spilled.
    ///
    /// # Errors
    ///
    /// [`JoinError::RecordTooLarge`] if a record bound for a spilled
    /// partition cannot fit in one page.
    pub fn probe(
        &mut self,
        key: i64,
        row: &[u8],
        ws: &mut Workspace,
    ) -> Result<ProbeOutcome, JoinError> {
        let idx = self.route(key);
        let partition = &mut self.partitions[idx];
        if partition.is_spilled() {
            check_record_size(row, ws.memory.page_size())?;
            return Ok(if partition.spill_probe(key, row, ws)? {
                ProbeOutcome::Spilled
            } else {
                ProbeOutcome::Filtered
            });
        }
        Ok(match partition.lookup(key) {
            Some(head) => ProbeOutcome::Hit {
                partition: idx,
                head,
            },
            None => ProbeOutcome::Miss,
        })
    }

    /// Build rows of the chain at `head` in partition `partition`.
    pub fn chain(&self, partition: usize, head: RecordAddress) -> BuildSideIter<'_> {
        match self.partitions.get(partition) {
            Some(p) => p.chain(head),
            None => BuildSideIter::empty(),
        }
    }

    /// Ends the probe phase, releasing resident partitions and detaching
    /// spilled ones in index order.
    pub fn finish_probe(&mut self, ws: &mut Workspace) -> Result<Vec<SpilledPartition>, JoinError> {
        let mut spilled = Vec::new();
        for partition in &mut self.partitions {
            if let Some(detached) = partition.finish_probe(ws)? {
                spilled.push(detached);
            }
        }
        Ok(spilled)
    }

    /// Returns every page to the budget and drops open segments.
    pub fn release(&mut self, ws: &mut Workspace) {
        for partition in &mut self.partitions {
            partition.release(ws);
        }
    }
}
