//! # hybridjoin
//!
//! A partitioned, spill-capable **hybrid hash join** on `i64` keys that runs
//! inside a fixed page budget. Overflowing partitions are spilled to disk,
//! replayed after the live probe stream ends, and repartitioned with a fresh
//! hash seed when they still do not fit. Partitions that cannot be resolved
//! within the recursion limit are handed back to the caller for a
//! sort-merge fallback, with no record lost.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::borrow::Cow;
//! use hybridjoin::{HybridHashJoin, JoinConfig, RowAccessor};
//!
//! struct KeyPrefixed;
//!
//! impl RowAccessor for KeyPrefixed {
//!     type ProbeRow = [u8];
//!     fn build_key(&self, row: &[u8]) -> i64 {
//!         i64::from_le_bytes(row[..8].try_into().unwrap())
//!     }
//!     fn probe_key(&self, row: &[u8]) -> i64 {
//!         self.build_key(row)
//!     }
//!     fn probe_to_binary<'a>(&self, row: &'a [u8]) -> Cow<'a, [u8]> {
//!         Cow::Borrowed(row)
//!     }
//! }
//!
//! let mut join = HybridHashJoin::with_heap_pool(KeyPrefixed, JoinConfig::default()).unwrap();
//!
//! // Build
//! join.put_build_row(&7i64.to_le_bytes()).unwrap();
//! join.end_build().unwrap();
//!
//! // Probe the live stream
//! if join.try_probe(&7i64.to_le_bytes()).unwrap() {
//!     for build_row in join.build_side_iter() {
//!         // emit (join.current_probe_row(), build_row)
//!     }
//! }
//!
//! // Drain spilled partitions
//! while join.next_matching().unwrap() {
//!     for build_row in join.build_side_iter() {
//!         // emit (join.current_probe_row(), build_row)
//!     }
//! }
//!
//! // Partitions the hash join gave up on
//! for partition in join.partitions_pending_for_smj() {
//!     let _build = join.spilled_partition_build_iter(partition).unwrap();
//!     let _probe = join.spilled_partition_probe_iter(partition).unwrap();
//! }
//!
//! join.free();
//! ```
//!
//! ## Features
//!
//! - **Page budget**: every page comes from a caller-supplied [`PagePool`]
//!   and the join never holds more than its budget.
//! - **Greedy eviction**: the largest resident partition spills first.
//! - **Recursive repartitioning**: a per-level hash seed splits skewed
//!   partitions, bounded by a maximum depth.
//! - **Spill compression**: optional zstd block compression.
//! - **Asynchronous spill writes**: optional background writer threads.
//! - **CRC32 integrity**: every spilled block is checksummed.

pub(crate) mod encoding;
pub(crate) mod hash;
pub mod join;
pub mod memory;
pub(crate) mod partition;
pub(crate) mod record;
pub mod row;
pub mod spill;

use std::path::PathBuf;

use thiserror::Error;

pub use encoding::EncodingError;
pub use join::{HybridHashJoin, MatchSource, ProbeState, SpilledRow, SpilledRows};
pub use memory::{DEFAULT_PAGE_SIZE, HeapPagePool, MemoryError, Page, PagePool};
pub use partition::{BuildSideIter, SpilledPartition};
pub use row::RowAccessor;
pub use spill::SpillError;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`HybridHashJoin`].
///
/// All fields have defaults via [`JoinConfig::default()`]. The
/// configuration is validated when the join is constructed.
///
/// # Example
///
/// ```rust
/// use hybridjoin::JoinConfig;
///
/// // 4 MiB of 32 KiB pages, compressed spills
/// let config = JoinConfig {
///     memory_budget_pages: 128,
///     compression: true,
///     ..JoinConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// Size of one memory page in bytes.
    ///
    /// Default: 32 KiB. Must be a power of two ≥ 1024. Must match the
    /// page size of the pool.
    pub page_size: usize,

    /// Maximum number of pages the join holds at once.
    ///
    /// Default: 128. Must be ≥ 8.
    pub memory_budget_pages: usize,

    /// Compress spilled blocks with zstd.
    ///
    /// Default: `false`.
    pub compression: bool,

    /// Target size of a spilled block before compression.
    ///
    /// Default: 64 KiB. Must be ≥ 1024.
    pub compression_block_size: usize,

    /// zstd compression level.
    ///
    /// Default: 1. Must be in `1..=22`.
    pub compression_level: i32,

    /// Deepest recursion level at which a spilled partition may still be
    /// repartitioned. Partitions that do not fit beyond it are deferred to
    /// the sort-merge fallback.
    ///
    /// Default: 3. Must be ≤ 16.
    pub max_recursion_depth: u32,

    /// Number of partitions at the root level. Derived from the budget
    /// when `None`; always capped by the budget.
    ///
    /// Default: `None`. `Some(n)` requires `n ≥ 1`.
    pub partition_count_hint: Option<usize>,

    /// Directory under which the join creates its private spill directory.
    ///
    /// Default: [`std::env::temp_dir()`].
    pub spill_dir: PathBuf,

    /// Write spill segments from background threads.
    ///
    /// Default: `false`.
    pub async_spill_io: bool,

    /// Drop probe records of spilled partitions whose key a bloom filter
    /// over the partition's build keys proves absent.
    ///
    /// Default: `false`.
    pub probe_bloom_filter: bool,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            memory_budget_pages: 128,
            compression: false,
            compression_block_size: 64 * 1024,
            compression_level: 1,
            max_recursion_depth: 3,
            partition_count_hint: None,
            spill_dir: std::env::temp_dir(),
            async_spill_io: false,
            probe_bloom_filter: false,
        }
    }
}

impl JoinConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), JoinError> {
        if self.page_size < 1024 || !self.page_size.is_power_of_two() {
            return Err(JoinError::InvalidConfig(
                "page_size must be a power of two >= 1024".into(),
            ));
        }
        if self.memory_budget_pages < 8 {
            return Err(JoinError::InvalidConfig(
                "memory_budget_pages must be >= 8".into(),
            ));
        }
        if self.compression_block_size < 1024 {
            return Err(JoinError::InvalidConfig(
                "compression_block_size must be >= 1024".into(),
            ));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(JoinError::InvalidConfig(
                "compression_level must be in 1..=22".into(),
            ));
        }
        if self.max_recursion_depth > 16 {
            return Err(JoinError::InvalidConfig(
                "max_recursion_depth must be <= 16".into(),
            ));
        }
        if self.partition_count_hint == Some(0) {
            return Err(JoinError::InvalidConfig(
                "partition_count_hint must be >= 1".into(),
            ));
        }
        Ok(())
    }

    fn spill_options(&self) -> spill::SpillOptions {
        spill::SpillOptions {
            codec: if self.compression {
                spill::SpillCodec::Zstd {
                    level: self.compression_level,
                }
            } else {
                spill::SpillCodec::None
            },
            block_size: self.compression_block_size,
            async_io: self.async_spill_io,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`HybridHashJoin`] operations.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The join has been closed or freed.
    #[error("join is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// An operation was called out of protocol order.
    #[error("{op} is not allowed in state {state:?}")]
    InvalidState {
        /// The rejected operation.
        op: &'static str,
        /// The state the join was in.
        state: ProbeState,
    },

    /// A row does not fit into a single page.
    #[error("row of {size} bytes exceeds the maximum of {max} bytes")]
    RecordTooLarge {
        /// Row size in bytes.
        size: usize,
        /// Largest row a page can hold.
        max: usize,
    },

    /// No page could be obtained even after eviction.
    #[error("allocation failed: {0}")]
    Allocation(#[from] MemoryError),

    /// Spill segment I/O failed.
    #[error("spill failed: {0}")]
    Spill(#[from] SpillError),
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Counters describing one join's work so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinStats {
    /// Build rows accepted by `put_build_row`.
    pub build_records: u64,
    /// Probe rows passed to `try_probe`.
    pub probe_records: u64,
    /// Partitions spilled, across all levels.
    pub spilled_partitions: u64,
    /// Spill segment files created.
    pub spill_files: u64,
    /// Bytes written to spill segments.
    pub spilled_bytes: u64,
    /// Deepest partition set created.
    pub max_recursion_level: u32,
    /// Probe records dropped by bloom filters.
    pub probe_records_filtered: u64,
    /// Pages held right now.
    pub pages_held: usize,
    /// Highest number of pages held at once.
    pub peak_pages: usize,
    /// Partitions deferred to the sort-merge fallback.
    pub pending_smj: usize,
}
