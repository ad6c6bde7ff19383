//! Integration tests for the public `HybridHashJoin` API.
//!
//! These tests drive complete joins through the public
//! `hybridjoin::{HybridHashJoin, JoinConfig, PagePool, ...}` surface only.
//! No internal modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: free, idempotent free, Drop-based cleanup
//! - **Completeness**: spilled, recursive, and sort-merge-deferred joins
//! - **Keys**: negative and extreme `i64` keys, variable-length rows
//! - **Page pools**: custom `PagePool` implementations, exhaustion, bad pages
//! - **Concurrency**: several joins sharing one pool across threads
//! - **Errors**: protocol violations, closed joins
//!
//! ## See also
//! - [`join::tests`]: join driver unit tests
//! - [`partition::tests`]: partition set and eviction unit tests
//! - [`spill::tests`]: spill segment unit tests

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use hybridjoin::{
    HeapPagePool, HybridHashJoin, JoinConfig, JoinError, MemoryError, Page, PagePool, ProbeState,
    RowAccessor,
};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

const PAGE_SIZE: usize = 4096;

/// Rows are `[key: i64 LE][payload ...]` on both sides.
struct KeyPrefixed;

impl RowAccessor for KeyPrefixed {
    type ProbeRow = [u8];

    fn build_key(&self, row: &[u8]) -> i64 {
        key_of(row)
    }

    fn probe_key(&self, row: &[u8]) -> i64 {
        key_of(row)
    }

    fn probe_to_binary<'a>(&self, row: &'a [u8]) -> Cow<'a, [u8]> {
        Cow::Borrowed(row)
    }
}

fn key_of(row: &[u8]) -> i64 {
    let mut key = [0u8; 8];
    key.copy_from_slice(&row[..8]);
    i64::from_le_bytes(key)
}

fn make_row(key: i64, payload_len: usize, fill: u8) -> Vec<u8> {
    let mut row = key.to_le_bytes().to_vec();
    row.resize(8 + payload_len, fill);
    row
}

fn small_config(dir: &std::path::Path, budget: usize) -> JoinConfig {
    JoinConfig {
        page_size: PAGE_SIZE,
        memory_budget_pages: budget,
        spill_dir: dir.to_path_buf(),
        ..JoinConfig::default()
    }
}

/// Reference answer: pairs per key.
fn expected_pairs(build: &[Vec<u8>], probe: &[Vec<u8>]) -> HashMap<i64, u64> {
    let mut b: HashMap<i64, u64> = HashMap::new();
    for r in build {
        *b.entry(key_of(r)).or_default() += 1;
    }
    let mut pairs = HashMap::new();
    for r in probe {
        if let Some(n) = b.get(&key_of(r)) {
            *pairs.entry(key_of(r)).or_default() += n;
        }
    }
    pairs
}

/// Runs the whole protocol, then sort-merge joins the deferred partitions
/// through the spilled-partition iterators. Returns pairs per key.
fn join_all(
    join: &mut HybridHashJoin<KeyPrefixed>,
    build: &[Vec<u8>],
    probe: &[Vec<u8>],
) -> Result<HashMap<i64, u64>, JoinError> {
    let mut pairs: HashMap<i64, u64> = HashMap::new();
    let mut emit = |join: &HybridHashJoin<KeyPrefixed>| {
        let probe_row = join.current_probe_row().unwrap();
        let key = key_of(probe_row);
        for build_row in join.build_side_iter() {
            assert_eq!(key_of(build_row), key);
            *pairs.entry(key).or_default() += 1;
        }
    };

    for r in build {
        join.put_build_row(r)?;
    }
    join.end_build()?;
    for r in probe {
        if join.try_probe(r)? {
            emit(&*join);
        }
    }
    while join.next_matching()? {
        emit(&*join);
    }

    for partition in join.partitions_pending_for_smj() {
        let mut left = join
            .spilled_partition_build_iter(partition)?
            .collect::<Result<Vec<_>, _>>()?;
        let mut right = join
            .spilled_partition_probe_iter(partition)?
            .collect::<Result<Vec<_>, _>>()?;
        left.sort_by_key(|r| r.key);
        right.sort_by_key(|r| r.key);

        let (mut i, mut j) = (0, 0);
        while i < left.len() && j < right.len() {
            let (l, r) = (left[i].key, right[j].key);
            if l < r {
                i += 1;
            } else if l > r {
                j += 1;
            } else {
                let l_end = i + left[i..].iter().take_while(|x| x.key == l).count();
                let r_end = j + right[j..].iter().take_while(|x| x.key == l).count();
                *pairs.entry(l).or_default() += ((l_end - i) * (r_end - j)) as u64;
                i = l_end;
                j = r_end;
            }
        }
    }
    Ok(pairs)
}

/// A pool that counts traffic and can be told to run dry or hand out
/// pages of the wrong size.
#[derive(Debug)]
struct CountingPool {
    inner: HeapPagePool,
    acquired: AtomicUsize,
    released: AtomicUsize,
    bad_size: Option<usize>,
}

impl CountingPool {
    fn new(capacity: usize) -> Self {
        Self {
            inner: HeapPagePool::new(PAGE_SIZE, capacity),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            bad_size: None,
        }
    }
}

impl PagePool for CountingPool {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn acquire_page(&self) -> Result<Page, MemoryError> {
        if let Some(size) = self.bad_size {
            return Ok(Page::new(size));
        }
        let page = self.inner.acquire_page()?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(page)
    }

    fn release_page(&self, page: Page) {
        if page.size() == PAGE_SIZE {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.inner.release_page(page);
        }
    }
}

// ================================================================================================
// Lifecycle
// ================================================================================================

/// # Scenario
/// A join is created and freed twice without receiving any row.
///
/// # Starting environment
/// Empty temporary spill directory.
///
/// # Actions
/// 1. `HybridHashJoin::new` with a shared pool.
/// 2. `free()` twice.
///
/// # Expected behavior
/// Both calls succeed, no page is outstanding, nothing is written to disk.
#[test]
fn free_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(HeapPagePool::new(PAGE_SIZE, 16));
    let mut join = HybridHashJoin::new(KeyPrefixed, pool.clone(), small_config(dir.path(), 16)).unwrap();
    join.free();
    join.free();
    assert_eq!(join.state(), ProbeState::Closed);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

/// # Scenario
/// A spilling join is dropped in the middle of the live probe stream.
///
/// # Starting environment
/// Budget of 8 pages, 3 000 build rows of 64 bytes.
///
/// # Actions
/// 1. Build and end the build phase.
/// 2. Probe half of the keys.
/// 3. `drop(join)` without `free()`.
///
/// # Expected behavior
/// The `Drop` impl returns every page and removes every spill file.
#[test]
fn drop_without_free_cleans_up() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(HeapPagePool::new(PAGE_SIZE, 8));
    let mut join = HybridHashJoin::new(KeyPrefixed, pool.clone(), small_config(dir.path(), 8)).unwrap();
    for k in 0..3_000 {
        join.put_build_row(&make_row(k, 56, 1)).unwrap();
    }
    join.end_build().unwrap();
    for k in 0..1_500 {
        join.try_probe(&make_row(k, 0, 0)).unwrap();
    }
    assert!(join.stats().spill_files > 0);

    drop(join);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

// ================================================================================================
// Completeness
// ================================================================================================

/// # Scenario
/// Random keys with random duplicate counts and payload sizes, joined under
/// a budget far below the build side.
///
/// # Starting environment
/// Budget of 32 pages; build side of several hundred pages.
///
/// # Actions
/// Run the full protocol, then sort-merge the deferred partitions.
///
/// # Expected behavior
/// Pairs per key equal the reference nested-loop answer.
#[test]
fn random_workload_matches_reference() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5EED);

    let mut build = Vec::new();
    let mut probe = Vec::new();
    for _ in 0..20_000 {
        let key: i64 = rng.random_range(-50_000..50_000);
        let len = rng.random_range(0..120);
        build.push(make_row(key, len, 0xB0));
    }
    for _ in 0..30_000 {
        let key: i64 = rng.random_range(-50_000..50_000);
        let len = rng.random_range(0..40);
        probe.push(make_row(key, len, 0x90));
    }
    build.shuffle(&mut rng);

    let mut join = HybridHashJoin::with_heap_pool(KeyPrefixed, small_config(dir.path(), 32)).unwrap();
    let pairs = join_all(&mut join, &build, &probe).unwrap();
    assert_eq!(pairs, expected_pairs(&build, &probe));
    assert!(join.stats().spilled_partitions > 0);
    assert!(join.stats().peak_pages <= 32);
}

/// # Scenario
/// Keys at the edges of the `i64` range, including `-1`, whose bytes equal
/// the empty-slot pattern of a directory.
///
/// # Starting environment
/// In-memory join with default budget.
///
/// # Actions
/// Build two rows per key; probe each key once.
///
/// # Expected behavior
/// Every key hits with exactly two build rows.
#[test]
fn extreme_keys_are_joined() {
    let dir = TempDir::new().unwrap();
    let keys = [i64::MIN, i64::MIN + 1, -1, 0, 1, i64::MAX - 1, i64::MAX];
    let mut join = HybridHashJoin::with_heap_pool(KeyPrefixed, small_config(dir.path(), 16)).unwrap();
    for &k in &keys {
        join.put_build_row(&make_row(k, 4, 1)).unwrap();
        join.put_build_row(&make_row(k, 4, 2)).unwrap();
    }
    join.end_build().unwrap();
    for &k in &keys {
        assert!(join.try_probe(&make_row(k, 0, 0)).unwrap(), "key {k}");
        assert_eq!(join.build_side_iter().count(), 2);
    }
    assert!(!join.try_probe(&make_row(42, 0, 0)).unwrap());
}

/// # Scenario
/// One key holds most of the build side and recursion is disabled.
///
/// # Starting environment
/// Budget of 8 pages, `max_recursion_depth = 0`, compression and
/// asynchronous spill writes enabled.
///
/// # Actions
/// Run the full protocol including the sort-merge fallback.
///
/// # Expected behavior
/// - The hot key is deferred to sort-merge join.
/// - All pairs are still produced exactly once.
#[test]
fn hot_key_is_completed_by_sort_merge() {
    let dir = TempDir::new().unwrap();
    let config = JoinConfig {
        max_recursion_depth: 0,
        compression: true,
        async_spill_io: true,
        ..small_config(dir.path(), 8)
    };
    let mut join = HybridHashJoin::with_heap_pool(KeyPrefixed, config).unwrap();

    let mut build: Vec<Vec<u8>> = (0..2_000).map(|k| make_row(k, 8, 0)).collect();
    build.extend((0..3_000).map(|_| make_row(7, 8, 1)));
    let probe: Vec<Vec<u8>> = (0..2_000).chain(0..50).map(|k| make_row(k, 8, 2)).collect();

    let pairs = join_all(&mut join, &build, &probe).unwrap();
    assert!(!join.partitions_pending_for_smj().is_empty());
    assert_eq!(pairs[&7], 3_001 * 2);
    assert_eq!(pairs, expected_pairs(&build, &probe));
    join.free();
    assert!(join.partitions_pending_for_smj().is_empty());
}

// ================================================================================================
// Page pools
// ================================================================================================

/// # Scenario
/// A custom pool records every page handed out and taken back.
///
/// # Starting environment
/// `CountingPool` with room for the whole budget.
///
/// # Actions
/// Run a spilling join, then `free()`.
///
/// # Expected behavior
/// Every acquired page is released exactly once.
#[test]
fn custom_pool_sees_balanced_traffic() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(CountingPool::new(16));
    let mut join = HybridHashJoin::new(KeyPrefixed, pool.clone(), small_config(dir.path(), 16)).unwrap();

    let build: Vec<Vec<u8>> = (0..4_000).map(|k| make_row(k, 24, 0)).collect();
    let probe: Vec<Vec<u8>> = (0..4_000).map(|k| make_row(k, 0, 0)).collect();
    let pairs = join_all(&mut join, &build, &probe).unwrap();
    assert_eq!(pairs, expected_pairs(&build, &probe));

    join.free();
    let acquired = pool.acquired.load(Ordering::SeqCst);
    assert!(acquired > 16);
    assert_eq!(pool.released.load(Ordering::SeqCst), acquired);
    assert_eq!(pool.inner.in_use(), 0);
}

/// # Scenario
/// A pool that hands out pages of the wrong size.
///
/// # Starting environment
/// `CountingPool` returning 1 KiB pages while claiming 4 KiB.
///
/// # Actions
/// `put_build_row`.
///
/// # Expected behavior
/// The row is rejected with a page-size mismatch instead of corrupting
/// memory.
#[test]
fn wrong_sized_pages_are_rejected() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(CountingPool {
        bad_size: Some(1024),
        ..CountingPool::new(16)
    });
    let mut join = HybridHashJoin::new(KeyPrefixed, pool, small_config(dir.path(), 16)).unwrap();
    let err = join.put_build_row(&make_row(1, 0, 0)).unwrap_err();
    assert!(matches!(
        err,
        JoinError::Allocation(MemoryError::PageSizeMismatch { expected: PAGE_SIZE, actual: 1024 })
    ));
}

/// # Scenario
/// A pool that is empty from the start.
///
/// # Starting environment
/// `HeapPagePool` with capacity 0.
///
/// # Actions
/// `put_build_row`.
///
/// # Expected behavior
/// Nothing can be spilled to make room, so the allocation error surfaces.
#[test]
fn empty_pool_fails_allocation() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(HeapPagePool::new(PAGE_SIZE, 0));
    let mut join = HybridHashJoin::new(KeyPrefixed, pool, small_config(dir.path(), 16)).unwrap();
    let err = join.put_build_row(&make_row(1, 0, 0)).unwrap_err();
    assert!(matches!(
        err,
        JoinError::Allocation(MemoryError::PoolExhausted { capacity: 0 })
    ));
}

// ================================================================================================
// Concurrency
// ================================================================================================

/// # Scenario
/// Four joins run on four threads against one shared pool.
///
/// # Starting environment
/// `HeapPagePool` sized for exactly four budgets of 16 pages.
///
/// # Actions
/// Each thread joins its own key range and reports its pairs.
///
/// # Expected behavior
/// - Every join is complete.
/// - The pool never exceeds its capacity and ends with no page in use.
#[test]
fn joins_share_a_pool_across_threads() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(HeapPagePool::new(PAGE_SIZE, 64));
    let totals = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..4i64)
        .map(|t| {
            let pool = pool.clone();
            let totals = totals.clone();
            let config = small_config(dir.path(), 16);
            thread::spawn(move || {
                let mut join = HybridHashJoin::new(KeyPrefixed, pool, config).unwrap();
                let build: Vec<Vec<u8>> = (0..3_000).map(|k| make_row(t * 10_000 + k, 16, 0)).collect();
                let probe: Vec<Vec<u8>> = (0..3_000).map(|k| make_row(t * 10_000 + k, 0, 0)).collect();
                let pairs = join_all(&mut join, &build, &probe).unwrap();
                totals.lock().unwrap().push(pairs.values().sum::<u64>());
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*totals.lock().unwrap(), vec![3_000; 4]);
    assert!(pool.peak_in_use() <= 64);
    assert_eq!(pool.in_use(), 0);
}

// ================================================================================================
// Errors
// ================================================================================================

/// # Scenario
/// Protocol calls out of order, then after `close`.
///
/// # Starting environment
/// Fresh join.
///
/// # Actions
/// 1. `try_probe` while building.
/// 2. `close()`.
/// 3. `put_build_row` and `next_matching`.
///
/// # Expected behavior
/// `InvalidState` first, then `Closed` for every call.
#[test]
fn protocol_violations_are_errors() {
    let dir = TempDir::new().unwrap();
    let mut join = HybridHashJoin::with_heap_pool(KeyPrefixed, small_config(dir.path(), 8)).unwrap();
    assert!(matches!(
        join.try_probe(&make_row(1, 0, 0)),
        Err(JoinError::InvalidState { state: ProbeState::Building, .. })
    ));

    join.close();
    assert!(matches!(join.put_build_row(&make_row(1, 0, 0)), Err(JoinError::Closed)));
    assert!(matches!(join.next_matching(), Err(JoinError::Closed)));
    assert_eq!(join.state(), ProbeState::Closed);
}
