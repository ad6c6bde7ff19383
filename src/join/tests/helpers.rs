//! Shared fixtures for join tests.
//!
//! Rows are 8 bytes, `[key: i32 LE][value: i32 LE]`, on both sides, so a
//! 4 KiB page holds 146 records (28 bytes with the record header).

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use tracing_subscriber::EnvFilter;

use crate::row::RowAccessor;
use crate::{HybridHashJoin, JoinConfig, JoinError};

pub(crate) const PAGE_SIZE: usize = 4096;

pub(crate) type Row = [u8; 8];

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn row(key: i32, value: i32) -> Row {
    let mut r = [0u8; 8];
    r[..4].copy_from_slice(&key.to_le_bytes());
    r[4..].copy_from_slice(&value.to_le_bytes());
    r
}

pub(crate) fn key_of(row: &[u8]) -> i64 {
    i64::from(i32::from_le_bytes([row[0], row[1], row[2], row[3]]))
}

/// Accessor for [`row`]-encoded rows on both sides.
pub(crate) struct IntRows;

impl RowAccessor for IntRows {
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

pub(crate) fn config(spill_dir: &Path, budget: usize) -> JoinConfig {
    JoinConfig {
        page_size: PAGE_SIZE,
        memory_budget_pages: budget,
        spill_dir: spill_dir.to_path_buf(),
        ..JoinConfig::default()
    }
}

/// Build and probe inputs plus the reference answer.
pub(crate) struct Dataset {
    pub build: Vec<Row>,
    pub probe: Vec<Row>,
}

impl Dataset {
    /// `keys` keys with `build_per_key` build rows and `probe_per_key`
    /// probe rows each, shuffled.
    pub fn uniform(keys: i32, build_per_key: i32, probe_per_key: i32, seed: u64) -> Self {
        let mut build = Vec::new();
        let mut probe = Vec::new();
        for k in 0..keys {
            for v in 0..build_per_key {
                build.push(row(k, v));
            }
            for v in 0..probe_per_key {
                probe.push(row(k, v));
            }
        }
        let mut data = Self { build, probe };
        data.shuffle(seed);
        data
    }

    /// Adds `repeats` extra rows for each of `keys` on both sides.
    pub fn with_heavy_keys(mut self, keys: &[i32], repeats: i32, seed: u64) -> Self {
        for &k in keys {
            for v in 0..repeats {
                self.build.push(row(k, 1_000_000 + v));
                self.probe.push(row(k, 1_000_000 + v));
            }
        }
        self.shuffle(seed);
        self
    }

    fn shuffle(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        self.build.shuffle(&mut rng);
        self.probe.shuffle(&mut rng);
    }

    /// Matched pairs per key: build count × probe count.
    pub fn expected(&self) -> HashMap<i64, u64> {
        let build = count_keys(self.build.iter().map(|r| key_of(r)));
        let probe = count_keys(self.probe.iter().map(|r| key_of(r)));
        build
            .iter()
            .filter_map(|(k, b)| probe.get(k).map(|p| (*k, b * p)))
            .collect()
    }
}

pub(crate) fn count_keys(keys: impl Iterator<Item = i64>) -> HashMap<i64, u64> {
    let mut counts = HashMap::new();
    for k in keys {
        *counts.entry(k).or_insert(0) += 1;
    }
    counts
}

/// Pairs of the current match group, checking that every build row
/// carries the probe row's key and that the group is not empty.
fn count_group(join: &HybridHashJoin<IntRows>, pairs: &mut HashMap<i64, u64>) {
    let key = key_of(join.current_probe_row().unwrap());
    assert_eq!(join.current_key(), Some(key));
    let n = join
        .build_side_iter()
        .inspect(|b| assert_eq!(key_of(b), key))
        .count() as u64;
    assert!(n > 0, "empty match group for key {key}");
    *pairs.entry(key).or_insert(0) += n;
}

/// Builds, probes, and drains `join`, returning hash-matched pairs per key.
pub(crate) fn run(
    join: &mut HybridHashJoin<IntRows>,
    data: &Dataset,
) -> Result<HashMap<i64, u64>, JoinError> {
    for r in &data.build {
        join.put_build_row(r)?;
    }
    join.end_build()?;

    let mut pairs = HashMap::new();
    for r in &data.probe {
        if join.try_probe(r)? {
            count_group(join, &mut pairs);
        }
    }
    while join.next_matching()? {
        count_group(join, &mut pairs);
    }
    Ok(pairs)
}

/// Pairs per key the sort-merge fallback would produce for the deferred
/// partitions, plus per-key build and probe row counts found there.
pub(crate) struct SmjResult {
    pub pairs: HashMap<i64, u64>,
    pub build: Vec<HashMap<i64, u64>>,
    pub probe: Vec<HashMap<i64, u64>>,
}

pub(crate) fn smj(join: &HybridHashJoin<IntRows>) -> SmjResult {
    let mut result = SmjResult {
        pairs: HashMap::new(),
        build: Vec::new(),
        probe: Vec::new(),
    };
    for partition in join.partitions_pending_for_smj() {
        let build = count_keys(
            join.spilled_partition_build_iter(partition)
                .unwrap()
                .map(|r| r.unwrap().key),
        );
        let probe = count_keys(
            join.spilled_partition_probe_iter(partition)
                .unwrap()
                .map(|r| r.unwrap().key),
        );
        assert_eq!(build.values().sum::<u64>(), partition.build_records());
        assert_eq!(probe.values().sum::<u64>(), partition.probe_records());
        for (k, b) in &build {
            if let Some(p) = probe.get(k) {
                *result.pairs.entry(*k).or_insert(0) += b * p;
            }
        }
        result.build.push(build);
        result.probe.push(probe);
    }
    result
}

pub(crate) fn merge(mut a: HashMap<i64, u64>, b: &HashMap<i64, u64>) -> HashMap<i64, u64> {
    for (k, n) in b {
        *a.entry(*k).or_insert(0) += n;
    }
    a
}
