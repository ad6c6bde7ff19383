//! Key hashing for partition routing and bucket placement.
//!
//! Every recursion level uses its own seed, so keys that collide on one
//! level are redistributed on the next. Bucket placement uses a seed that
//! is unrelated to all level seeds: keys sharing a partition still spread
//! evenly over that partition's directory.

const LEVEL_SEED_STEP: u64 = 0x9E37_79B9_7F4A_7C15;
const BUCKET_SEED: u64 = 0xC2B2_AE3D_27D4_EB4F;

/// Largest fanout of a partition set.
pub const MAX_FANOUT: usize = 127;

/// Murmur3 64-bit finalizer.
#[inline]
pub(crate) fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    h = h.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    h ^= h >> 33;
    h
}

#[inline]
fn level_seed(level: u32) -> u64 {
    LEVEL_SEED_STEP.wrapping_mul(u64::from(level) + 1)
}

/// Hash that routes `key` to a partition at recursion `level`.
#[inline]
pub fn partition_hash(key: i64, level: u32) -> u32 {
    (fmix64(key as u64 ^ level_seed(level)) >> 32) as u32
}

/// Partition index of `key` in a set of `fanout` partitions at `level`.
#[inline]
pub fn partition_index(key: i64, level: u32, fanout: usize) -> usize {
    partition_hash(key, level) as usize % fanout
}

/// Hash that places `key` in a bucket directory.
#[inline]
pub(crate) fn bucket_hash(key: i64) -> u64 {
    fmix64((key as u64).wrapping_add(BUCKET_SEED))
}

/// Number of partitions for a set that may use `available` pages.
///
/// Defaults to a tenth of the pages, at most [`MAX_FANOUT`], and never more
/// than a quarter of the pages so spilled partitions' write buffers leave
/// room for resident data.
pub(crate) fn fanout_for(available: usize, hint: Option<usize>) -> usize {
    hint.unwrap_or(available / 10)
        .clamp(1, MAX_FANOUT)
        .min(available / 4)
        .max(1)
}
