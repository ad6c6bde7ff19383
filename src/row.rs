//! Row contract between the join and its caller.
//!
//! The join never interprets row bytes. It only needs each row's `i64` key
//! and, for probe rows, the same binary form that build rows arrive in.
//! Both extractors must be deterministic: the same row must always yield
//! the same key, or matches can be lost.

use std::borrow::Cow;

/// Key extraction and canonicalization for one join.
///
/// # Example
///
/// ```rust
/// use std::borrow::Cow;
/// use hybridjoin::RowAccessor;
///
/// /// Rows are `[key: i64 LE][payload ...]` on both sides.
/// struct Prefixed;
///
/// impl RowAccessor for Prefixed {
///     type ProbeRow = [u8];
///
///     fn build_key(&self, row: &[u8]) -> i64 {
///         i64::from_le_bytes(row[..8].try_into().unwrap())
///     }
///
///     fn probe_key(&self, row: &[u8]) -> i64 {
///         self.build_key(row)
///     }
///
///     fn probe_to_binary<'a>(&self, row: &'a [u8]) -> Cow<'a, [u8]> {
///         Cow::Borrowed(row)
///     }
/// }
/// ```
pub trait RowAccessor {
    /// The caller's probe row representation.
    type ProbeRow: ?Sized;

    /// Join key of a build row, given in binary form.
    fn build_key(&self, row: &[u8]) -> i64;

    /// Join key of a probe row.
    fn probe_key(&self, row: &Self::ProbeRow) -> i64;

    /// The probe row in the binary form used for build rows.
    fn probe_to_binary<'a>(&self, row: &'a Self::ProbeRow) -> Cow<'a, [u8]>;
}
