//! Pure slot distribution calculations.
//!
//! All functions in this module are pure, side-effect free, and fully testable.
//! They compute how a slot budget is split across master nodes.

use std::collections::BTreeSet;

/// Total number of hash slots in a Valkey cluster.
pub const TOTAL_SLOTS: u16 = 16384;

/// A contiguous range of hash slots [start, end] inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotRange {
    /// Start of the slot range (inclusive).
    pub start: u16,
    /// End of the slot range (inclusive).
    pub end: u16,
}

impl SlotRange {
    /// Create a new slot range.
    ///
    /// # Panics
    /// Debug-only assertion checks that start <= end.
    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start <= end, "start ({}) must be <= end ({})", start, end);
        Self { start, end }
    }

    /// Create a single-slot range.
    pub fn single(slot: u16) -> Self {
        Self {
            start: slot,
            end: slot,
        }
    }

    /// Get the number of slots in this range.
    pub fn count(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Check if this range contains a specific slot.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Iterate over all slots in this range.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Divide `n` into `m` chunks whose sizes differ by at most one.
///
/// The first `n % m` chunks receive the extra unit. Returns an empty vector
/// when `m` is zero.
///
/// # Examples
///
/// ```
/// use valkey_clu::slots::distribution::divide;
///
/// assert_eq!(divide(16384, 3), vec![5462, 5461, 5461]);
/// assert_eq!(divide(2, 4), vec![1, 1, 0, 0]);
/// ```
pub fn divide(n: usize, m: usize) -> Vec<usize> {
    if m == 0 {
        return Vec::new();
    }

    let base = n / m;
    let remainder = n % m;

    (0..m)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Split `total` slots into `master_count` contiguous ranges sized by [`divide`].
///
/// # Examples
///
/// ```
/// use valkey_clu::slots::distribution::{split_slots, SlotRange};
///
/// let ranges = split_slots(16384, 3);
/// assert_eq!(ranges[0], SlotRange::new(0, 5461));
/// assert_eq!(ranges[1], SlotRange::new(5462, 10922));
/// assert_eq!(ranges[2], SlotRange::new(10923, 16383));
/// ```
pub fn split_slots(total: u16, master_count: usize) -> Vec<SlotRange> {
    let mut ranges = Vec::with_capacity(master_count);
    let mut start: usize = 0;

    for count in divide(usize::from(total), master_count) {
        if count == 0 {
            continue;
        }
        let end = start + count - 1;
        // total fits in u16, so every boundary does too
        ranges.push(SlotRange::new(start as u16, end as u16));
        start = end + 1;
    }

    ranges
}

/// Collapse a set of slots into sorted contiguous ranges.
pub fn compress_slots<'a>(slots: impl IntoIterator<Item = &'a u16>) -> Vec<SlotRange> {
    let sorted: BTreeSet<u16> = slots.into_iter().copied().collect();
    let mut ranges: Vec<SlotRange> = Vec::new();

    for slot in sorted {
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(slot) => last.end = slot,
            _ => ranges.push(SlotRange::single(slot)),
        }
    }

    ranges
}

/// Slots in `0..total` that are not present in `assigned`.
pub fn missing_slots(total: u16, assigned: &BTreeSet<u16>) -> Vec<u16> {
    (0..total).filter(|s| !assigned.contains(s)).collect()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_range_single() {
        let range = SlotRange::single(100);
        assert_eq!(range.start, 100);
        assert_eq!(range.end, 100);
        assert_eq!(range.count(), 1);
    }

    #[test]
    fn test_slot_range_count() {
        assert_eq!(SlotRange::new(0, 5461).count(), 5462);
        assert_eq!(SlotRange::new(0, 16383).count(), 16384);
    }

    #[test]
    fn test_slot_range_contains() {
        let range = SlotRange::new(100, 200);
        assert!(range.contains(100));
        assert!(range.contains(200));
        assert!(!range.contains(99));
        assert!(!range.contains(201));
    }

    #[test]
    fn test_slot_range_display() {
        assert_eq!(format!("{}", SlotRange::new(0, 5461)), "0-5461");
        assert_eq!(format!("{}", SlotRange::single(100)), "100");
    }

    #[test]
    fn test_divide_even_and_uneven() {
        assert_eq!(divide(9, 3), vec![3, 3, 3]);
        assert_eq!(divide(10, 3), vec![4, 3, 3]);
        assert_eq!(divide(11, 3), vec![4, 4, 3]);
        assert_eq!(divide(0, 2), vec![0, 0]);
    }

    #[test]
    fn test_divide_zero_chunks() {
        assert!(divide(100, 0).is_empty());
    }

    #[test]
    fn test_divide_sums_to_n() {
        for m in 1..=20 {
            let chunks = divide(16384, m);
            assert_eq!(chunks.len(), m);
            assert_eq!(chunks.iter().sum::<usize>(), 16384);
            let max = chunks.iter().max().unwrap();
            let min = chunks.iter().min().unwrap();
            assert!(max - min <= 1, "m={} chunks differ by more than one", m);
        }
    }

    #[test]
    fn test_split_slots_contiguous() {
        for master_count in 1..=20 {
            let ranges = split_slots(TOTAL_SLOTS, master_count);
            assert_eq!(ranges.first().unwrap().start, 0);
            assert_eq!(ranges.last().map(|r| r.end), Some(TOTAL_SLOTS - 1));
            for i in 1..ranges.len() {
                assert_eq!(ranges[i].start, ranges[i - 1].end + 1);
            }
            let total: usize = ranges.iter().map(|r| r.count()).sum();
            assert_eq!(total, usize::from(TOTAL_SLOTS));
        }
    }

    #[test]
    fn test_split_slots_small_space() {
        let ranges = split_slots(2, 3);
        assert_eq!(ranges, vec![SlotRange::single(0), SlotRange::single(1)]);
    }

    #[test]
    fn test_compress_slots() {
        let slots = [5, 1, 2, 3, 7, 8];
        assert_eq!(
            compress_slots(&slots),
            vec![
                SlotRange::new(1, 3),
                SlotRange::single(5),
                SlotRange::new(7, 8)
            ]
        );
        assert!(compress_slots(&[]).is_empty());
    }

    #[test]
    fn test_missing_slots() {
        let assigned: BTreeSet<u16> = (0..8).filter(|s| s % 2 == 0).collect();
        assert_eq!(missing_slots(8, &assigned), vec![1, 3, 5, 7]);
    }
}
