//! Compact layout of per-entry counts in one contiguous buffer.

use std::ops::Range;

/// Turns per-entry contribution counts into a compact global layout
/// with an exclusive prefix sum.
///
/// After [`scan`][Self::scan], entry `i` owns the index range
/// `offsets[i]..offsets[i + 1]` of the global buffer,
/// and `offsets[len]` is the total count.
#[derive(Clone, Debug)]
pub struct OffsetCountCollection {
    counts: Vec<usize>,
    offsets: Vec<usize>,
    // counts changed since the last scan
    dirty: bool,
}

impl Default for OffsetCountCollection {
    fn default() -> Self {
        Self {
            counts: Vec::new(),
            offsets: vec![0],
            dirty: false,
        }
    }
}

impl OffsetCountCollection {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `n` zeroed count slots and `n + 1` zeroed offsets.
    pub fn resize(&mut self, n: usize) {
        self.counts.clear();
        self.counts.resize(n, 0);
        self.offsets.clear();
        self.offsets.resize(n + 1, 0);
        self.dirty = false;
    }

    /// Number of entries (not the total count, see [`total_count`][Self::total_count]).
    #[inline]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    #[inline]
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Mutable view for producers to write their counts into.
    /// [`scan`][Self::scan] must be called before offsets are read again.
    #[inline]
    pub fn counts_mut(&mut self) -> &mut [usize] {
        self.dirty = true;
        &mut self.counts
    }

    /// Recompute offsets from the current counts.
    pub fn scan(&mut self) {
        let mut acc = 0;
        for (offset, count) in self.offsets.iter_mut().zip(&self.counts) {
            *offset = acc;
            acc += count;
        }
        self.offsets[self.counts.len()] = acc;
        self.dirty = false;
    }

    /// Exclusive offsets, one more than the number of entries.
    #[inline]
    pub fn offsets(&self) -> &[usize] {
        debug_assert!(!self.dirty, "offsets read before scan");
        &self.offsets
    }

    #[inline]
    pub fn total_count(&self) -> usize {
        debug_assert!(!self.dirty, "total count read before scan");
        self.offsets[self.counts.len()]
    }

    /// Offset and count of a single entry.
    #[inline]
    pub fn offset_count(&self, i: usize) -> (usize, usize) {
        debug_assert!(!self.dirty, "offsets read before scan");
        (self.offsets[i], self.counts[i])
    }

    /// The global index range owned by entry `i`.
    #[inline]
    pub fn range(&self, i: usize) -> Range<usize> {
        debug_assert!(!self.dirty, "offsets read before scan");
        self.offsets[i]..self.offsets[i + 1]
    }
}
