//! Host-side models of accelerator-resident buffers.
//!
//! Both buffers separate their logical size from their allocated capacity
//! and grow by a reservation ratio so that repeated small growth
//! doesn't reallocate every frame. Neither ever shrinks.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Capacity needed to hold `size` elements with the given reservation ratio.
#[inline]
pub fn reserved_capacity(size: usize, reserve_ratio: f64) -> usize {
    ((size as f64 * reserve_ratio).ceil() as usize).max(size)
}

/// A buffer with a logical length and a larger reserved capacity.
#[derive(Clone, Debug)]
pub struct ReservedBuffer<T> {
    data: Vec<T>,
    len: usize,
    reserve_ratio: f64,
}

impl<T: Clone + Default> ReservedBuffer<T> {
    pub fn new(reserve_ratio: f64) -> Self {
        Self {
            data: Vec::new(),
            len: 0,
            reserve_ratio: reserve_ratio.max(1.0),
        }
    }

    pub fn with_capacity(capacity: usize, reserve_ratio: f64) -> Self {
        Self {
            data: vec![T::default(); capacity],
            len: 0,
            reserve_ratio: reserve_ratio.max(1.0),
        }
    }

    /// Set the logical length, reallocating if it exceeds the capacity.
    /// Contents up to the old length are preserved and new elements are defaulted.
    /// Returns true if the buffer was reallocated.
    pub fn resize(&mut self, len: usize) -> bool {
        let grew = len > self.data.len();
        if grew {
            let new_cap = reserved_capacity(len, self.reserve_ratio);
            self.data.resize(new_cap, T::default());
        }
        for item in &mut self.data[self.len.min(len)..len] {
            *item = T::default();
        }
        self.len = len;
        grew
    }

    /// Fill the whole logical range with copies of a value.
    pub fn fill(&mut self, value: T) {
        for item in self.as_mut_slice() {
            *item = value.clone();
        }
    }
}

impl<T> ReservedBuffer<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data[..self.len]
    }
}

impl<T> std::ops::Deref for ReservedBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> std::ops::DerefMut for ReservedBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

//
// Candidate pairs
//

#[inline]
fn pack(a: u32, b: u32) -> u64 {
    ((a as u64) << 32) | b as u64
}

#[inline]
fn unpack(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

/// Output buffer for collision candidate pairs.
///
/// Detection kernels [`push`][Self::push] pairs concurrently through a shared reference.
/// The live count is an atomic counter that keeps counting past the capacity,
/// so after the kernel finishes the required size is known and the buffer can
/// grow and run the kernel again. `host_count` is the explicit host-visible
/// copy of the counter, updated only once a detection pass fits.
#[derive(Debug)]
pub struct CandidateBuffer {
    slots: Vec<AtomicU64>,
    counter: AtomicUsize,
    host_count: usize,
    reserve_ratio: f64,
}

impl CandidateBuffer {
    pub fn new(initial_capacity: usize, reserve_ratio: f64) -> Self {
        Self {
            slots: (0..initial_capacity).map(|_| AtomicU64::new(0)).collect(),
            counter: AtomicUsize::new(0),
            host_count: 0,
            reserve_ratio: reserve_ratio.max(1.0),
        }
    }

    /// Append a pair. Safe to call from many threads at once.
    /// Returns false if the pair didn't fit; the counter still records it.
    #[inline]
    pub fn push(&self, a: u32, b: u32) -> bool {
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        match self.slots.get(idx) {
            Some(slot) => {
                slot.store(pack(a, b), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Run a detection kernel until its output fits.
    ///
    /// On overflow the buffer grows to fit the required count times the
    /// reservation ratio and the kernel runs again, so no pair is ever dropped.
    /// Returns the number of times the buffer had to be reallocated.
    pub fn detect(&mut self, mut kernel: impl FnMut(&CandidateBuffer)) -> usize {
        let mut reallocations = 0;
        loop {
            self.counter.store(0, Ordering::Relaxed);
            kernel(self);
            let required = self.counter.load(Ordering::Acquire);
            if required <= self.slots.len() {
                self.host_count = required;
                return reallocations;
            }
            let new_cap = reserved_capacity(required, self.reserve_ratio);
            log::debug!(
                "candidate buffer overflow ({} > {}), growing to {}",
                required,
                self.slots.len(),
                new_cap
            );
            self.slots.resize_with(new_cap, || AtomicU64::new(0));
            reallocations += 1;
        }
    }

    /// Forget all pairs without touching the capacity.
    pub fn clear(&mut self) {
        self.counter.store(0, Ordering::Relaxed);
        self.host_count = 0;
    }

    /// Number of pairs found by the last completed detection.
    #[inline]
    pub fn len(&self) -> usize {
        self.host_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.host_count == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, i: usize) -> Option<(u32, u32)> {
        if i < self.host_count {
            Some(unpack(self.slots[i].load(Ordering::Relaxed)))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.slots[..self.host_count]
            .iter()
            .map(|slot| unpack(slot.load(Ordering::Relaxed)))
    }
}
