//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g. bytes may briefly disagree with regions × sizes).
//! This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `get()`, which
/// clamps negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

// Bytes currently mapped by the chunk backing, across every allocator.
crate::sync::static_atomic! {
    pub static MAPPED_BYTES: Counter = Counter::new();
}
// Number of live mapped regions.
crate::sync::static_atomic! {
    pub static MAPPED_REGIONS: Counter = Counter::new();
}

/// Bytes currently mapped by the chunk backing.
#[must_use]
pub fn mapped_bytes() -> usize {
    MAPPED_BYTES.get()
}

/// Number of live mapped regions.
#[must_use]
pub fn mapped_regions() -> usize {
    MAPPED_REGIONS.get()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add_sub_get() {
        let c = Counter::new();
        c.add(10);
        c.add(5);
        c.sub(3);
        assert_eq!(c.get(), 12);
    }

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(100);
        assert_eq!(c.get(), 0);
        // recovers once the matching add lands
        c.add(150);
        assert_eq!(c.get(), 50);
    }
}
