//! Linear histogram with atomic counters.
//!
//! Buckets cover the `[min, max]` inclusive range; values outside are clamped
//! to the first/last bucket. Recording is wait-free (one relaxed fetch_add);
//! snapshots are relaxed per-bucket loads and may be mutually slightly stale.

use crate::sync::atomic::{AtomicU64, Ordering};

pub struct Histogram {
    min: u64,
    max: u64,
    width: u64,
    counts: Box<[AtomicU64]>,
}

/// Point-in-time copy of a histogram's counters.
#[derive(Clone, Debug)]
pub struct HistogramSnapshot {
    pub min: u64,
    pub max: u64,
    pub counts: Vec<u64>,
}

impl Histogram {
    #[must_use]
    pub fn new(min: u64, max: u64, buckets: usize) -> Self {
        let max = max.max(min);
        let buckets = buckets.max(1);
        let span = max - min + 1;
        let width = (span.div_ceil(buckets as u64)).max(1);
        let counts = (0..buckets).map(|_| AtomicU64::new(0)).collect();
        Self {
            min,
            max,
            width,
            counts,
        }
    }

    #[inline]
    fn index_for(&self, v: u64) -> usize {
        if v <= self.min {
            return 0;
        }
        if v >= self.max {
            return self.counts.len() - 1;
        }
        let idx = ((v - self.min) / self.width) as usize;
        idx.min(self.counts.len() - 1)
    }

    #[inline]
    pub fn record(&self, v: u64) {
        self.counts[self.index_for(v)].fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            min: self.min,
            max: self.max,
            counts: self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
        }
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.counts.len()
    }
}
