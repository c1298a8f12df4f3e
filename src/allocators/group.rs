use super::arena::ArenaChunk;
use super::vm::VmError;
use crate::sync::Mutex;

/// Chunk size classes: 64 KiB, 256 KiB, 1 MiB, 4 MiB, 16 MiB, 64 MiB.
const BIN_COUNT: usize = 6;

const CLASS_BYTES: [usize; BIN_COUNT] = [
    64 * 1024,
    256 * 1024,
    1024 * 1024,
    4 * 1024 * 1024,
    16 * 1024 * 1024,
    64 * 1024 * 1024,
];

#[inline]
fn class_bytes(idx: usize) -> usize {
    CLASS_BYTES[idx.min(BIN_COUNT - 1)]
}

/// Smallest class that can satisfy `min_bytes`, clamped to the last bin.
#[inline]
fn acquire_index(min_bytes: usize) -> usize {
    (0..BIN_COUNT)
        .find(|&i| class_bytes(i) >= min_bytes)
        .unwrap_or(BIN_COUNT - 1)
}

/// Largest class a retired chunk of `size` bytes can back, or `None` for
/// chunks smaller than the smallest class.
#[inline]
fn release_index(size: usize) -> Option<usize> {
    (0..BIN_COUNT).rev().find(|&i| size >= class_bytes(i))
}

/// Cross-arena slab recycler.
///
/// Retired chunks are parked in size-classed LIFO bins and handed back to
/// whichever arena grows next. Every bin `i` holds only chunks of at least
/// `class_bytes(i)` bytes with their offset rewound; undersized chunks are
/// returned to the OS instead of polluting a bin.
///
/// All operations are serialized by a single mutex; a waiter may block
/// briefly. Bin length is unbounded — long-lived groups should call
/// [`trim`](Self::trim) periodically to hand memory back to the OS.
pub struct ArenaGroup {
    bins: Mutex<[Vec<ArenaChunk>; BIN_COUNT]>,
}

impl Default for ArenaGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaGroup {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bins: Mutex::new(std::array::from_fn(|_| Vec::new())),
        }
    }

    /// Pop a recycled chunk that fits `min_bytes`, or map a fresh one of at
    /// least `max(min_bytes, class_bytes)` bytes.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if a fresh chunk is needed and cannot be mapped.
    ///
    /// # Panics
    ///
    /// Panics if the group mutex is poisoned.
    pub fn acquire(
        &self,
        min_bytes: usize,
        guards: bool,
        prefer_huge: bool,
    ) -> Result<ArenaChunk, VmError> {
        let idx = acquire_index(min_bytes);
        {
            let mut bins = self.bins.lock().unwrap();
            if let Some(mut c) = bins[idx].pop() {
                c.offset = 0;
                return Ok(c);
            }
        }
        // Bin empty: map outside the lock so slow backing calls don't stall
        // other arenas.
        ArenaChunk::map(min_bytes.max(class_bytes(idx)), guards, prefer_huge)
    }

    /// Park a retired chunk in the bin matching its size. Chunks smaller
    /// than the smallest class go back to the OS.
    ///
    /// # Panics
    ///
    /// Panics if the group mutex is poisoned.
    pub fn release(&self, mut chunk: ArenaChunk) {
        let Some(idx) = release_index(chunk.size) else {
            // undersized: dropping unmaps it
            return;
        };
        chunk.offset = 0;
        self.bins.lock().unwrap()[idx].push(chunk);
    }

    /// Return every parked chunk to the OS. Capacity handed to arenas is
    /// unaffected.
    ///
    /// # Panics
    ///
    /// Panics if the group mutex is poisoned.
    pub fn trim(&self) {
        let mut bins = self.bins.lock().unwrap();
        for bin in bins.iter_mut() {
            bin.clear();
        }
    }

    /// Number of chunks currently parked across all bins.
    ///
    /// # Panics
    ///
    /// Panics if the group mutex is poisoned.
    #[must_use]
    pub fn cached_chunks(&self) -> usize {
        self.bins.lock().unwrap().iter().map(Vec::len).sum()
    }

    /// Bytes currently parked across all bins.
    ///
    /// # Panics
    ///
    /// Panics if the group mutex is poisoned.
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.bins
            .lock()
            .unwrap()
            .iter()
            .flat_map(|bin| bin.iter())
            .map(ArenaChunk::size)
            .sum()
    }
}
