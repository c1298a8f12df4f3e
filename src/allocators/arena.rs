use std::cell::RefCell;
use std::ptr::NonNull;

use super::group::ArenaGroup;
use super::vm::{PlatformVmOps, VmError, VmOps};
use super::{align_up, stats, MAX_SCALAR_ALIGN};
use crate::sync::Arc;

/// Magic value written into every block header.
const BLOCK_MAGIC: u32 = 0xABCD_1234;

/// Journal ring capacity, fixed; the ring is allocated lazily on first record.
const JOURNAL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct ArenaOptions {
    // Growth strategy
    pub initial_chunk_size: usize,
    /// Next chunk size multiplier; values <= 1.0 fall back to 2.0.
    pub growth_factor: f64,
    pub max_chunk_size: usize,

    // Guard/hugepage knobs. Accepted and carried, but the portable backing
    // only turns `prefer_huge` into a transparent-huge-page hint for large
    // maps; `guard_pages` has no effect.
    pub guard_pages: bool,
    pub prefer_huge: bool,

    // Canary redzones for corruption detection
    pub use_canaries: bool,
    /// Bytes before and after each payload.
    pub canary_size: usize,
    pub canary_byte: u8,

    // Journaling (ring buffer of large-allocation records)
    pub journaling: bool,
    /// Only record allocations of at least this many bytes.
    pub journal_threshold_bytes: usize,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        Self {
            initial_chunk_size: 1 << 20,
            growth_factor: 2.0,
            max_chunk_size: 1 << 26,
            guard_pages: false,
            prefer_huge: false,
            use_canaries: false,
            canary_size: 0,
            canary_byte: 0xCA,
            journaling: false,
            journal_threshold_bytes: 0,
        }
    }
}

/// A contiguous mapped region owned by exactly one arena (or parked in an
/// [`ArenaGroup`] bin) at a time.
pub struct ArenaChunk {
    pub(crate) base: NonNull<u8>,
    /// Usable (and mapped) bytes.
    pub(crate) size: usize,
    /// Bytes consumed; `0 <= offset <= size`.
    pub(crate) offset: usize,
}

// Safety: ArenaChunk owns its mapped region; transferring it between threads
// transfers exclusive ownership.
unsafe impl Send for ArenaChunk {}

impl ArenaChunk {
    /// Map a fresh chunk of at least `min_bytes` usable bytes (page-rounded,
    /// never below 4 KiB).
    pub(crate) fn map(
        min_bytes: usize,
        _guards: bool,
        _prefer_huge: bool,
    ) -> Result<Self, VmError> {
        let size = min_bytes
            .max(4096)
            .next_multiple_of(PlatformVmOps::page_size());
        // Safety: FFI call to map the chunk.
        let base = unsafe { PlatformVmOps::map(size)? };
        stats::MAPPED_BYTES.add(size);
        stats::MAPPED_REGIONS.add(1);
        Ok(Self {
            base,
            size,
            offset: 0,
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Drop for ArenaChunk {
    fn drop(&mut self) {
        // Safety: the region was mapped with this exact size in `map`.
        // Release failures are swallowed.
        unsafe {
            drop(PlatformVmOps::unmap(self.base, self.size));
        }
        stats::MAPPED_BYTES.sub(self.size);
        stats::MAPPED_REGIONS.sub(1);
    }
}

/// Header written immediately before each payload, aligned to the maximum
/// scalar alignment. Metadata only: the allocator never reads it back on the
/// hot path — it exists for post-mortem corruption analysis and tests.
#[repr(C)]
pub struct BlockHeader {
    pub magic: u32,
    _reserved: u32,
    pub payload_size: usize,
    pub alignment: usize,
    pub pre_canary: usize,
    pub post_canary: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JournalEntry {
    pub size: usize,
    pub alignment: usize,
}

/// Bump-pointer allocator over a growing sequence of chunks.
///
/// The last chunk is the active one; allocation carves from its tail and
/// grows geometrically on overflow. Individual objects are never freed —
/// [`reset`](Self::reset) rewinds every chunk, [`release`](Self::release)
/// returns them to the attached [`ArenaGroup`] or the OS.
///
/// Not thread-safe: an arena is owned by exactly one thread at any instant
/// (see [`ThreadLocalArena`]).
pub struct ArenaAllocator {
    opts: ArenaOptions,
    chunks: Vec<ArenaChunk>,
    next_chunk_bytes: usize,
    total_bytes: usize,
    group: Option<Arc<ArenaGroup>>,
    journal: Vec<JournalEntry>,
    journal_head: usize,
}

impl ArenaAllocator {
    /// Create an arena and eagerly map its first chunk, so `chunk_count()`
    /// is at least 1 from construction on.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the initial chunk cannot be mapped.
    pub fn new(opts: ArenaOptions) -> Result<Self, VmError> {
        let mut arena = Self {
            next_chunk_bytes: opts.initial_chunk_size.max(4096),
            opts,
            chunks: Vec::new(),
            total_bytes: 0,
            group: None,
            journal: Vec::new(),
            journal_head: 0,
        };
        let first = arena.new_chunk(0)?;
        arena.chunks.push(first);
        Ok(arena)
    }

    /// Attach a shared slab recycler; subsequent growth acquires from it and
    /// [`release`](Self::release) returns chunks to it.
    pub fn attach_group(&mut self, group: Arc<ArenaGroup>) {
        self.group = Some(group);
    }

    /// Allocate `bytes` with at least `align` alignment.
    ///
    /// Zero-byte requests are treated as one byte. `align` is raised to the
    /// maximum scalar alignment and rounded up to a power of two.
    ///
    /// # Errors
    ///
    /// Returns `VmError` only when the backing cannot map a new chunk.
    pub fn allocate(&mut self, bytes: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        let bytes = bytes.max(1);

        let mut align = align.max(MAX_SCALAR_ALIGN);
        if !align.is_power_of_two() {
            align = align.next_power_of_two();
        }

        if let Some(active) = self.chunks.last_mut() {
            if let Some(p) = Self::carve(&self.opts, active, bytes, align) {
                self.total_bytes += bytes;
                self.maybe_journal(bytes, align);
                return Ok(p);
            }
        }
        self.allocate_slow(bytes, align)
    }

    /// Allocate and move `value` into the arena.
    ///
    /// `T: Copy` keeps `Drop` types out: the arena never runs destructors,
    /// so storing one would silently leak its resources.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if allocation fails.
    pub fn construct<T: Copy>(&mut self, value: T) -> Result<&mut T, VmError> {
        let p = self
            .allocate(std::mem::size_of::<T>(), std::mem::align_of::<T>())?
            .cast::<T>();
        // Safety: p is fresh, sized and aligned for T.
        unsafe {
            p.as_ptr().write(value);
            Ok(&mut *p.as_ptr())
        }
    }

    /// Arenas do not free individual objects.
    pub fn destroy<T>(&self, _ptr: *mut T) {}

    /// Rewind every chunk without releasing or shrinking anything.
    pub fn reset(&mut self) {
        for c in &mut self.chunks {
            c.offset = 0;
        }
        self.total_bytes = 0;
        // journal left intact
    }

    /// Return every chunk to the attached group (or the OS) and start over.
    pub fn release(&mut self) {
        if let Some(group) = &self.group {
            for c in self.chunks.drain(..) {
                group.release(c);
            }
        } else {
            self.chunks.clear();
        }
        self.total_bytes = 0;
        self.next_chunk_bytes = self.opts.initial_chunk_size.max(4096);
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Unconsumed bytes in the active chunk.
    #[must_use]
    pub fn bytes_remaining(&self) -> usize {
        match self.chunks.last() {
            Some(c) => c.size.saturating_sub(c.offset),
            None => 0,
        }
    }

    /// Cumulative payload bytes handed out since construction or the last
    /// reset.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    #[must_use]
    pub fn options(&self) -> &ArenaOptions {
        &self.opts
    }

    /// Recorded journal entries (empty until the first qualifying
    /// allocation). The ring holds the most recent [`JOURNAL_CAPACITY`]
    /// records; the allocator itself never reads them.
    #[must_use]
    pub fn journal_entries(&self) -> &[JournalEntry] {
        &self.journal
    }

    // ---- carve: attempt to place header + canaries + payload in a chunk ----
    fn carve(
        opts: &ArenaOptions,
        c: &mut ArenaChunk,
        bytes: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        let base = c.base.as_ptr() as usize;
        let cur = base + c.offset;

        let hdr_addr = align_up(cur, MAX_SCALAR_ALIGN);
        let hdr_end = hdr_addr + std::mem::size_of::<BlockHeader>();

        let pre = if opts.use_canaries { opts.canary_size } else { 0 };
        let post = if opts.use_canaries { opts.canary_size } else { 0 };

        let user_addr = align_up(hdr_end.checked_add(pre)?, align);
        let end = user_addr.checked_add(bytes)?.checked_add(post)?;

        if end > base + c.size {
            return None;
        }

        // Safety: [hdr_addr, end) lies within the chunk's mapped region and
        // past its consumed prefix.
        unsafe {
            (hdr_addr as *mut BlockHeader).write(BlockHeader {
                magic: BLOCK_MAGIC,
                _reserved: 0,
                payload_size: bytes,
                alignment: align,
                pre_canary: pre,
                post_canary: post,
            });
            if pre > 0 {
                std::ptr::write_bytes((user_addr - pre) as *mut u8, opts.canary_byte, pre);
            }
            if post > 0 {
                std::ptr::write_bytes((user_addr + bytes) as *mut u8, opts.canary_byte, post);
            }
        }

        c.offset = end - base;
        NonNull::new(user_addr as *mut u8)
    }

    // ---- slow path: grow, retry, exact-fit fallback ----
    fn allocate_slow(&mut self, bytes: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        // Worst case within a fresh chunk:
        // [header aligned to max scalar] + pre canary + alignment slack
        // + payload + post canary.
        let header = align_up(std::mem::size_of::<BlockHeader>(), MAX_SCALAR_ALIGN);
        let pre = if self.opts.use_canaries {
            self.opts.canary_size
        } else {
            0
        };
        let post = pre;
        let worst = (header + pre + post)
            .checked_add(align)
            .and_then(|w| w.checked_add(bytes))
            .ok_or_else(|| {
                VmError::RegionOverflow(format!("arena request of {bytes} bytes overflows usize"))
            })?;

        // Geometric growth, bounded, and at least `worst`.
        let want = self
            .next_chunk_bytes
            .max(self.opts.initial_chunk_size)
            .max(worst)
            .min(self.opts.max_chunk_size);

        let grown = self.new_chunk(want)?;
        self.chunks.push(grown);

        // Advance growth for next time.
        let g = if self.opts.growth_factor > 1.0 {
            self.opts.growth_factor
        } else {
            2.0
        };
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let next = (want as f64 * g) as usize;
        self.next_chunk_bytes = next
            .max(worst)
            .max(self.opts.initial_chunk_size)
            .min(self.opts.max_chunk_size);

        // Retry on the fresh chunk.
        if let Some(p) = Self::carve(&self.opts, self.chunks.last_mut().expect("just pushed"), bytes, align)
        {
            self.total_bytes += bytes;
            self.maybe_journal(bytes, align);
            return Ok(p);
        }

        // The grown chunk was capped below what this request needs (e.g.
        // `worst` exceeds `max_chunk_size`). Acquire an exact-fit chunk.
        let exact = self.new_chunk(worst)?;
        self.chunks.push(exact);
        match Self::carve(&self.opts, self.chunks.last_mut().expect("just pushed"), bytes, align) {
            Some(p) => {
                self.total_bytes += bytes;
                self.maybe_journal(bytes, align);
                Ok(p)
            }
            None => panic!(
                "arena corruption: exact-fit chunk of {worst} bytes cannot hold a {bytes}-byte allocation (align {align})"
            ),
        }
    }

    // ---- chunk acquisition: group if attached, else the OS backing ----
    fn new_chunk(&self, min_bytes: usize) -> Result<ArenaChunk, VmError> {
        let want = min_bytes.max(self.next_chunk_bytes.max(4096));
        if let Some(group) = &self.group {
            return group.acquire(want, self.opts.guard_pages, self.opts.prefer_huge);
        }
        ArenaChunk::map(want, self.opts.guard_pages, self.opts.prefer_huge)
    }

    fn maybe_journal(&mut self, size: usize, alignment: usize) {
        if !self.opts.journaling || size < self.opts.journal_threshold_bytes {
            return;
        }
        if self.journal.is_empty() {
            // lazy init of the ring
            self.journal.resize(JOURNAL_CAPACITY, JournalEntry::default());
            self.journal_head = 0;
        }
        self.journal[self.journal_head] = JournalEntry { size, alignment };
        self.journal_head = (self.journal_head + 1) % self.journal.len();
    }
}

impl Drop for ArenaAllocator {
    fn drop(&mut self) {
        self.release();
    }
}

/// Lazy per-thread [`ArenaAllocator`] handle.
///
/// The arena is created with default options on first access and torn down
/// on thread exit. No cross-thread access to another thread's arena is
/// possible.
pub struct ThreadLocalArena;

thread_local! {
    static THREAD_ARENA: RefCell<Option<ArenaAllocator>> = const { RefCell::new(None) };
}

impl ThreadLocalArena {
    /// Run `f` against this thread's arena, creating it with default options
    /// if needed.
    ///
    /// # Panics
    ///
    /// Panics if the arena's initial chunk cannot be mapped.
    pub fn with<F, R>(f: F) -> R
    where
        F: FnOnce(&mut ArenaAllocator) -> R,
    {
        THREAD_ARENA.with(|slot| {
            let mut slot = slot.borrow_mut();
            let arena = slot.get_or_insert_with(|| {
                match ArenaAllocator::new(ArenaOptions::default()) {
                    Ok(a) => a,
                    Err(e) => panic!("failed to init thread-local arena: {e}"),
                }
            });
            f(arena)
        })
    }

    /// Replace this thread's arena with one built from `opts`.
    ///
    /// # Panics
    ///
    /// Panics if the new arena's initial chunk cannot be mapped.
    pub fn with_options(opts: ArenaOptions) {
        THREAD_ARENA.with(|slot| {
            let arena = match ArenaAllocator::new(opts) {
                Ok(a) => a,
                Err(e) => panic!("failed to init thread-local arena: {e}"),
            };
            *slot.borrow_mut() = Some(arena);
        });
    }

    /// Rewind this thread's arena, if it exists.
    pub fn reset() {
        THREAD_ARENA.with(|slot| {
            if let Some(a) = slot.borrow_mut().as_mut() {
                a.reset();
            }
        });
    }

    /// Release this thread's arena's chunks, if it exists.
    pub fn release() {
        THREAD_ARENA.with(|slot| {
            if let Some(a) = slot.borrow_mut().as_mut() {
                a.release();
            }
        });
    }
}
