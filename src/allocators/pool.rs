use std::collections::VecDeque;
use std::fmt;
use std::ptr::NonNull;

use super::vm::{PlatformVmOps, VmError, VmOps};
use super::{align_up, stats, MAX_SCALAR_ALIGN};
use crate::histogram::Histogram;
use crate::sync::atomic::{AtomicU64, Ordering};

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

/// Bytes reserved at the start of every cell for the intrusive free-list link.
/// Poisoning and poison verification skip this prefix.
pub(crate) const LINK_BYTES: usize = std::mem::size_of::<usize>();

/// Hook invoked on raw cell bytes. `on_alloc` runs after zeroing; `on_free`
/// runs before poisoning.
pub type PoolHook = std::sync::Arc<dyn Fn(NonNull<u8>, usize) + Send + Sync>;

#[derive(Clone)]
pub struct PoolOptions {
    pub zero_on_alloc: bool,
    pub poison_on_free: bool,
    pub verify_poison_on_alloc: bool,
    pub poison_byte: u8,
    /// Number of freed cells held back before re-entering the free list.
    /// 0 disables the quarantine.
    pub quarantine_size: usize,
    pub sample_histograms: bool,
    pub histogram_buckets: usize,
    pub on_alloc: Option<PoolHook>,
    pub on_free: Option<PoolHook>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            zero_on_alloc: false,
            poison_on_free: false,
            verify_poison_on_alloc: false,
            poison_byte: 0xA5,
            quarantine_size: 0,
            sample_histograms: false,
            histogram_buckets: 64,
            on_alloc: None,
            on_free: None,
        }
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("zero_on_alloc", &self.zero_on_alloc)
            .field("poison_on_free", &self.poison_on_free)
            .field("verify_poison_on_alloc", &self.verify_poison_on_alloc)
            .field("poison_byte", &self.poison_byte)
            .field("quarantine_size", &self.quarantine_size)
            .field("sample_histograms", &self.sample_histograms)
            .field("histogram_buckets", &self.histogram_buckets)
            .field("on_alloc", &self.on_alloc.as_ref().map(|_| ".."))
            .field("on_free", &self.on_free.as_ref().map(|_| ".."))
            .finish()
    }
}

impl PoolOptions {
    /// Every debug knob on: zeroing, poisoning with verification, quarantine,
    /// occupancy sampling.
    #[must_use]
    pub fn debug_strong(quarantine: usize) -> Self {
        Self {
            zero_on_alloc: true,
            poison_on_free: true,
            verify_poison_on_alloc: true,
            quarantine_size: quarantine,
            sample_histograms: true,
            ..Self::default()
        }
    }

    /// All debug knobs off.
    #[must_use]
    pub fn minimal_overhead() -> Self {
        Self::default()
    }
}

/// Point-in-time counter snapshot. Each field is an individually relaxed
/// load; the snapshot is not a single atomic cut.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub alloc_calls: u64,
    pub free_calls: u64,
    pub alloc_failures: u64,
    pub cas_failures: u64,
    pub in_use: u64,
    pub high_watermark: u64,
}

pub(crate) struct PoolCounters {
    alloc_calls: AtomicU64,
    free_calls: AtomicU64,
    alloc_failures: AtomicU64,
    cas_failures: AtomicU64,
    in_use: AtomicU64,
    high_watermark: AtomicU64,
}

impl PoolCounters {
    fn new() -> Self {
        Self {
            alloc_calls: AtomicU64::new(0),
            free_calls: AtomicU64::new(0),
            alloc_failures: AtomicU64::new(0),
            cas_failures: AtomicU64::new(0),
            in_use: AtomicU64::new(0),
            high_watermark: AtomicU64::new(0),
        }
    }

    /// Returns the post-increment `in_use` value for occupancy sampling.
    #[inline]
    pub(crate) fn note_alloc(&self) -> u64 {
        self.alloc_calls.fetch_add(1, Ordering::Relaxed);
        let in_use = self.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        self.high_watermark.fetch_max(in_use, Ordering::Relaxed);
        in_use
    }

    #[inline]
    pub(crate) fn note_alloc_failure(&self) {
        self.alloc_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn note_free(&self) {
        self.free_calls.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn note_cas_failure(&self) {
        self.cas_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            alloc_calls: self.alloc_calls.load(Ordering::Relaxed),
            free_calls: self.free_calls.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            cas_failures: self.cas_failures.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::Relaxed),
            high_watermark: self.high_watermark.load(Ordering::Relaxed),
        }
    }
}

/// Backing region, cell geometry, hygiene, and metrics shared by the
/// single-threaded and lock-free pools. The two front-ends differ only in
/// their free-list discipline.
pub(crate) struct PoolCore {
    base: NonNull<u8>,
    region_bytes: usize,
    aligned_object_size: usize,
    capacity: usize,
    pub(crate) opts: PoolOptions,
    pub(crate) counters: PoolCounters,
    occupancy: Option<Histogram>,
}

// Safety: PoolCore owns its mapped region exclusively.
unsafe impl Send for PoolCore {}

impl PoolCore {
    pub(crate) fn new(
        object_size: usize,
        capacity: usize,
        opts: PoolOptions,
    ) -> Result<Self, VmError> {
        assert!(capacity > 0, "pool capacity must be non-zero");

        // A cell must be able to hold the intrusive link.
        let object_size = object_size.max(LINK_BYTES);
        let aligned_object_size = align_up(object_size, MAX_SCALAR_ALIGN);

        let total = aligned_object_size.checked_mul(capacity).ok_or_else(|| {
            VmError::RegionOverflow(format!(
                "pool region {aligned_object_size} x {capacity} overflows usize"
            ))
        })?;
        let region_bytes = total.next_multiple_of(PlatformVmOps::page_size());

        // Safety: FFI call to map the backing region.
        let base = unsafe { PlatformVmOps::map(region_bytes)? };
        stats::MAPPED_BYTES.add(region_bytes);
        stats::MAPPED_REGIONS.add(1);

        let occupancy = opts.sample_histograms.then(|| {
            Histogram::new(0, capacity as u64, opts.histogram_buckets)
        });

        let core = Self {
            base,
            region_bytes,
            aligned_object_size,
            capacity,
            opts,
            counters: PoolCounters::new(),
            occupancy,
        };

        if core.opts.poison_on_free {
            // Pre-poison every cell tail so verify-on-alloc holds from the
            // very first allocation.
            for i in 0..core.capacity {
                // Safety: cell(i) is in-bounds for the region just mapped.
                unsafe { core.poison_tail(core.cell(i)) };
            }
        }

        Ok(core)
    }

    #[inline]
    pub(crate) fn cell(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.capacity);
        // Safety: index < capacity keeps the offset within the region.
        unsafe { self.base.as_ptr().add(index * self.aligned_object_size) }
    }

    #[inline]
    pub(crate) fn index_of(&self, addr: usize) -> usize {
        (addr - self.base.as_ptr() as usize) / self.aligned_object_size
    }

    /// True iff `addr` points at the start of a cell in this pool.
    #[inline]
    pub(crate) fn is_cell_start(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base
            && addr < base + self.aligned_object_size * self.capacity
            && (addr - base).is_multiple_of(self.aligned_object_size)
    }

    /// Fill a cell tail (everything past the link word) with the poison byte.
    ///
    /// # Safety
    /// `ptr` must be the start of a cell in this pool.
    pub(crate) unsafe fn poison_tail(&self, ptr: *mut u8) {
        // Safety: caller guarantees ptr is a cell start; the tail lies within it.
        unsafe {
            std::ptr::write_bytes(
                ptr.add(LINK_BYTES),
                self.opts.poison_byte,
                self.aligned_object_size - LINK_BYTES,
            );
        }
    }

    /// Verify a cell tail still carries the poison pattern. A mismatch means
    /// a use-after-free wrote through the cell and is fatal.
    ///
    /// # Safety
    /// `ptr` must be the start of a cell in this pool.
    unsafe fn verify_tail(&self, ptr: *mut u8) {
        for i in LINK_BYTES..self.aligned_object_size {
            // Safety: i < aligned_object_size keeps the read inside the cell.
            let b = unsafe { ptr.add(i).read() };
            assert!(
                b == self.opts.poison_byte,
                "pool corruption: use-after-free at {:p} (byte {} was 0x{:02x}, expected poison 0x{:02x})",
                ptr,
                i,
                b,
                self.opts.poison_byte,
            );
        }
    }

    /// Post-pop hygiene: verify poison, zero, then run the `on_alloc` hook.
    ///
    /// # Safety
    /// `ptr` must be a cell freshly popped from the free list, exclusively
    /// owned by the caller.
    pub(crate) unsafe fn apply_alloc_hygiene(&self, ptr: NonNull<u8>) {
        if self.opts.verify_poison_on_alloc && self.opts.poison_on_free {
            // Safety: ptr is a cell start per caller contract.
            unsafe { self.verify_tail(ptr.as_ptr()) };
        }
        if self.opts.zero_on_alloc {
            // Safety: the whole cell is exclusively owned.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, self.aligned_object_size) };
        }
        if let Some(hook) = &self.opts.on_alloc {
            hook(ptr, self.aligned_object_size);
        }
    }

    /// Pre-push hygiene: run the `on_free` hook, then poison.
    ///
    /// # Safety
    /// `ptr` must be a live cell being returned by its owner.
    pub(crate) unsafe fn apply_free_hygiene(&self, ptr: NonNull<u8>) {
        if let Some(hook) = &self.opts.on_free {
            hook(ptr, self.aligned_object_size);
        }
        if self.opts.poison_on_free {
            // Safety: ptr is a cell start per caller contract.
            unsafe { self.poison_tail(ptr.as_ptr()) };
        }
    }

    #[inline]
    pub(crate) fn sample_occupancy(&self, in_use: u64) {
        if let Some(h) = &self.occupancy {
            h.record(in_use);
        }
    }

    pub(crate) fn occupancy(&self) -> Option<&Histogram> {
        self.occupancy.as_ref()
    }

    #[inline]
    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn aligned_object_size(&self) -> usize {
        self.aligned_object_size
    }
}

impl Drop for PoolCore {
    fn drop(&mut self) {
        // Safety: the region was mapped with this exact size in `new`.
        // Release failures are swallowed; there is nothing useful to do.
        unsafe {
            drop(PlatformVmOps::unmap(self.base, self.region_bytes));
        }
        stats::MAPPED_BYTES.sub(self.region_bytes);
        stats::MAPPED_REGIONS.sub(1);
    }
}

/// Fixed-size cell allocator for a single owning thread.
///
/// Free cells form a LIFO list threaded through the first word of each cell.
/// With `quarantine_size > 0`, freed cells detour through a bounded FIFO
/// before becoming allocatable again, which delays reuse and lets
/// poison-verification catch late writes.
pub struct PoolAllocator {
    core: PoolCore,
    free_head: *mut u8,
    quarantine: VecDeque<NonNull<u8>>,
    #[cfg(debug_assertions)]
    live_mask: FixedBitSet,
}

// Safety: PoolAllocator owns its backing region; the raw pointers never
// alias another allocator's memory. Not Sync: the free list is unguarded.
unsafe impl Send for PoolAllocator {}

impl PoolAllocator {
    /// Create a pool of `capacity` cells, each of at least `object_size`
    /// bytes (rounded up to the maximum scalar alignment).
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the backing region cannot be mapped.
    pub fn new(object_size: usize, capacity: usize, opts: PoolOptions) -> Result<Self, VmError> {
        let core = PoolCore::new(object_size, capacity, opts)?;

        // Thread the free list through the cells: each cell's first word
        // points at the next cell, the last is null, head = first.
        for i in 0..capacity - 1 {
            // Safety: cell(i) is in-bounds and at least word-sized.
            unsafe {
                core.cell(i).cast::<usize>().write(core.cell(i + 1) as usize);
            }
        }
        // Safety: last cell is in-bounds.
        unsafe { core.cell(capacity - 1).cast::<usize>().write(0) };

        let free_head = core.cell(0);
        Ok(Self {
            core,
            free_head,
            quarantine: VecDeque::new(),
            #[cfg(debug_assertions)]
            live_mask: FixedBitSet::with_capacity(capacity),
        })
    }

    /// Pop a cell from the free list, or `None` when the pool is exhausted
    /// (including exhaustion by quarantined cells).
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        let Some(head) = NonNull::new(self.free_head) else {
            self.core.counters.note_alloc_failure();
            return None;
        };

        // Safety: head is a free cell; its first word holds the next link.
        let next = unsafe { head.as_ptr().cast::<usize>().read() } as *mut u8;
        self.free_head = next;

        let in_use = self.core.counters.note_alloc();

        #[cfg(debug_assertions)]
        self.live_mask.insert(self.core.index_of(head.as_ptr() as usize));

        // Safety: head was just popped and is exclusively ours.
        unsafe { self.core.apply_alloc_hygiene(head) };
        self.core.sample_occupancy(in_use);

        Some(head)
    }

    /// Return a cell to the pool. Null is a no-op.
    ///
    /// # Safety
    /// - `ptr` must be null or a pointer previously returned by
    ///   [`allocate`](Self::allocate) on this pool.
    /// - `ptr` must not have been freed already.
    /// - `ptr` must not be used after this call.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        let Some(p) = NonNull::new(ptr) else {
            return;
        };

        #[cfg(debug_assertions)]
        {
            let addr = p.as_ptr() as usize;
            assert!(
                self.core.is_cell_start(addr),
                "pointer {p:p} does not belong to this pool"
            );
            let idx = self.core.index_of(addr);
            assert!(
                self.live_mask.contains(idx),
                "double free detected in pool for pointer {p:p}"
            );
            self.live_mask.set(idx, false);
        }

        // Safety: p is a live cell per caller contract.
        unsafe { self.core.apply_free_hygiene(p) };

        if self.core.opts.quarantine_size > 0 {
            self.quarantine.push_back(p);
            if self.quarantine.len() > self.core.opts.quarantine_size {
                // drain the oldest quarantined cell back to the free list
                let oldest = self.quarantine.pop_front().expect("quarantine non-empty");
                self.push_free(oldest);
            }
        } else {
            self.push_free(p);
        }

        self.core.counters.note_free();
    }

    #[inline]
    fn push_free(&mut self, p: NonNull<u8>) {
        // Safety: p is a freed cell; its first word is ours to reuse as a link.
        unsafe { p.as_ptr().cast::<usize>().write(self.free_head as usize) };
        self.free_head = p.as_ptr();
    }

    /// Allocate a cell and move `value` into it.
    ///
    /// Returns `None` when the pool is exhausted. The value is dropped (not
    /// leaked) in that case.
    pub fn construct<T>(&mut self, value: T) -> Option<NonNull<T>> {
        assert!(
            std::mem::size_of::<T>() <= self.core.aligned_object_size()
                && std::mem::align_of::<T>() <= MAX_SCALAR_ALIGN,
            "type does not fit this pool's cells"
        );
        let cell = self.allocate()?.cast::<T>();
        // Safety: the cell is exclusively ours, large and aligned enough for T.
        unsafe { cell.as_ptr().write(value) };
        Some(cell)
    }

    /// Drop the value in place, then return its cell to the pool.
    ///
    /// # Safety
    /// `ptr` must have come from [`construct`](Self::construct) on this pool
    /// and must not be used afterwards.
    pub unsafe fn destroy<T>(&mut self, ptr: NonNull<T>) {
        // Safety: ptr holds a live T per caller contract.
        unsafe {
            std::ptr::drop_in_place(ptr.as_ptr());
            self.deallocate(ptr.as_ptr().cast());
        }
    }

    /// Cells currently held by callers.
    #[must_use]
    pub fn used(&self) -> usize {
        self.core.counters.snapshot().in_use as usize
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    /// Start of the backing region.
    #[must_use]
    pub fn memory(&self) -> *mut u8 {
        self.core.base_addr() as *mut u8
    }

    /// Total cell bytes (`aligned_object_size × capacity`).
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.core.aligned_object_size() * self.core.capacity()
    }

    /// Per-cell size after alignment rounding.
    #[must_use]
    pub fn aligned_object_size(&self) -> usize {
        self.core.aligned_object_size()
    }

    #[must_use]
    pub fn get_stats(&self) -> PoolStats {
        self.core.counters.snapshot()
    }

    /// Cells currently detained in the quarantine.
    #[must_use]
    pub fn quarantine_len(&self) -> usize {
        self.quarantine.len()
    }

    /// Length of the free list (walks the links; intended for tests and
    /// invariant checks, not hot paths).
    #[must_use]
    pub fn free_list_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free_head;
        while !cur.is_null() {
            n += 1;
            // Safety: every node on the free list is a valid cell whose first
            // word is the next link.
            cur = unsafe { cur.cast::<usize>().read() } as *mut u8;
        }
        n
    }

    /// Occupancy histogram, if `sample_histograms` was set.
    #[must_use]
    pub fn occupancy(&self) -> Option<&Histogram> {
        self.core.occupancy()
    }
}
