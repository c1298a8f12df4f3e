//! Loom-based concurrency tests.
//!
//! Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
//!
//! Exercise the lock-free pool's CAS discipline and the group mutex under
//! every thread interleaving loom can explore.
//!
//! # Design notes
//!
//! Loom exhaustively enumerates interleavings, so:
//!   - Thread counts kept to 2 (state space is exponential).
//!   - Loop iterations minimised to 1-2 per thread.
//!   - Pools are created fresh per model run; backing goes through the
//!     heap-backed VmOps mock under cfg(loom).
//!   - The CAS retry loops in allocate/push_free are contention-bounded by
//!     construction (two threads, tiny capacity), so no preemption bound is
//!     usually needed; the quarantine model uses `preemption_bound(3)` to
//!     keep the mutex + CAS product space tractable.
#[cfg(loom)]
mod tests {
    use crate::allocators::group::ArenaGroup;
    use crate::allocators::pool::PoolOptions;
    use crate::allocators::pool_lockfree::LockFreePoolAllocator;
    use crate::sync::Arc;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    #[test]
    fn loom_lockfree_pool_paired_alloc_free() {
        loom::model(|| {
            let pool = Arc::new(
                LockFreePoolAllocator::new(16, 2, PoolOptions::minimal_overhead()).unwrap(),
            );
            let p1 = pool.clone();
            let p2 = pool.clone();

            let t1 = loom::thread::spawn(move || {
                let p = p1.allocate().expect("capacity covers both threads");
                unsafe { p.as_ptr().write(0xAA) };
                assert_eq!(unsafe { p.as_ptr().read() }, 0xAA);
                unsafe { p1.deallocate(p.as_ptr()) };
            });

            let t2 = loom::thread::spawn(move || {
                let p = p2.allocate().expect("capacity covers both threads");
                unsafe { p.as_ptr().write(0xBB) };
                assert_eq!(unsafe { p.as_ptr().read() }, 0xBB);
                unsafe { p2.deallocate(p.as_ptr()) };
            });

            t1.join().unwrap();
            t2.join().unwrap();

            let s = pool.get_stats();
            assert_eq!(s.in_use, 0);
            assert_eq!(s.alloc_calls, 2);
            assert_eq!(s.free_calls, 2);
            assert_eq!(pool.free_list_len(), 2);
        });
    }

    #[test]
    fn loom_lockfree_pool_distinct_pointers() {
        loom::model(|| {
            let pool = Arc::new(
                LockFreePoolAllocator::new(16, 2, PoolOptions::minimal_overhead()).unwrap(),
            );
            let p1 = pool.clone();
            let p2 = pool.clone();

            let t1 = loom::thread::spawn(move || p1.allocate().unwrap().as_ptr() as usize);
            let t2 = loom::thread::spawn(move || p2.allocate().unwrap().as_ptr() as usize);

            let a = t1.join().unwrap();
            let b = t2.join().unwrap();
            assert_ne!(a, b, "two successful allocs must not alias");

            unsafe {
                pool.deallocate(a as *mut u8);
                pool.deallocate(b as *mut u8);
            }
        });
    }

    /// A popper that wins the cell must observe every write the previous
    /// owner made before freeing it (release push / acquire pop pairing on
    /// the head).
    #[test]
    fn loom_lockfree_pool_free_publishes_writes() {
        loom::model(|| {
            let pool = Arc::new(
                LockFreePoolAllocator::new(16, 1, PoolOptions::minimal_overhead()).unwrap(),
            );

            let first = pool.allocate().expect("fresh pool has one cell");
            unsafe { first.as_ptr().write(0x42) };
            let addr = first.as_ptr() as usize;

            let freer = pool.clone();
            let t_free = loom::thread::spawn(move || unsafe {
                freer.deallocate(addr as *mut u8);
            });

            let taker = pool.clone();
            let t_alloc = loom::thread::spawn(move || {
                taker.allocate().map(|p| unsafe { p.as_ptr().read() })
            });

            t_free.join().unwrap();
            let observed = t_alloc.join().unwrap();

            // Either the alloc lost the race (pool still empty) or it got the
            // recycled cell and must see the prior owner's write.
            if let Some(byte) = observed {
                assert_eq!(byte, 0x42);
            }
        });
    }

    #[test]
    fn loom_lockfree_pool_quarantine_drain() {
        bounded(3).check(|| {
            let opts = PoolOptions {
                quarantine_size: 1,
                ..PoolOptions::default()
            };
            let pool = Arc::new(LockFreePoolAllocator::new(16, 2, opts).unwrap());

            let a = pool.allocate().unwrap().as_ptr() as usize;
            let b = pool.allocate().unwrap().as_ptr() as usize;

            let f1 = pool.clone();
            let t1 = loom::thread::spawn(move || unsafe {
                f1.deallocate(a as *mut u8);
            });
            let f2 = pool.clone();
            let t2 = loom::thread::spawn(move || unsafe {
                f2.deallocate(b as *mut u8);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // Two frees through a 1-deep quarantine: exactly one cell is
            // detained, the other drained back to the free list.
            assert_eq!(pool.quarantine_len(), 1);
            assert_eq!(pool.free_list_len(), 1);
            assert_eq!(pool.get_stats().in_use, 0);
        });
    }

    #[test]
    fn loom_group_concurrent_acquire_release() {
        bounded(2).check(|| {
            let grp = Arc::new(ArenaGroup::new());
            let g1 = grp.clone();
            let g2 = grp.clone();

            let t1 = loom::thread::spawn(move || {
                let c = g1.acquire(64 * 1024, false, false).unwrap();
                assert_eq!(c.offset(), 0);
                g1.release(c);
            });

            let t2 = loom::thread::spawn(move || {
                let c = g2.acquire(64 * 1024, false, false).unwrap();
                assert_eq!(c.offset(), 0);
                g2.release(c);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            assert!(grp.cached_chunks() <= 2);
            grp.trim();
            assert_eq!(grp.cached_chunks(), 0);
        });
    }
}
