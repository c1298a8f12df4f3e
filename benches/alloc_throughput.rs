use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use cellar::{ArenaAllocator, ArenaOptions, LockFreePoolAllocator, PoolAllocator, PoolOptions};

const OPS: u64 = 10_000;

/// Single-threaded pool alloc/free round trips.
fn pool_alloc_free(pool: &mut PoolAllocator) {
    for _ in 0..OPS {
        let p = pool.allocate().unwrap();
        black_box(p);
        // Safety: p was just allocated from this pool.
        unsafe { pool.deallocate(p.as_ptr()) };
    }
}

/// Lock-free pool round trips (uncontended; contention is the CLI harness's
/// job).
fn lockfree_alloc_free(pool: &LockFreePoolAllocator) {
    for _ in 0..OPS {
        let p = pool.allocate().unwrap();
        black_box(p);
        // Safety: p was just allocated from this pool.
        unsafe { pool.deallocate(p.as_ptr()) };
    }
}

/// Arena bump allocations with periodic reset.
fn arena_alloc_reset(arena: &mut ArenaAllocator, size: usize) {
    for i in 0..OPS {
        if i % 1024 == 0 {
            arena.reset();
        }
        let p = arena.allocate(size, cellar::MAX_SCALAR_ALIGN).unwrap();
        black_box(p);
    }
}

/// libc malloc/free baseline.
fn libc_malloc_free(size: usize) {
    for _ in 0..OPS {
        // Safety: paired malloc/free on the returned pointer.
        unsafe {
            let ptr = libc::malloc(size);
            black_box(ptr);
            libc::free(ptr);
        }
    }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_throughput");

    for size in [16usize, 64, 256, 1024] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("pool", size), &size, |b, &size| {
            let mut pool =
                PoolAllocator::new(size, 4096, PoolOptions::minimal_overhead()).unwrap();
            b.iter(|| pool_alloc_free(&mut pool));
        });

        group.bench_with_input(BenchmarkId::new("lockfree", size), &size, |b, &size| {
            let pool =
                LockFreePoolAllocator::new(size, 4096, PoolOptions::minimal_overhead()).unwrap();
            b.iter(|| lockfree_alloc_free(&pool));
        });

        group.bench_with_input(BenchmarkId::new("arena", size), &size, |b, &size| {
            let mut arena = ArenaAllocator::new(ArenaOptions::default()).unwrap();
            b.iter(|| arena_alloc_reset(&mut arena, size));
        });

        group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
            b.iter(|| libc_malloc_free(size));
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
