//! Allocator benchmark harness.
//!
//! Drives one of the crate's allocators (or the system allocator as a
//! baseline) from N threads and reports throughput plus p50/p95/p99 latency.
//!
//! ```text
//! alloc_bench --allocator=lockfree --threads=8 --iters=100000 --size=64 --live=1024
//! ```
//!
//! `--live=0` frees (or resets, for the arena) immediately; `--live=N`
//! maintains a per-thread live set of `ceil(N / threads)` allocations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, ValueEnum};

use cellar::{stats, ArenaAllocator, ArenaOptions, LockFreePoolAllocator, PoolAllocator, PoolOptions};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AllocatorKind {
    /// Per-thread single-threaded pool.
    Pool,
    /// One lock-free pool shared by all threads.
    Lockfree,
    /// Per-thread bump arena.
    Arena,
    /// System allocator baseline.
    New,
}

#[derive(Debug, Parser)]
#[command(name = "alloc_bench")]
#[command(about = "Throughput/latency benchmark for cellar's allocators")]
struct Opts {
    #[arg(long, value_enum, default_value = "pool")]
    allocator: AllocatorKind,

    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Iterations per thread.
    #[arg(long, default_value_t = 100_000)]
    iters: usize,

    /// Allocation size in bytes.
    #[arg(long, default_value_t = 64)]
    size: usize,

    /// Target live set across the whole process; 0 = immediate free.
    #[arg(long, default_value_t = 0)]
    live: usize,
}

fn percentile(sorted: &[u64], p: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    sorted[(sorted.len() * p) / 100]
}

fn print_summary(
    name: &str,
    all_lat: Vec<Vec<u64>>,
    elapsed_ms: u128,
    threads: usize,
    iters: usize,
    size: usize,
) {
    let mut merged: Vec<u64> = all_lat.into_iter().flatten().collect();
    merged.sort_unstable();
    let avg = if merged.is_empty() {
        0.0
    } else {
        merged.iter().sum::<u64>() as f64 / merged.len() as f64
    };

    let ops = (threads as f64 * iters as f64) / (elapsed_ms as f64 / 1000.0 + 1e-9);
    println!("\nRunning: {name}");
    println!("Threads={threads} Iters/Thread={iters} Size={size} bytes");
    println!("Time: {elapsed_ms} ms  |  Throughput: {} ops/s", ops as u64);
    println!(
        "p50: {} ns, p95: {} ns, p99: {} ns, avg: {} ns",
        percentile(&merged, 50),
        percentile(&merged, 95),
        percentile(&merged, 99),
        avg as u64,
    );
    println!(
        "mapped: {} bytes in {} regions",
        stats::mapped_bytes(),
        stats::mapped_regions(),
    );
}

fn live_per_thread(opts: &Opts) -> usize {
    if opts.live == 0 {
        0
    } else {
        opts.live.div_ceil(opts.threads)
    }
}

/// Run `opts.threads` workers after a common start signal and collect their
/// per-iteration latencies.
fn run_workers<F>(opts: &Opts, worker: F) -> (Vec<Vec<u64>>, u128)
where
    F: Fn(usize) -> Vec<u64> + Send + Sync + 'static,
{
    let ready = Arc::new(AtomicBool::new(false));
    let worker = Arc::new(worker);

    let mut handles = Vec::with_capacity(opts.threads);
    for tid in 0..opts.threads {
        let ready = ready.clone();
        let worker = worker.clone();
        handles.push(std::thread::spawn(move || {
            while !ready.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
            worker(tid)
        }));
    }

    let t0 = Instant::now();
    ready.store(true, Ordering::Release);
    let lat: Vec<Vec<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    (lat, t0.elapsed().as_millis())
}

fn run_pool_per_thread(opts: &Opts) {
    let live_pt = live_per_thread(opts);
    let size = opts.size;
    let iters = opts.iters;

    let (lat, ms) = run_workers(opts, move |_tid| {
        // capacity: the live set, or enough for immediate-free churn
        let cap = if live_pt > 0 { live_pt } else { iters.max(1) };
        let mut pool = PoolAllocator::new(size, cap, PoolOptions::minimal_overhead())
            .expect("pool backing");

        let mut lat = Vec::with_capacity(iters);
        let mut ring: Vec<*mut u8> = Vec::with_capacity(live_pt.max(1));

        for _ in 0..iters {
            // free-before-alloc when the ring is full, so the live set never
            // bursts past its target
            if live_pt > 0 && ring.len() == live_pt {
                // Safety: the pointer came from this pool and leaves the ring.
                unsafe { pool.deallocate(ring.remove(0)) };
            }

            let t0 = Instant::now();
            let p = pool.allocate().expect("pool sized for the workload");
            lat.push(t0.elapsed().as_nanos() as u64);

            if live_pt == 0 {
                // Safety: p was just allocated from this pool.
                unsafe { pool.deallocate(p.as_ptr()) };
            } else {
                ring.push(p.as_ptr());
            }
        }
        for p in ring {
            // Safety: every ring pointer came from this pool.
            unsafe { pool.deallocate(p) };
        }
        lat
    });

    print_summary("pool (per-thread)", lat, ms, opts.threads, opts.iters, opts.size);
}

fn run_lockfree(opts: &Opts) {
    let live_pt = live_per_thread(opts);
    // capacity: all threads' live sets plus a safety margin, or a generous
    // churn buffer
    let cap = if live_pt > 0 {
        (live_pt + 1) * opts.threads
    } else {
        opts.threads * 1024
    };
    let pool = Arc::new(
        LockFreePoolAllocator::new(opts.size, cap, PoolOptions::minimal_overhead())
            .expect("pool backing"),
    );

    let iters = opts.iters;
    let shared = pool.clone();
    let (lat, ms) = run_workers(opts, move |_tid| {
        let mut lat = Vec::with_capacity(iters);
        let mut ring: Vec<*mut u8> = Vec::with_capacity(live_pt.max(1));

        for _ in 0..iters {
            if live_pt > 0 && ring.len() == live_pt {
                // Safety: the pointer came from this pool and leaves the ring.
                unsafe { shared.deallocate(ring.remove(0)) };
            }

            let t0 = Instant::now();
            let p = shared.allocate().expect("pool sized for the workload");
            lat.push(t0.elapsed().as_nanos() as u64);

            if live_pt == 0 {
                // Safety: p was just allocated from this pool.
                unsafe { shared.deallocate(p.as_ptr()) };
            } else {
                ring.push(p.as_ptr());
            }
        }
        for p in ring {
            // Safety: every ring pointer came from this pool.
            unsafe { shared.deallocate(p) };
        }
        lat
    });

    print_summary("lockfree (shared)", lat, ms, opts.threads, opts.iters, opts.size);

    let s = pool.get_stats();
    println!(
        "alloc_calls={} free_calls={} high_watermark={} cas_failures={} alloc_failures={}",
        s.alloc_calls, s.free_calls, s.high_watermark, s.cas_failures, s.alloc_failures,
    );
}

fn run_arena(opts: &Opts) {
    let live_pt = live_per_thread(opts);
    let size = opts.size;
    let iters = opts.iters;

    let (lat, ms) = run_workers(opts, move |_tid| {
        let mut arena = ArenaAllocator::new(ArenaOptions::default()).expect("arena backing");
        let mut lat = Vec::with_capacity(iters);

        let mut live_now = 0usize;
        for _ in 0..iters {
            // arenas have no per-object free: reset once the live target hits
            if live_pt > 0 && live_now == live_pt {
                arena.reset();
                live_now = 0;
            }

            let t0 = Instant::now();
            let p = arena
                .allocate(size, cellar::MAX_SCALAR_ALIGN)
                .expect("arena backing");
            lat.push(t0.elapsed().as_nanos() as u64);
            std::hint::black_box(p);

            if live_pt > 0 {
                live_now += 1;
            }
        }
        arena.release();
        lat
    });

    print_summary("arena (per-thread)", lat, ms, opts.threads, opts.iters, opts.size);
}

fn run_system(opts: &Opts) {
    let live_pt = live_per_thread(opts);
    let size = opts.size.max(1);
    let iters = opts.iters;
    let layout = std::alloc::Layout::from_size_align(size, cellar::MAX_SCALAR_ALIGN)
        .expect("benchmark layout");

    let (lat, ms) = run_workers(opts, move |_tid| {
        let mut lat = Vec::with_capacity(iters);
        let mut ring: Vec<*mut u8> = Vec::with_capacity(live_pt.max(1));

        for _ in 0..iters {
            if live_pt > 0 && ring.len() == live_pt {
                // Safety: the pointer was allocated with `layout` below.
                unsafe { std::alloc::dealloc(ring.remove(0), layout) };
            }

            let t0 = Instant::now();
            // Safety: layout has non-zero size.
            let p = unsafe { std::alloc::alloc(layout) };
            lat.push(t0.elapsed().as_nanos() as u64);
            assert!(!p.is_null(), "system allocator returned null");

            if live_pt == 0 {
                // Safety: p was just allocated with `layout`.
                unsafe { std::alloc::dealloc(p, layout) };
            } else {
                ring.push(p);
            }
        }
        for p in ring {
            // Safety: every ring pointer was allocated with `layout`.
            unsafe { std::alloc::dealloc(p, layout) };
        }
        lat
    });

    print_summary("baseline system alloc", lat, ms, opts.threads, opts.iters, opts.size);
}

fn main() {
    // Unknown --allocator values make clap exit with code 2.
    let mut opts = Opts::parse();
    opts.threads = opts.threads.max(1);
    opts.iters = opts.iters.max(1);
    opts.size = opts.size.max(1);

    match opts.allocator {
        AllocatorKind::Pool => run_pool_per_thread(&opts),
        AllocatorKind::Lockfree => run_lockfree(&opts),
        AllocatorKind::Arena => run_arena(&opts),
        AllocatorKind::New => run_system(&opts),
    }
}
