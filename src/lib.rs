#[cfg(not(target_pointer_width = "64"))]
compile_error!("cellar supports only 64-bit targets.");

pub(crate) mod sync;

pub mod allocators;
pub mod histogram;

// pools
pub use allocators::pool::{PoolAllocator, PoolHook, PoolOptions, PoolStats};
pub use allocators::pool_lockfree::LockFreePoolAllocator;
pub use allocators::size_class::SizeClassPool;

// arenas
pub use allocators::arena::{
    ArenaAllocator, ArenaChunk, ArenaOptions, BlockHeader, JournalEntry, ThreadLocalArena,
};
pub use allocators::group::ArenaGroup;

// diagnostics
pub use allocators::stats;
pub use allocators::MAX_SCALAR_ALIGN;
pub use histogram::{Histogram, HistogramSnapshot};
