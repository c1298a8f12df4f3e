use std::fmt;
use std::ptr::NonNull;

/// Regions at least this large get a transparent-huge-page hint on Linux.
#[allow(dead_code)]
const HUGE_HINT_THRESHOLD: usize = 2 * 1024 * 1024;

#[derive(Debug)]
pub enum VmError {
    MapFailed(std::io::Error),
    UnmapFailed(std::io::Error),
    RegionOverflow(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "VM map failed: {e}"),
            VmError::UnmapFailed(e) => write!(f, "VM unmap failed: {e}"),
            VmError::RegionOverflow(msg) => write!(f, "VM region size overflow: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) | VmError::UnmapFailed(e) => Some(e),
            VmError::RegionOverflow(_) => None,
        }
    }
}

/// Abstract interface for the chunk backing.
///
/// A "region" here is a contiguous, immediately usable (read-write) range of
/// bytes.  Unlike a reserve/commit split, regions are physically backable from
/// the moment `map` returns; the allocators above this layer carve them up and
/// never touch protection bits again.
pub(crate) trait VmOps {
    /// Map a fresh anonymous read-write region of `size` bytes.
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Return a region to the OS (after which pointers into it are invalid).
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
            if size == 0 {
                return Err(VmError::MapFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size map",
                )));
            }

            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            if size >= super::HUGE_HINT_THRESHOLD {
                // Transparent Huge Pages: ask the kernel to back this region
                // with 2MB pages when possible.  Advisory only; failure is
                // ignored.
                // Safety: FFI call to madvise over the region just mapped.
                unsafe {
                    libc::madvise(ptr, size, libc::MADV_HUGEPAGE);
                }
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::MapFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; page size
                // fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler.  Instead we back every region
// with a plain heap allocation (via `std::alloc::alloc_zeroed` / `dealloc`).
//
// This is sufficient for testing the *synchronization* logic of the
// allocators (loom) and detecting undefined behaviour in unsafe pointer code
// (Miri); actual page behaviour is tested by the real platform implementation
// in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size map",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::MapFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::UnmapFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_map_write_unmap() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size).expect("map failed");
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            slice[size - 1] = 24;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[size - 1], 24);
            PlatformVmOps::unmap(ptr, size).expect("unmap failed");
        }
    }

    #[test]
    fn test_map_zero_size_fails() {
        // mmap with 0 size fails with EINVAL.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::map(0) };
        assert!(result.is_err(), "mapping 0 bytes should fail");
    }

    #[test]
    fn test_map_returns_zeroed_memory() {
        // Anonymous mappings are zero-filled by the kernel.
        let size = PlatformVmOps::page_size() * 4;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size).expect("map failed");
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), size);
            assert!(slice.iter().all(|&b| b == 0));
            PlatformVmOps::unmap(ptr, size).expect("unmap failed");
        }
    }

    #[test]
    fn test_multiple_regions_independent() {
        let page_size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let p1 = PlatformVmOps::map(page_size).expect("map 1 failed");
            let p2 = PlatformVmOps::map(page_size).expect("map 2 failed");
            assert_ne!(p1, p2);

            *p1.as_ptr() = 1;
            *p2.as_ptr() = 2;
            assert_eq!(*p1.as_ptr(), 1);
            assert_eq!(*p2.as_ptr(), 2);

            PlatformVmOps::unmap(p1, page_size).expect("unmap 1 failed");
            // p2 must still be valid
            assert_eq!(*p2.as_ptr(), 2);
            PlatformVmOps::unmap(p2, page_size).expect("unmap 2 failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert!(size.is_power_of_two(), "page size {size} is not a power of two");
    }

    #[test]
    fn test_map_large_region() {
        // 64MB crosses the huge-page-hint threshold on Linux.
        let size = 64 * 1024 * 1024;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size).expect("failed to map 64MB");
            *ptr.as_ptr().add(size - 1) = 0xEE;
            assert_eq!(*ptr.as_ptr().add(size - 1), 0xEE);
            PlatformVmOps::unmap(ptr, size).expect("unmap failed");
        }
    }
}
