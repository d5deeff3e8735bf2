use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    MapFailed(std::io::Error),
    UnmapFailed(std::io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "VM map failed: {e}"),
            VmError::UnmapFailed(e) => write!(f, "VM unmap failed: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) | VmError::UnmapFailed(e) => Some(e),
        }
    }
}

/// Abstract interface for the page-granular memory primitive blocks are built on.
pub(crate) trait VmOps {
    /// Map `size` bytes of fresh, zero-filled, readable and writable memory.
    /// The returned pointer is aligned to [`page_size`](Self::page_size).
    ///
    /// `size` must be a non-zero multiple of the page size.
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Return a mapping to the OS (after which pointers into it are invalid).
    ///
    /// `ptr` and `size` must be exactly what a previous [`map`](Self::map)
    /// call used and returned; a mapping must not be released twice.
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(
                size.is_multiple_of(Self::page_size()),
                "map: size ({size}) must be a multiple of the page size"
            );

            // Safety: FFI call to mmap. Anonymous private mappings are
            // zero-filled by the kernel and released wholesale by munmap.
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
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// General-allocator fallback: heap-backed VmOps (no real mmap)
//
// Used where anonymous mappings are unavailable (non-unix targets) and under
// `cfg(loom)` / Miri, which cannot issue real VM syscalls.  Every "mapping" is
// a zeroed, page-aligned heap allocation released with `dealloc`.
// ---------------------------------------------------------------------------
#[cfg(any(not(unix), loom, miri))]
const FALLBACK_PAGE_SIZE: usize = 4096;

#[cfg(any(not(unix), loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size mapping",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, FALLBACK_PAGE_SIZE)
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
        let layout = std::alloc::Layout::from_size_align(size, FALLBACK_PAGE_SIZE)
            .map_err(|e| VmError::UnmapFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        FALLBACK_PAGE_SIZE
    }
}
