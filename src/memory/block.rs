//! Page-granular blocks and the size arithmetic shared by every pool layer.
//!
//! A block is one OS mapping. Its [`BlockHeader`] is stamped at the front of
//! the mapping; everything after it is handed out by bumping `cursor`.

use super::vm::{PlatformVmOps, VmError, VmOps};
use std::ptr::NonNull;

/// Allocation granularity: every request is rounded up to pointer width.
pub const ALIGN: usize = std::mem::size_of::<usize>();

const MIN_ORDER: u32 = 1;

/// Smallest size ever handed out by the bump allocator.
pub const MIN_ALLOC: usize = ALIGN << MIN_ORDER;

/// Number of page-count classes in a slot index.
///
/// Slot `i` holds blocks of `i + 1` pages (4 KiB pages: 4 KiB .. 80 KiB).
pub const MAX_SLOTS: usize = 20;

/// Round `size` up to a multiple of `align` (a power of two).
/// Only for compile-time constants; runtime sizes go through [`align_allocation`].
pub(crate) const fn align_up(size: usize, align: usize) -> usize {
    (size + (align - 1)) & !(align - 1)
}

/// Round a request up to [`ALIGN`] with a [`MIN_ALLOC`] floor.
///
/// Returns `None` when rounding overflows `usize`.
#[inline]
#[must_use]
pub fn align_allocation(size: usize) -> Option<usize> {
    let aligned = size.checked_add(ALIGN - 1)? & !(ALIGN - 1);
    Some(aligned.max(MIN_ALLOC))
}

/// Pages a freshly acquired block needs to serve `size` usable bytes.
///
/// `ceil((size + BLOCK_HEADER_SIZE) / page_size)`, at least 1; `None` on overflow.
#[inline]
#[must_use]
pub fn pages_needed(size: usize, page_size: usize) -> Option<usize> {
    let total = size.checked_add(BLOCK_HEADER_SIZE)?;
    Some(total.div_ceil(page_size).max(1))
}

#[repr(C)]
pub(crate) struct BlockHeader {
    next: Option<NonNull<BlockHeader>>,
    begin: NonNull<u8>,
    cursor: NonNull<u8>,
    size_total: usize,
    size_usable: usize,
    size_available: usize,
}

/// Bytes at the front of every block taken by its header.
pub(crate) const BLOCK_HEADER_SIZE: usize = align_up(std::mem::size_of::<BlockHeader>(), ALIGN);

/// Handle to a mapped block.
///
/// The handle is a plain pointer; ownership is tracked by the slot index of the
/// pool that acquired it, which releases each block exactly once.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block(NonNull<BlockHeader>);

impl Block {
    /// Map `size_total` bytes (a non-zero page multiple) and stamp the header.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the OS refuses the mapping.
    pub(crate) fn acquire(size_total: usize) -> Result<Self, VmError> {
        debug_assert!(size_total > BLOCK_HEADER_SIZE);
        // Safety: FFI call to map; size is a page multiple supplied by the caller.
        let base = unsafe { PlatformVmOps::map(size_total)? };
        let header = base.cast::<BlockHeader>();
        // Safety: the mapping is at least BLOCK_HEADER_SIZE bytes and page
        // aligned, so the header fits and is aligned.
        let begin = unsafe { NonNull::new_unchecked(base.as_ptr().add(BLOCK_HEADER_SIZE)) };
        let size_usable = size_total - BLOCK_HEADER_SIZE;
        // Safety: header points at fresh, exclusively owned memory.
        unsafe {
            header.as_ptr().write(BlockHeader {
                next: None,
                begin,
                cursor: begin,
                size_total,
                size_usable,
                size_available: size_usable,
            });
        }
        tracing::trace!(size_total, base = ?base, "block acquired");
        Ok(Self(header))
    }

    /// Return the block's memory to the OS.
    ///
    /// # Safety
    ///
    /// The block must not be used (or released) again, and nothing may still
    /// point into it.
    pub(crate) unsafe fn release(self) -> Result<(), VmError> {
        let size_total = self.size_total();
        tracing::trace!(size_total, base = ?self.0, "block released");
        // Safety: the header sits at the base of a mapping of size_total bytes.
        unsafe { PlatformVmOps::unmap(self.0.cast::<u8>(), size_total) }
    }

    /// Rebuild a handle from a header pointer stored in an intrusive list.
    ///
    /// # Safety
    ///
    /// `raw` must come from [`as_raw`](Self::as_raw) of a live block.
    #[inline]
    pub(crate) unsafe fn from_raw(raw: NonNull<BlockHeader>) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) fn as_raw(self) -> NonNull<BlockHeader> {
        self.0
    }

    #[inline]
    fn header(&self) -> &BlockHeader {
        // Safety: a Block handle only exists for a live mapping.
        unsafe { self.0.as_ref() }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut BlockHeader {
        // Safety: a Block handle only exists for a live mapping; callers hold
        // the tree lock (or own the tree exclusively) and never keep two of
        // these borrows alive at once.
        unsafe { &mut *self.0.as_ptr() }
    }

    #[inline]
    pub(crate) fn next(self) -> Option<Block> {
        self.header().next.map(Block)
    }

    #[inline]
    pub(crate) fn set_next(self, next: Option<Block>) {
        self.header_mut().next = next.map(Block::as_raw);
    }

    #[inline]
    pub(crate) fn size_total(self) -> usize {
        self.header().size_total
    }

    #[inline]
    pub(crate) fn size_usable(self) -> usize {
        self.header().size_usable
    }

    #[inline]
    pub(crate) fn size_available(self) -> usize {
        self.header().size_available
    }

    /// Bytes bumped since the last reset.
    #[inline]
    pub(crate) fn used(self) -> usize {
        let h = self.header();
        h.cursor.as_ptr() as usize - h.begin.as_ptr() as usize
    }

    /// Hand out `size` bytes (already aligned) from the cursor.
    #[inline]
    pub(crate) fn bump(self, size: usize) -> Option<NonNull<u8>> {
        let h = self.header_mut();
        if h.size_available < size {
            return None;
        }
        let mem = h.cursor;
        // Safety: size <= size_available keeps the cursor inside the mapping.
        h.cursor = unsafe { NonNull::new_unchecked(mem.as_ptr().add(size)) };
        h.size_available -= size;
        Some(mem)
    }

    /// Forget every bump since the last reset.
    #[inline]
    pub(crate) fn reset(self) {
        let h = self.header_mut();
        h.cursor = h.begin;
        h.size_available = h.size_usable;
    }

    /// Permanently remove `bytes` (aligned) from the front of the usable range
    /// and return where they start. Only valid on an untouched block.
    pub(crate) fn carve(self, bytes: usize) -> Option<NonNull<u8>> {
        let h = self.header_mut();
        if h.cursor != h.begin || h.size_usable < bytes {
            return None;
        }
        let carved = h.begin;
        // Safety: bytes <= size_usable keeps begin inside the mapping.
        h.begin = unsafe { NonNull::new_unchecked(carved.as_ptr().add(bytes)) };
        h.cursor = h.begin;
        h.size_usable -= bytes;
        h.size_available = h.size_usable;
        Some(carved)
    }

    /// True if `ptr` lies inside the block's usable range.
    #[cfg(test)]
    pub(crate) fn contains(self, ptr: *const u8) -> bool {
        let h = self.header();
        let begin = h.begin.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= begin && addr < begin + h.size_usable
    }
}
