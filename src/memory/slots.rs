use super::block::{Block, BlockHeader, MAX_SLOTS};
use super::vm::VmError;
use std::ptr::NonNull;

/// Blocks grouped by page count: slot `i` is an intrusive list of `i + 1`-page blocks.
///
/// New blocks are pushed at the head of their list, so the freshest block of a
/// class is tried first.
#[derive(Clone, Copy)]
pub(crate) struct SlotIndex {
    heads: [Option<NonNull<BlockHeader>>; MAX_SLOTS],
}

/// What [`SlotIndex::release_all`] returned to the OS.
#[derive(Debug, Default)]
pub(crate) struct Released {
    pub(crate) blocks: usize,
    pub(crate) bytes: usize,
    pub(crate) first_error: Option<VmError>,
}

impl SlotIndex {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; MAX_SLOTS],
        }
    }

    #[inline]
    fn head(&self, slot: usize) -> Option<Block> {
        // Safety: heads only ever store pointers of live blocks owned by this index.
        self.heads[slot].map(|raw| unsafe { Block::from_raw(raw) })
    }

    /// Link `block` at the head of `slot`.
    pub(crate) fn push_front(&mut self, slot: usize, block: Block) {
        debug_assert!(slot < MAX_SLOTS, "slot {slot} out of range");
        block.set_next(self.head(slot));
        self.heads[slot] = Some(block.as_raw());
    }

    /// First block, scanning slots `start..` in order and each list in link
    /// order, with at least `size` bytes available.
    pub(crate) fn find_fit(&self, start: usize, size: usize) -> Option<Block> {
        (start..MAX_SLOTS)
            .flat_map(|slot| self.list(slot))
            .find(|block| block.size_available() >= size)
    }

    /// Bump `size` bytes out of the first fitting block.
    #[inline]
    pub(crate) fn bump_fit(&self, start: usize, size: usize) -> Option<NonNull<u8>> {
        self.find_fit(start, size).and_then(|block| block.bump(size))
    }

    /// Iterate the blocks of one slot in link order.
    pub(crate) fn list(&self, slot: usize) -> SlotIter<'_> {
        SlotIter {
            _index: self,
            cur: self.head(slot),
        }
    }

    /// Iterate every block together with its slot.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, Block)> + '_ {
        (0..MAX_SLOTS).flat_map(move |slot| self.list(slot).map(move |b| (slot, b)))
    }

    pub(crate) fn reset_all(&self) {
        for (_, block) in self.iter() {
            block.reset();
        }
    }

    /// Sum of usable bytes over every block.
    pub(crate) fn logical_size(&self) -> usize {
        self.iter().map(|(_, b)| b.size_usable()).sum()
    }

    /// Sum of not-yet-bumped bytes over every block.
    pub(crate) fn free_size(&self) -> usize {
        self.iter().map(|(_, b)| b.size_available()).sum()
    }

    /// OS pages committed, as `(slot + 1) * page_size` per block.
    pub(crate) fn reserved_size(&self, page_size: usize) -> usize {
        self.iter().map(|(slot, _)| (slot + 1) * page_size).sum()
    }

    pub(crate) fn block_count(&self) -> usize {
        self.iter().count()
    }

    /// Unmap every block and empty the index.
    ///
    /// # Safety
    ///
    /// Nothing may point into any of the blocks afterwards; the index must not
    /// share blocks with another index.
    pub(crate) unsafe fn release_all(&mut self) -> Released {
        let mut released = Released::default();
        for slot in 0..MAX_SLOTS {
            let mut cur = self.head(slot);
            self.heads[slot] = None;
            while let Some(block) = cur {
                cur = block.next();
                let bytes = block.size_total();
                // Safety: each block appears in exactly one list exactly once.
                match unsafe { block.release() } {
                    Ok(()) => {
                        released.blocks += 1;
                        released.bytes += bytes;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, bytes, "failed to release pool block");
                        released.first_error.get_or_insert(e);
                    }
                }
            }
        }
        released
    }
}

pub(crate) struct SlotIter<'a> {
    _index: &'a SlotIndex,
    cur: Option<Block>,
}

impl Iterator for SlotIter<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let block = self.cur?;
        self.cur = block.next();
        Some(block)
    }
}
