//! Pool tree: the record table every pool of a tree lives in, the lock the
//! pools share, and the recursive clear/destroy walks.
//!
//! Pools are addressed by [`PoolId`] (slot index + generation) instead of raw
//! parent/child pointers. Destroying a pool bumps the generation of its slot,
//! so handles that outlive it resolve to nothing rather than to freed memory.
//!
//! # Locking
//!
//! With the `thread-safety` feature every operation holds the tree's
//! re-entrant lock for its whole search-or-mutate sequence. Cleanup callbacks
//! run with the lock held and may call back into any pool of the tree.
//! Cleanups registered on a pool while it is being torn down are kept aside:
//! a clear re-registers them for the next cycle, a destroy runs them once
//! after its children are gone. A cleanup that panics leaves the pool idle
//! again, with the cleanups it cut off still registered.
//! Mutable access to [`TreeState`] only ever happens inside
//! [`TreeShared::with_state`] scopes, and no user code runs inside one.

use super::block::{ALIGN, Block, align_allocation, align_up, pages_needed};
use super::cleanup::{self, Action, CLEANUP_NODE_SIZE, CleanupChain, CleanupFn, CleanupNode, Detached};
use super::pool::{PoolConfig, PoolError};
use super::slots::SlotIndex;
use super::stats::PoolStats;
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::cell::UnsafeCell;
use crate::sync::unsafe_cell_get_mut;
use std::alloc::Layout;
use std::ptr::NonNull;

#[cfg(feature = "thread-safety")]
use crate::sync::{ReentrantMutex, thread};

/// Stable address of a pool record inside its tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PoolId {
    index: u32,
    generation: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Clearing,
    Destroying,
    /// Destroy is running the cleanups registered during it; new ones are refused.
    Retiring,
}

/// Per-pool bookkeeping, carved from the front of the pool's first block.
pub(crate) struct PoolRecord {
    slots: SlotIndex,
    cleanups: CleanupChain,
    parent: Option<PoolId>,
    first_child: Option<PoolId>,
    next_sibling: Option<PoolId>,
    phase: Phase,
    /// Bumped whenever the pool's blocks are rewound.
    epoch: u64,
    #[cfg(feature = "thread-safety")]
    owner: thread::ThreadId,
}

const POOL_RECORD_SIZE: usize = align_up(std::mem::size_of::<PoolRecord>(), ALIGN);
const _: () = assert!(std::mem::align_of::<PoolRecord>() <= ALIGN);

/// Bytes bumped for a cleanup node when the free-list is empty.
const NODE_ALLOC: usize = align_up(CLEANUP_NODE_SIZE, ALIGN);

struct Entry {
    generation: u32,
    record: Option<NonNull<PoolRecord>>,
}

/// Record table of one tree.
pub(crate) struct TreeState {
    entries: Vec<Entry>,
    vacant: Vec<u32>,
}

impl TreeState {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
            vacant: Vec::new(),
        }
    }

    fn insert(&mut self, record: NonNull<PoolRecord>) -> PoolId {
        if let Some(index) = self.vacant.pop() {
            let entry = &mut self.entries[index as usize];
            entry.record = Some(record);
            return PoolId {
                index,
                generation: entry.generation,
            };
        }
        debug_assert!(u32::try_from(self.entries.len()).is_ok());
        #[allow(clippy::cast_possible_truncation)]
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            record: Some(record),
        });
        PoolId {
            index,
            generation: 0,
        }
    }

    fn record_mut(&mut self, id: PoolId) -> Option<&mut PoolRecord> {
        let entry = self.entries.get(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        // Safety: a present record points at the carved prefix of a block the
        // record's own slot index keeps mapped until `remove`.
        entry.record.map(|p| unsafe { &mut *p.as_ptr() })
    }

    fn remove(&mut self, id: PoolId) {
        let Some(entry) = self.entries.get_mut(id.index as usize) else {
            return;
        };
        if entry.generation != id.generation || entry.record.is_none() {
            return;
        }
        entry.record = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.vacant.push(id.index);
    }

    fn children(&mut self, id: PoolId) -> Vec<PoolId> {
        let mut out = Vec::new();
        let mut cur = self.record_mut(id).and_then(|r| r.first_child);
        while let Some(child) = cur {
            out.push(child);
            cur = self.record_mut(child).and_then(|r| r.next_sibling);
        }
        out
    }

    /// True if no pool of the subtree rooted at `root` is being torn down.
    fn subtree_idle(&mut self, root: PoolId) -> bool {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            match self.record_mut(id).map(|rec| rec.phase) {
                Some(Phase::Idle) => stack.extend(self.children(id)),
                Some(_) => return false,
                None => {}
            }
        }
        true
    }

    fn roots(&self) -> Vec<PoolId> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                // Safety: see `record_mut`.
                let rec = unsafe { entry.record?.as_ref() };
                #[allow(clippy::cast_possible_truncation)]
                let index = index as u32;
                rec.parent.is_none().then_some(PoolId {
                    index,
                    generation: entry.generation,
                })
            })
            .collect()
    }

    fn unlink_child(&mut self, parent: PoolId, id: PoolId, next: Option<PoolId>) {
        let Some(prec) = self.record_mut(parent) else {
            return;
        };
        if prec.first_child == Some(id) {
            prec.first_child = next;
            return;
        }
        let mut cur = prec.first_child;
        while let Some(sibling) = cur {
            let Some(srec) = self.record_mut(sibling) else {
                return;
            };
            if srec.next_sibling == Some(id) {
                srec.next_sibling = next;
                return;
            }
            cur = srec.next_sibling;
        }
    }

    /// Unlink `id` from its parent and retire its entry, handing back the
    /// blocks it owned.
    fn detach(&mut self, id: PoolId) -> Option<SlotIndex> {
        let rec = self.record_mut(id)?;
        let slots = rec.slots;
        let parent = rec.parent;
        let next = rec.next_sibling;
        if let Some(parent) = parent {
            self.unlink_child(parent, id, next);
        }
        self.remove(id);
        Some(slots)
    }
}

#[cfg(feature = "thread-safety")]
pub(crate) type TreeGuard<'a> = crate::sync::ReentrantMutexGuard<'a, ()>;

/// Without thread safety a tree is confined to one thread and takes no lock.
#[cfg(not(feature = "thread-safety"))]
pub(crate) struct TreeGuard<'a>(std::marker::PhantomData<&'a ()>);

#[cfg(feature = "thread-safety")]
fn owned_by_current_thread(rec: &PoolRecord) -> bool {
    rec.owner == thread::current().id()
}

#[cfg(not(feature = "thread-safety"))]
fn owned_by_current_thread(_rec: &PoolRecord) -> bool {
    true
}

/// State shared by every pool handle of one tree.
pub(crate) struct TreeShared {
    #[cfg(feature = "thread-safety")]
    lock: ReentrantMutex<()>,
    state: UnsafeCell<TreeState>,
    slot_limit: usize,
    page_size: usize,
    // Same `Arc` type as `PoolConfig::stats`; only cloned in `new`.
    stats: std::sync::Arc<PoolStats>,
}

// Safety: every access to `state` and to pool memory happens under `lock`.
#[cfg(feature = "thread-safety")]
unsafe impl Send for TreeShared {}
// Safety: as above.
#[cfg(feature = "thread-safety")]
unsafe impl Sync for TreeShared {}

impl TreeShared {
    pub(crate) fn new(config: &PoolConfig) -> Self {
        Self {
            #[cfg(feature = "thread-safety")]
            lock: ReentrantMutex::new(()),
            state: UnsafeCell::new(TreeState::new()),
            slot_limit: config.slot_limit,
            page_size: PlatformVmOps::page_size(),
            stats: config.stats.clone().unwrap_or_default(),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> TreeGuard<'_> {
        #[cfg(feature = "thread-safety")]
        {
            self.lock.lock()
        }
        #[cfg(not(feature = "thread-safety"))]
        {
            TreeGuard(std::marker::PhantomData)
        }
    }

    /// Run `f` with exclusive access to the record table.
    ///
    /// Callers hold the tree lock, and `f` must not run user code or call
    /// back into `with_state`.
    fn with_state<R>(&self, f: impl FnOnce(&mut TreeState) -> R) -> R {
        let state = unsafe_cell_get_mut!(self.state);
        f(state)
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub(crate) fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Slot that serves `aligned` bytes, or `None` for the oversized path.
    fn slot_for(&self, aligned: usize) -> Option<usize> {
        let slot = pages_needed(aligned, self.page_size)? - 1;
        (slot < self.slot_limit).then_some(slot)
    }

    pub(crate) fn create_pool(&self, size: usize, parent: Option<PoolId>) -> Result<PoolId, PoolError> {
        let pages = align_allocation(size)
            .and_then(|aligned| aligned.checked_add(POOL_RECORD_SIZE))
            .and_then(|with_record| pages_needed(with_record, self.page_size))
            .ok_or(PoolError::SizeOverflow { requested: size })?;
        if pages > self.slot_limit {
            return Err(PoolError::TooLarge {
                pages,
                slot_limit: self.slot_limit,
            });
        }
        let size_total = pages * self.page_size;

        let _guard = self.lock();
        if let Some(parent) = parent {
            let accepting = self.with_state(|s| {
                s.record_mut(parent)
                    .is_some_and(|r| matches!(r.phase, Phase::Idle | Phase::Clearing))
            });
            if !accepting {
                return Err(PoolError::Destroyed);
            }
        }

        let block = Block::acquire(size_total)?;
        let Some(mem) = block.carve(POOL_RECORD_SIZE) else {
            // Safety: the block was never published.
            if let Err(e) = unsafe { block.release() } {
                tracing::warn!(error = %e, bytes = size_total, "failed to release pool block");
            }
            return Err(PoolError::SizeOverflow { requested: size });
        };
        let mut slots = SlotIndex::new();
        slots.push_front(pages - 1, block);
        let record = mem.cast::<PoolRecord>();
        // Safety: `mem` is POOL_RECORD_SIZE bytes of fresh, ALIGN-aligned memory.
        unsafe {
            record.as_ptr().write(PoolRecord {
                slots,
                cleanups: CleanupChain::new(),
                parent,
                first_child: None,
                next_sibling: None,
                phase: Phase::Idle,
                epoch: 0,
                #[cfg(feature = "thread-safety")]
                owner: thread::current().id(),
            });
        }

        let id = self.with_state(|s| {
            let id = s.insert(record);
            if let Some(parent) = parent
                && let Some(prec) = s.record_mut(parent)
            {
                let first = prec.first_child.replace(id);
                if let Some(rec) = s.record_mut(id) {
                    rec.next_sibling = first;
                }
            }
            id
        });
        self.stats.block_mapped(size_total);
        self.stats.pools_live.add(1);
        tracing::debug!(?id, ?parent, size_total, "pool created");
        Ok(id)
    }

    /// Bump `aligned` bytes from the arena, growing it by one block of
    /// `slot + 1` pages when nothing fits.
    fn bump(&self, rec: &mut PoolRecord, aligned: usize, slot: usize) -> Result<NonNull<u8>, PoolError> {
        let mem = match rec.slots.bump_fit(slot, aligned) {
            Some(mem) => mem,
            None => {
                let size_total = (slot + 1) * self.page_size;
                let block = Block::acquire(size_total)?;
                self.stats.block_mapped(size_total);
                rec.slots.push_front(slot, block);
                block.bump(aligned).ok_or(PoolError::OutOfMemory { size: aligned })?
            }
        };
        self.stats.bytes_allocated.add(aligned);
        Ok(mem)
    }

    pub(crate) fn alloc(&self, id: PoolId, size: usize) -> Result<NonNull<u8>, PoolError> {
        let aligned = align_allocation(size).ok_or(PoolError::SizeOverflow { requested: size })?;
        let _guard = self.lock();
        match self.slot_for(aligned) {
            Some(slot) => self.with_state(|s| {
                let rec = s.record_mut(id).ok_or(PoolError::Destroyed)?;
                self.bump(rec, aligned, slot)
            }),
            None => self.alloc_oversized(id, aligned),
        }
    }

    fn alloc_oversized(&self, id: PoolId, aligned: usize) -> Result<NonNull<u8>, PoolError> {
        if !self.is_live(id) {
            return Err(PoolError::Destroyed);
        }
        let layout =
            Layout::from_size_align(aligned, ALIGN).map_err(|_| PoolError::SizeOverflow { requested: aligned })?;
        // Safety: layout has non-zero size.
        let mem = NonNull::new(unsafe { std::alloc::alloc(layout) }).ok_or(PoolError::OutOfMemory { size: aligned })?;
        if let Err(e) = self.add_cleanup(id, mem.as_ptr(), Action::FreeOversized(layout)) {
            // Safety: mem was allocated above with this layout and never published.
            unsafe { std::alloc::dealloc(mem.as_ptr(), layout) };
            return Err(e);
        }
        self.stats.bytes_allocated.add(aligned);
        self.stats.oversized_allocated.add(aligned);
        tracing::trace!(size = aligned, "oversized allocation from the general allocator");
        Ok(mem)
    }

    pub(crate) fn add_cleanup(&self, id: PoolId, data: *mut u8, action: Action) -> Result<(), PoolError> {
        let _guard = self.lock();
        let result = self.with_state(|s| {
            let Some(rec) = s.record_mut(id) else {
                return Err((PoolError::Destroyed, action));
            };
            match rec.phase {
                Phase::Idle => {
                    let node = match rec.cleanups.take_free() {
                        Some(node) => node,
                        None => match self.bump(rec, NODE_ALLOC, 0) {
                            Ok(mem) => mem.cast::<CleanupNode>(),
                            Err(e) => return Err((e, action)),
                        },
                    };
                    // Safety: node is NODE_ALLOC bytes of this pool's memory, fresh or recycled.
                    unsafe { rec.cleanups.push(node, data, action) };
                }
                Phase::Clearing | Phase::Destroying => rec.cleanups.defer(data, action),
                Phase::Retiring => return Err((PoolError::Destroyed, action)),
            }
            Ok(())
        });
        // A refused closure is dropped outside the state scope.
        result.map_err(|(e, action)| {
            drop(action);
            e
        })
    }

    pub(crate) fn run_cleanup(&self, id: PoolId, data: *mut u8, callback: CleanupFn) {
        let _guard = self.lock();
        let unlinked = self.with_state(|s| {
            let rec = s.record_mut(id)?;
            rec.cleanups.unlink(data, callback).map(|node| (node, rec.epoch))
        });
        let Some((node, epoch)) = unlinked else {
            let deferred = self.with_state(|s| s.record_mut(id)?.cleanups.unlink_deferred(data, callback));
            if let Some(action) = deferred {
                cleanup::invoke_action(data, action);
            }
            return;
        };
        // Safety: the node was just unlinked; its memory stays mapped at least
        // until the pool is destroyed, which the epoch check below detects.
        unsafe { cleanup::invoke_unlinked(node) };
        self.with_state(|s| {
            if let Some(rec) = s.record_mut(id)
                && rec.epoch == epoch
            {
                // Safety: unlinked above and not recycled since.
                unsafe { rec.cleanups.recycle(node) };
            }
        });
    }

    pub(crate) fn remove_cleanup(&self, id: PoolId, data: *mut u8, callback: CleanupFn) {
        let _guard = self.lock();
        let action = self.with_state(|s| {
            let rec = s.record_mut(id)?;
            let Some(node) = rec.cleanups.unlink(data, callback) else {
                return rec.cleanups.unlink_deferred(data, callback);
            };
            // Safety: unlinked above; recycled exactly once below.
            let (_, action) = unsafe { cleanup::take_action(node) };
            // Safety: as above.
            unsafe { rec.cleanups.recycle(node) };
            action
        });
        drop(action);
    }

    /// Run the cleanups that were registered on `id` when its teardown
    /// started. Registrations made while they run are deferred, not run here.
    fn run_registered(&self, id: PoolId) {
        let Some(detached) = self.with_state(|s| s.record_mut(id).map(|rec| rec.cleanups.detach_all())) else {
            return;
        };
        if detached.is_empty() {
            return;
        }
        let mut run = DetachedRun {
            tree: self,
            id,
            detached,
        };
        // Safety: the pool is being torn down, so nothing can rewind or
        // unmap its blocks while the detached nodes run.
        unsafe { run.detached.run() };
    }

    /// Put deferred registrations of `rec` back on its active chain, oldest
    /// first, in nodes bumped from its arena. Entries that find no memory
    /// stay deferred.
    fn requeue_deferred(&self, rec: &mut PoolRecord) {
        let mut entries = rec.cleanups.take_deferred().into_entries().into_iter();
        while let Some((data, action)) = entries.next() {
            let node = match rec.cleanups.take_free() {
                Some(node) => Ok(node),
                None => self.bump(rec, NODE_ALLOC, 0).map(|mem| mem.cast::<CleanupNode>()),
            };
            match node {
                // Safety: node is NODE_ALLOC bytes of this pool's memory, fresh or recycled.
                Ok(node) => unsafe { rec.cleanups.push(node, data, action) },
                Err(e) => {
                    tracing::warn!(error = %e, "no memory to re-register cleanups; keeping them deferred");
                    rec.cleanups.defer(data, action);
                    for (data, action) in entries {
                        rec.cleanups.defer(data, action);
                    }
                    return;
                }
            }
        }
    }

    /// Owner check plus re-entrancy check for a top-level clear/destroy.
    fn teardown_allowed(&self, id: PoolId) -> bool {
        self.with_state(|s| {
            let Some(rec) = s.record_mut(id) else {
                return false;
            };
            owned_by_current_thread(rec) && s.subtree_idle(id)
        })
    }

    fn enter_phase(&self, id: PoolId, phase: Phase) -> bool {
        self.with_state(|s| match s.record_mut(id) {
            Some(rec) => {
                rec.phase = phase;
                true
            }
            None => false,
        })
    }

    pub(crate) fn clear(&self, id: PoolId) {
        let _guard = self.lock();
        if self.teardown_allowed(id) {
            self.clear_node(id);
        }
    }

    fn clear_node(&self, id: PoolId) {
        if !self.enter_phase(id, Phase::Clearing) {
            return;
        }
        let mut guard = TeardownGuard {
            tree: self,
            id,
            committed: false,
        };
        self.run_registered(id);
        let children = self.with_state(|s| s.children(id));
        for child in children {
            self.clear_node(child);
        }
        self.with_state(|s| {
            if let Some(rec) = s.record_mut(id) {
                rec.slots.reset_all();
                rec.cleanups.forget_free();
                rec.epoch = rec.epoch.wrapping_add(1);
                self.requeue_deferred(rec);
                rec.phase = Phase::Idle;
            }
        });
        guard.committed = true;
    }

    pub(crate) fn destroy(&self, id: PoolId) {
        let _guard = self.lock();
        if self.teardown_allowed(id) {
            self.destroy_node(id);
        }
    }

    fn destroy_node(&self, id: PoolId) {
        if !self.enter_phase(id, Phase::Destroying) {
            return;
        }
        let mut guard = TeardownGuard {
            tree: self,
            id,
            committed: false,
        };
        self.run_registered(id);
        while let Some(child) = self.with_state(|s| s.record_mut(id).and_then(|rec| rec.first_child)) {
            self.destroy_node(child);
        }

        // Registered during this destroy, by the pool's own cleanups or its
        // children's. They run once; anything they register is refused.
        let late = self.with_state(|s| {
            s.record_mut(id).map(|rec| {
                rec.phase = Phase::Retiring;
                rec.cleanups.take_deferred()
            })
        });
        if let Some(mut late) = late {
            if !late.is_empty() {
                tracing::trace!(?id, count = late.len(), "running cleanups registered during destroy");
            }
            late.run();
        }
        guard.committed = true;

        let Some(mut slots) = self.with_state(|s| s.detach(id)) else {
            return;
        };
        // Safety: the record is retired, so nothing reaches these blocks again.
        let released = unsafe { slots.release_all() };
        self.stats.blocks_unmapped(released.blocks, released.bytes);
        self.stats.pools_live.sub(1);
        tracing::debug!(?id, blocks = released.blocks, bytes = released.bytes, "pool destroyed");
    }

    /// True while `id` runs its clear or destroy.
    pub(crate) fn tearing_down(&self, id: PoolId) -> bool {
        self.inspect(id, |r| r.phase != Phase::Idle).unwrap_or(false)
    }

    pub(crate) fn is_live(&self, id: PoolId) -> bool {
        let _guard = self.lock();
        self.with_state(|s| s.record_mut(id).is_some())
    }

    /// Apply `f` to a live record; `None` when `id` is stale.
    fn inspect<R>(&self, id: PoolId, f: impl FnOnce(&PoolRecord) -> R) -> Option<R> {
        let _guard = self.lock();
        self.with_state(|s| s.record_mut(id).map(|rec| f(&*rec)))
    }

    pub(crate) fn logical_size(&self, id: PoolId) -> usize {
        self.inspect(id, |r| r.slots.logical_size()).unwrap_or(0)
    }

    pub(crate) fn free_size(&self, id: PoolId) -> usize {
        self.inspect(id, |r| r.slots.free_size()).unwrap_or(0)
    }

    pub(crate) fn reserved_size(&self, id: PoolId) -> usize {
        self.inspect(id, |r| r.slots.reserved_size(self.page_size)).unwrap_or(0)
    }

    pub(crate) fn block_count(&self, id: PoolId) -> usize {
        self.inspect(id, |r| r.slots.block_count()).unwrap_or(0)
    }

    pub(crate) fn cleanup_count(&self, id: PoolId) -> usize {
        self.inspect(id, |r| r.cleanups.len()).unwrap_or(0)
    }

    pub(crate) fn parent(&self, id: PoolId) -> Option<PoolId> {
        self.inspect(id, |r| r.parent).flatten()
    }

    pub(crate) fn child_count(&self, id: PoolId) -> usize {
        let _guard = self.lock();
        self.with_state(|s| s.children(id).len())
    }
}

/// Hands the nodes of a detached chain back to their pool, including the ones
/// a panicking cleanup kept from running.
struct DetachedRun<'a> {
    tree: &'a TreeShared,
    id: PoolId,
    detached: Detached,
}

impl Drop for DetachedRun<'_> {
    fn drop(&mut self) {
        let detached = std::mem::take(&mut self.detached);
        self.tree.with_state(|s| {
            if let Some(rec) = s.record_mut(self.id) {
                // Safety: detached came from this pool's chain and its blocks
                // have not been rewound or unmapped since.
                unsafe { rec.cleanups.reclaim(detached) };
            }
        });
    }
}

/// Returns a pool to `Idle` if its clear or destroy unwinds, so later
/// teardowns of it and its ancestors are not refused.
struct TeardownGuard<'a> {
    tree: &'a TreeShared,
    id: PoolId,
    committed: bool,
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        tracing::warn!(id = ?self.id, "pool teardown unwound; pool left live");
        self.tree.with_state(|s| {
            if let Some(rec) = s.record_mut(self.id) {
                self.tree.requeue_deferred(rec);
                rec.phase = Phase::Idle;
            }
        });
    }
}

impl Drop for TreeShared {
    fn drop(&mut self) {
        let roots = self.with_state(|s| s.roots());
        for root in roots {
            self.destroy_node(root);
        }
    }
}
