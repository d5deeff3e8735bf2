//! Public pool handle.
//!
//! A [`Pool`] is a cheap, cloneable handle onto one node of a pool tree.
//! Allocation is a pointer bump inside OS-mapped blocks; memory is only given
//! back in bulk, by [`Pool::clear`] (keep the blocks, rewind them) or
//! [`Pool::destroy`] (unmap them). Both act on the whole subtree.
//!
//! ```
//! use treepool::Pool;
//!
//! let root = Pool::new(4096).unwrap();
//! let child = root.create_child(0).unwrap();
//! let buf = child.alloc(100).unwrap();
//! assert_eq!(buf.as_ptr() as usize % treepool::ALIGN, 0);
//! root.clear();
//! root.destroy();
//! assert!(!child.is_live());
//! ```

use super::block::{ALIGN, MAX_SLOTS};
use super::cleanup::{Action, CleanupFn};
use super::stats::{PoolStats, StatsSnapshot};
use super::tree::{PoolId, TreeShared};
use super::vm::VmError;
use crate::sync::Arc;
use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum PoolError {
    /// The OS refused to map a new block.
    Vm(VmError),
    /// The request does not fit the address-width arithmetic once aligned.
    SizeOverflow { requested: usize },
    /// An initial pool size needs more pages than the largest slot class.
    TooLarge { pages: usize, slot_limit: usize },
    /// The general allocator refused an oversized request.
    OutOfMemory { size: usize },
    /// The type needs stricter alignment than the pool provides.
    UnsupportedAlignment { align: usize },
    /// The pool (or an ancestor) has been destroyed.
    Destroyed,
    /// A value that needs dropping was allocated while its pool is being
    /// cleared or destroyed, so its memory would be rewound before the
    /// destructor could run.
    TearingDown,
    InvalidConfig(&'static str),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Vm(e) => write!(f, "block mapping failed: {e}"),
            PoolError::SizeOverflow { requested } => {
                write!(f, "size overflow aligning a request of {requested} bytes")
            }
            PoolError::TooLarge { pages, slot_limit } => {
                write!(f, "{pages} pages exceed the slot limit of {slot_limit}")
            }
            PoolError::OutOfMemory { size } => write!(f, "out of memory allocating {size} bytes"),
            PoolError::UnsupportedAlignment { align } => {
                write!(f, "alignment {align} exceeds the pool alignment of {ALIGN}")
            }
            PoolError::Destroyed => write!(f, "pool has been destroyed"),
            PoolError::TearingDown => write!(f, "pool is being cleared or destroyed"),
            PoolError::InvalidConfig(msg) => write!(f, "invalid pool config: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Vm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<VmError> for PoolError {
    fn from(e: VmError) -> Self {
        PoolError::Vm(e)
    }
}

/// Per-tree configuration, fixed when the root is created.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of slot classes the arena uses. Requests needing more pages take
    /// the oversized path. Must be in `1..=MAX_SLOTS`.
    pub slot_limit: usize,
    /// Statistics sink; a private one is created when `None`.
    // Plain std `Arc`: the sink is a caller-owned public type, cloned only
    // when a tree is built. Its counters are shim atomics, so loom still sees
    // every update.
    pub stats: Option<std::sync::Arc<PoolStats>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slot_limit: MAX_SLOTS,
            stats: None,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn with_slot_limit(mut self, slot_limit: usize) -> Self {
        self.slot_limit = slot_limit;
        self
    }

    /// Report into `stats`, which may be shared with other trees.
    ///
    /// Takes a `std::sync::Arc` under loom too; see the `stats` field.
    #[must_use]
    pub fn with_stats(mut self, stats: std::sync::Arc<PoolStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if `slot_limit` is outside `1..=MAX_SLOTS`.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.slot_limit == 0 {
            return Err(PoolError::InvalidConfig("slot_limit must be at least 1"));
        }
        if self.slot_limit > MAX_SLOTS {
            return Err(PoolError::InvalidConfig("slot_limit exceeds MAX_SLOTS"));
        }
        Ok(())
    }
}

/// Handle to one pool of a tree.
///
/// Clones refer to the same pool. Once the pool or one of its ancestors is
/// destroyed every handle to it is stale: allocation fails with
/// [`PoolError::Destroyed`], sizes read as zero and teardown calls do nothing.
/// Dropping the last handle of a tree destroys whatever is still live in it.
///
/// With the `thread-safety` feature (default) a pool is `Send + Sync`, and
/// allocation from any thread is serialized by one re-entrant lock per tree.
/// [`clear`](Self::clear) and [`destroy`](Self::destroy) only act when called
/// on the thread that created the pool. Without the feature the handle is
/// `!Send` and no lock is taken.
#[derive(Clone)]
pub struct Pool {
    tree: Arc<TreeShared>,
    id: PoolId,
}

fn drop_value<T>(data: *mut u8) {
    // Safety: registered by `alloc_val` for an initialised `T` at `data`.
    unsafe { std::ptr::drop_in_place(data.cast::<T>()) }
}

impl Pool {
    /// Create a root pool whose first block serves at least `initial_size` bytes.
    ///
    /// # Errors
    ///
    /// See [`with_config`](Self::with_config).
    pub fn new(initial_size: usize) -> Result<Self, PoolError> {
        Self::with_config(initial_size, PoolConfig::default())
    }

    /// # Errors
    ///
    /// `InvalidConfig` for a bad config, `SizeOverflow` or `TooLarge` when
    /// `initial_size` does not fit a slot class, and `Vm` when the OS refuses
    /// the first block.
    pub fn with_config(initial_size: usize, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let tree = Arc::new(TreeShared::new(&config));
        let id = tree.create_pool(initial_size, None)?;
        Ok(Self { tree, id })
    }

    /// Create a child pool sharing this pool's tree, lock and statistics.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new), plus `Destroyed` if this pool is stale or being
    /// destroyed.
    pub fn create_child(&self, initial_size: usize) -> Result<Self, PoolError> {
        let id = self.tree.create_pool(initial_size, Some(self.id))?;
        Ok(Self {
            tree: Arc::clone(&self.tree),
            id,
        })
    }

    /// Allocate `size` bytes aligned to [`ALIGN`]. The memory stays valid
    /// until the pool is cleared or destroyed.
    ///
    /// # Errors
    ///
    /// `SizeOverflow`, `Vm` or `OutOfMemory` when memory cannot be obtained,
    /// `Destroyed` on a stale handle.
    pub fn try_alloc(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
        self.tree.alloc(self.id, size)
    }

    #[must_use]
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.try_alloc(size).ok()
    }

    /// As [`try_alloc`](Self::try_alloc), with the first `size` bytes zeroed.
    ///
    /// # Errors
    ///
    /// As [`try_alloc`](Self::try_alloc).
    pub fn try_alloc_zeroed(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
        let mem = self.try_alloc(size)?;
        // Safety: mem points at least `size` writable bytes.
        unsafe { mem.as_ptr().write_bytes(0, size) };
        Ok(mem)
    }

    #[must_use]
    pub fn alloc_zeroed(&self, size: usize) -> Option<NonNull<u8>> {
        self.try_alloc_zeroed(size).ok()
    }

    /// Move `value` into the pool. If `T` needs dropping, its destructor runs
    /// as a cleanup on the next clear or destroy.
    ///
    /// # Errors
    ///
    /// `UnsupportedAlignment` if `T` needs more than [`ALIGN`]. `TearingDown`
    /// if `T` needs dropping and this is called from a cleanup while the pool
    /// itself is being cleared or destroyed. Otherwise as
    /// [`try_alloc`](Self::try_alloc). On error `value` is dropped.
    pub fn alloc_val<T: Send + 'static>(&self, value: T) -> Result<NonNull<T>, PoolError> {
        let align = std::mem::align_of::<T>();
        if align > ALIGN {
            return Err(PoolError::UnsupportedAlignment { align });
        }
        let _guard = self.tree.lock();
        if std::mem::needs_drop::<T>() && self.tree.tearing_down(self.id) {
            return Err(PoolError::TearingDown);
        }
        let mem = self.try_alloc(std::mem::size_of::<T>())?.cast::<T>();
        if std::mem::needs_drop::<T>() {
            self.tree
                .add_cleanup(self.id, mem.as_ptr().cast(), Action::Fn(drop_value::<T>))?;
        }
        // Safety: mem is fresh, aligned and large enough for a T. The cleanup
        // cannot run before the write since the tree lock is held.
        unsafe { mem.as_ptr().write(value) };
        Ok(mem)
    }

    /// Copy `src` into the pool.
    ///
    /// # Errors
    ///
    /// As [`alloc_val`](Self::alloc_val).
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> Result<NonNull<[T]>, PoolError> {
        let align = std::mem::align_of::<T>();
        if align > ALIGN {
            return Err(PoolError::UnsupportedAlignment { align });
        }
        let bytes = std::mem::size_of_val(src);
        let mem = self.try_alloc(bytes)?.cast::<T>();
        // Safety: mem holds `bytes` fresh bytes, aligned for T, disjoint from src.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), mem.as_ptr(), src.len()) };
        Ok(NonNull::slice_from_raw_parts(mem, src.len()))
    }

    /// Register `callback(data)` to run on the next clear or destroy.
    /// Cleanups run most recent first.
    ///
    /// A registration made while this pool is being cleared (from a cleanup)
    /// waits for the following clear; memory the callback points into must
    /// therefore not come from this pool. One made while it is being
    /// destroyed runs once, after the pool's children are gone.
    ///
    /// # Errors
    ///
    /// `Destroyed` on a stale handle, or an allocation error if the node
    /// itself cannot be allocated.
    pub fn register_cleanup(&self, data: *mut u8, callback: CleanupFn) -> Result<(), PoolError> {
        self.tree.add_cleanup(self.id, data, Action::Fn(callback))
    }

    /// Run now and unregister the most recent cleanup registered with
    /// exactly `(data, callback)`. Does nothing if there is none.
    pub fn run_cleanup(&self, data: *mut u8, callback: CleanupFn) {
        self.tree.run_cleanup(self.id, data, callback);
    }

    /// Unregister the most recent matching cleanup without running it.
    pub fn unregister_cleanup(&self, data: *mut u8, callback: CleanupFn) {
        self.tree.remove_cleanup(self.id, data, callback);
    }

    /// Register a closure to run on the next clear or destroy.
    ///
    /// # Errors
    ///
    /// As [`register_cleanup`](Self::register_cleanup).
    pub fn on_cleanup<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tree
            .add_cleanup(self.id, std::ptr::null_mut(), Action::Closure(Box::new(f)))
    }

    /// Run every cleanup of this pool and its descendants, then rewind every
    /// block. Blocks stay mapped for reuse; children stay alive.
    ///
    /// Does nothing on a stale handle, from a thread other than the pool's
    /// creator, or from inside a cleanup of a pool being torn down.
    pub fn clear(&self) {
        self.tree.clear(self.id);
    }

    /// Destroy this pool and its subtree: run cleanups and unmap every block.
    /// Same guards as [`clear`](Self::clear).
    pub fn destroy(self) {
        self.tree.destroy(self.id);
    }

    /// Sum of usable bytes over this pool's blocks (children excluded).
    #[must_use]
    pub fn logical_size(&self) -> usize {
        self.tree.logical_size(self.id)
    }

    /// Bytes still available to the bump allocator across this pool's blocks.
    #[must_use]
    pub fn free_size(&self) -> usize {
        self.tree.free_size(self.id)
    }

    /// OS memory committed to this pool's blocks.
    #[must_use]
    pub fn reserved_size(&self) -> usize {
        self.tree.reserved_size(self.id)
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.tree.block_count(self.id)
    }

    #[must_use]
    pub fn cleanup_count(&self) -> usize {
        self.tree.cleanup_count(self.id)
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.tree.child_count(self.id)
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.tree.is_live(self.id)
    }

    #[must_use]
    pub fn parent(&self) -> Option<Pool> {
        self.tree.parent(self.id).map(|id| Pool {
            tree: Arc::clone(&self.tree),
            id,
        })
    }

    /// Tree-wide statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.tree.stats().snapshot()
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.tree.page_size()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .field("blocks", &self.block_count())
            .field("free", &self.free_size())
            .finish()
    }
}

impl PartialEq for Pool {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) && self.id == other.id
    }
}

impl Eq for Pool {}
