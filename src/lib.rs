//! Hierarchical arena allocator.
//!
//! Pools form a tree. Each pool bump-allocates from page-granular blocks it
//! maps from the OS, and releases everything at once: [`Pool::clear`] rewinds
//! a subtree for reuse, [`Pool::destroy`] unmaps it. Cleanup callbacks give
//! deterministic teardown for anything that lives outside pool memory.

pub(crate) mod sync;

pub mod memory;

// pools
pub use memory::pool::{Pool, PoolConfig, PoolError};

// cleanups
pub use memory::cleanup::CleanupFn;

// sizing
pub use memory::block::{ALIGN, MAX_SLOTS, MIN_ALLOC, align_allocation, pages_needed};

// stats
pub use memory::stats::{Counter, PoolStats, StatsSnapshot};

// errors
pub use memory::vm::VmError;
