//! Pool statistics.
//!
//! A [`PoolStats`] sink is owned by one pool tree, or shared by several trees
//! when the host hands the same `Arc` to each of them through
//! [`PoolConfig::with_stats`](crate::PoolConfig::with_stats).
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent. This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `get()`, which
/// clamps negative values to zero.
#[derive(Debug)]
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics sink for pool trees.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Bytes currently mapped for blocks.
    pub bytes_mapped: Counter,
    /// Blocks currently mapped.
    pub blocks_live: Counter,
    /// Running total of bytes handed out by allocations (never decreases).
    pub bytes_allocated: Counter,
    /// Running total of bytes served by the general allocator for oversized requests.
    pub oversized_allocated: Counter,
    /// Pools created and not yet destroyed.
    pub pools_live: Counter,
}

/// Plain copy of a [`PoolStats`] for display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_mapped: usize,
    pub blocks_live: usize,
    pub bytes_allocated: usize,
    pub oversized_allocated: usize,
    pub pools_live: usize,
}

impl PoolStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_mapped: self.bytes_mapped.get(),
            blocks_live: self.blocks_live.get(),
            bytes_allocated: self.bytes_allocated.get(),
            oversized_allocated: self.oversized_allocated.get(),
            pools_live: self.pools_live.get(),
        }
    }

    pub(crate) fn block_mapped(&self, bytes: usize) {
        self.bytes_mapped.add(bytes);
        self.blocks_live.add(1);
    }

    pub(crate) fn blocks_unmapped(&self, blocks: usize, bytes: usize) {
        self.bytes_mapped.sub(bytes);
        self.blocks_live.sub(blocks);
    }
}
