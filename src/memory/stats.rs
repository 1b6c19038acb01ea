//! Crate-wide memory accounting for diagnostics.
//!
//! Gauges are updated with `Relaxed` atomics and read without any
//! cross-gauge coordination, so a snapshot can be momentarily skewed: the
//! total and the per-subsystem figures may disagree while updates are in
//! flight. That is fine for display and tests; allocation decisions must
//! never read these values.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Signed gauge with clamped reads.
///
/// Concurrent add/sub pairs can land in either order, so the raw value may
/// briefly dip negative (a release racing the matching reserve). `load`
/// clamps such transients to zero instead of wrapping or panicking.
pub struct Gauge(AtomicIsize);

impl Gauge {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    // Oversized deltas are clamped, not rejected: these are diagnostics,
    // not invariants.
    #[inline]
    fn clamped(val: usize) -> isize {
        val.min(isize::MAX as usize) as isize
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::clamped(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::clamped(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0) as usize
    }
}

// Address space reserved across every allocator in the crate
crate::sync::sync_static! {
    pub static TOTAL_RESERVED: Gauge = Gauge::new();
}
// Physical memory committed across every allocator in the crate
crate::sync::sync_static! {
    pub static TOTAL_COMMITTED: Gauge = Gauge::new();
}

// Breakdown by subsystem
crate::sync::sync_static! {
    pub static NODE_POOL_COMMITTED: Gauge = Gauge::new();
}
crate::sync::sync_static! {
    pub static LARGE_BLOCK_COMMITTED: Gauge = Gauge::new();
}
crate::sync::sync_static! {
    pub static LINEAR_ARENA_COMMITTED: Gauge = Gauge::new();
}

/// Point-in-time snapshot of the global memory gauges.
pub struct MemoryStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub node_pool_committed: usize,
    pub large_block_committed: usize,
    pub linear_arena_committed: usize,
}

/// Snapshot the global gauges for diagnostic display.
#[must_use]
pub fn memory_stats() -> MemoryStats {
    MemoryStats {
        total_reserved: TOTAL_RESERVED.load(Ordering::Relaxed),
        total_committed: TOTAL_COMMITTED.load(Ordering::Relaxed),
        node_pool_committed: NODE_POOL_COMMITTED.load(Ordering::Relaxed),
        large_block_committed: LARGE_BLOCK_COMMITTED.load(Ordering::Relaxed),
        linear_arena_committed: LINEAR_ARENA_COMMITTED.load(Ordering::Relaxed),
    }
}
