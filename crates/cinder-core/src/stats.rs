//! # Winsys Statistics
//!
//! Device-wide counters. Updated with relaxed atomics from any thread;
//! [`WinsysStats::snapshot`] is not a consistent cut across counters.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::types::Domain;

/// Point-in-time copy of [`WinsysStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bytes of live real buffers, per domain (`Domain::index`)
    pub allocated: [u64; 2],
    /// Bytes currently CPU-mapped, per domain
    pub mapped: [u64; 2],
    /// Bytes lost to slab rounding, per domain
    pub slab_wasted: [u64; 2],
    /// Live CPU mappings
    pub num_mapped_buffers: u64,
    /// Total nanoseconds spent blocked in buffer waits
    pub buffer_wait_time_ns: u64,
    /// Graphics submissions
    pub num_gfx_ibs: u64,
    /// DMA submissions
    pub num_sdma_ibs: u64,
    /// Submissions on any other queue
    pub num_other_ibs: u64,
    /// GEM allocations made by the kernel
    pub kernel_allocs: u64,
    /// Allocations served from the recycling cache
    pub cache_hits: u64,
    /// Allocations served from a slab
    pub slab_hits: u64,
    /// Fence-ring evictions that had to wait
    pub ring_eviction_waits: u64,
}

impl StatsSnapshot {
    /// Allocated bytes in `domain`
    #[inline]
    pub const fn allocated_in(&self, domain: Domain) -> u64 {
        self.allocated[domain.index()]
    }
}

/// Live device counters
#[derive(Debug, Default)]
pub struct WinsysStats {
    allocated: [AtomicU64; 2],
    mapped: [AtomicU64; 2],
    slab_wasted: [AtomicU64; 2],
    num_mapped_buffers: AtomicU64,
    buffer_wait_time_ns: AtomicU64,
    num_gfx_ibs: AtomicU64,
    num_sdma_ibs: AtomicU64,
    num_other_ibs: AtomicU64,
    kernel_allocs: AtomicU64,
    cache_hits: AtomicU64,
    slab_hits: AtomicU64,
    ring_eviction_waits: AtomicU64,
    next_unique_id: AtomicU64,
}

impl WinsysStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Memory
    // =========================================================================

    pub fn add_allocated(&self, domain: Domain, bytes: u64) {
        self.allocated[domain.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_allocated(&self, domain: Domain, bytes: u64) {
        self.allocated[domain.index()].fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn add_mapped(&self, domain: Domain, bytes: u64) {
        self.mapped[domain.index()].fetch_add(bytes, Ordering::Relaxed);
        self.num_mapped_buffers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sub_mapped(&self, domain: Domain, bytes: u64) {
        self.mapped[domain.index()].fetch_sub(bytes, Ordering::Relaxed);
        self.num_mapped_buffers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_slab_wasted(&self, domain: Domain, bytes: u64) {
        self.slab_wasted[domain.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_slab_wasted(&self, domain: Domain, bytes: u64) {
        self.slab_wasted[domain.index()].fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn inc_kernel_allocs(&self) {
        self.kernel_allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_slab_hits(&self) {
        self.slab_hits.fetch_add(1, Ordering::Relaxed);
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    pub fn add_buffer_wait_time(&self, ns: u64) {
        self.buffer_wait_time_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn inc_ring_eviction_waits(&self) {
        self.ring_eviction_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one submission on `queue`
    pub fn inc_submissions(&self, queue: crate::types::QueueKind) {
        use crate::types::QueueKind;
        let counter = match queue {
            QueueKind::Gfx => &self.num_gfx_ibs,
            QueueKind::Sdma => &self.num_sdma_ibs,
            _ => &self.num_other_ibs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Device-unique buffer id. Never returns 0.
    pub fn next_unique_id(&self) -> u64 {
        self.next_unique_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Copy every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let load2 = |a: &[AtomicU64; 2]| {
            [a[0].load(Ordering::Relaxed), a[1].load(Ordering::Relaxed)]
        };
        StatsSnapshot {
            allocated: load2(&self.allocated),
            mapped: load2(&self.mapped),
            slab_wasted: load2(&self.slab_wasted),
            num_mapped_buffers: self.num_mapped_buffers.load(Ordering::Relaxed),
            buffer_wait_time_ns: self.buffer_wait_time_ns.load(Ordering::Relaxed),
            num_gfx_ibs: self.num_gfx_ibs.load(Ordering::Relaxed),
            num_sdma_ibs: self.num_sdma_ibs.load(Ordering::Relaxed),
            num_other_ibs: self.num_other_ibs.load(Ordering::Relaxed),
            kernel_allocs: self.kernel_allocs.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            slab_hits: self.slab_hits.load(Ordering::Relaxed),
            ring_eviction_waits: self.ring_eviction_waits.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueKind;

    #[test]
    fn test_per_domain_accounting() {
        let stats = WinsysStats::new();
        stats.add_allocated(Domain::Vram, 4096);
        stats.add_allocated(Domain::Gtt, 8192);
        stats.sub_allocated(Domain::Vram, 4096);
        let snap = stats.snapshot();
        assert_eq!(snap.allocated_in(Domain::Vram), 0);
        assert_eq!(snap.allocated_in(Domain::Gtt), 8192);
    }

    #[test]
    fn test_submission_counters() {
        let stats = WinsysStats::new();
        stats.inc_submissions(QueueKind::Gfx);
        stats.inc_submissions(QueueKind::Sdma);
        stats.inc_submissions(QueueKind::Jpeg);
        let snap = stats.snapshot();
        assert_eq!((snap.num_gfx_ibs, snap.num_sdma_ibs, snap.num_other_ibs), (1, 1, 1));
    }

    #[test]
    fn test_unique_ids_start_at_one() {
        let stats = WinsysStats::new();
        assert_eq!(stats.next_unique_id(), 1);
        assert_eq!(stats.next_unique_id(), 2);
    }
}
