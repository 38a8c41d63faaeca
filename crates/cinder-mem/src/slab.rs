//! # Slab Sub-Allocator
//!
//! Small buffers are carved out of larger backing allocations. Each slab
//! holds fixed-size entries of one size class for one (domain, flags)
//! bucket.
//!
//! ```text
//!   size class 1 KiB, slab 64 KiB
//!   ┌──────┬──────┬──────┬──────┬─────────────┬──────┐
//!   │  0   │  1   │  2   │  3   │     ...     │  63  │
//!   └──────┴──────┴──────┴──────┴─────────────┴──────┘
//!     used   free  reclaim used                 free
//! ```
//!
//! A released entry is parked on the reclaim list until every queue that
//! used it is idle; only then does its slot return to the free list. A slab
//! whose entries are all free gives its backing buffer back.

use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_core::{BoFlags, Domain, PAGE_SIZE, SlabConfig, WinsysStats, align_up};
use cinder_sync::FenceRings;
use hashbrown::HashMap;

use crate::bo::{BoInner, BoKind};

/// Largest power of two dividing `value`
#[inline]
pub(crate) const fn natural_alignment(value: u64) -> u64 {
    value & value.wrapping_neg()
}

/// Entry size serving `size` bytes at `alignment`, or `None` when the request
/// must go to a real buffer.
///
/// Classes are powers of two plus their 3/4 steps, which bounds rounding
/// waste to 25% instead of 50%.
pub(crate) fn entry_size_for(config: &SlabConfig, size: u64, alignment: u64) -> Option<u64> {
    if size == 0 || size > config.max_entry_size() {
        return None;
    }
    let min = 1u64 << config.min_order;
    let pot = size.next_power_of_two().max(min);
    let three_quarters = pot / 4 * 3;

    let entry = if size <= three_quarters
        && three_quarters >= min
        && natural_alignment(three_quarters) >= alignment
    {
        three_quarters
    } else {
        pot
    };

    (natural_alignment(entry) >= alignment).then_some(entry)
}

/// Backing allocation size for a class
pub(crate) fn slab_size_for(config: &SlabConfig, entry_size: u64) -> u64 {
    let wanted = entry_size * u64::from(config.entries_per_slab);
    let clamped = wanted.clamp(config.min_slab_size, config.max_slab_size);
    align_up(clamped.max(entry_size), PAGE_SIZE)
}

// =============================================================================
// SLABS
// =============================================================================

/// Identifies a group of interchangeable slabs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlabKey {
    pub(crate) domain: Domain,
    pub(crate) flags: BoFlags,
    pub(crate) entry_size: u64,
}

#[derive(Debug)]
struct Slab {
    key: SlabKey,
    backing: Arc<BoInner>,
    num_entries: u32,
    free: Vec<u32>,
}

/// Slot handed out by [`SlabAllocator::take`]
#[derive(Debug)]
pub(crate) struct SlabSlot {
    pub(crate) slab_id: u64,
    pub(crate) index: u32,
    pub(crate) backing: Arc<BoInner>,
}

/// All slabs of a device
#[derive(Debug)]
pub(crate) struct SlabAllocator {
    slabs: HashMap<u64, Slab>,
    /// Slabs with at least one free entry, per group
    partial: HashMap<SlabKey, Vec<u64>>,
    reclaim: Vec<Arc<BoInner>>,
    next_id: u64,
}

impl SlabAllocator {
    pub(crate) fn new() -> Self {
        Self {
            slabs: HashMap::new(),
            partial: HashMap::new(),
            reclaim: Vec::new(),
            next_id: 0,
        }
    }

    /// Number of live slabs
    pub(crate) fn len(&self) -> usize {
        self.slabs.len()
    }

    /// Entries waiting to become idle
    pub(crate) fn reclaim_len(&self) -> usize {
        self.reclaim.len()
    }

    /// Take a free slot from any slab of the group
    pub(crate) fn take(&mut self, key: SlabKey) -> Option<SlabSlot> {
        let ids = self.partial.get_mut(&key)?;
        let slab_id = *ids.last()?;
        let slab = self.slabs.get_mut(&slab_id)?;
        let index = slab.free.pop()?;
        if slab.free.is_empty() {
            ids.pop();
        }
        Some(SlabSlot {
            slab_id,
            index,
            backing: slab.backing.clone(),
        })
    }

    /// Add a slab over `backing`; every entry starts free
    pub(crate) fn insert(&mut self, key: SlabKey, backing: Arc<BoInner>) -> u64 {
        let num_entries = (backing.size() / key.entry_size) as u32;
        self.next_id += 1;
        let id = self.next_id;
        // Hand out low offsets first
        let free = (0..num_entries).rev().collect();
        self.slabs.insert(
            id,
            Slab {
                key,
                backing,
                num_entries,
                free,
            },
        );
        self.partial.entry(key).or_default().push(id);
        log::debug!(
            "slab {}: {} x {} bytes in {:?}",
            id,
            num_entries,
            key.entry_size,
            key.domain
        );
        id
    }

    /// Park a released entry until it is idle
    pub(crate) fn push_reclaim(&mut self, entry: Arc<BoInner>) {
        debug_assert!(entry.is_slab());
        self.reclaim.push(entry);
    }

    /// Return idle reclaimed entries to their slabs. Returns the backing
    /// buffers of slabs that became completely free.
    pub(crate) fn reclaim(&mut self, rings: &FenceRings, stats: &WinsysStats) -> Vec<Arc<BoInner>> {
        let mut emptied = Vec::new();
        let mut i = 0;
        while i < self.reclaim.len() {
            if !rings.is_reusable(self.reclaim[i].fences()) {
                i += 1;
                continue;
            }
            let entry = self.reclaim.swap_remove(i);
            if let BoKind::Slab(slot) = entry.kind() {
                stats.sub_slab_wasted(entry.domain(), slot.entry_size - entry.size());
                if let Some(backing) = self.free_entry(slot.slab_id, slot.index) {
                    emptied.push(backing);
                }
            }
        }
        emptied
    }

    /// Put a slot back; removes the slab once all of its entries are free
    fn free_entry(&mut self, slab_id: u64, index: u32) -> Option<Arc<BoInner>> {
        let slab = self.slabs.get_mut(&slab_id)?;
        slab.free.push(index);
        let key = slab.key;
        if slab.free.len() == 1 {
            self.partial.entry(key).or_default().push(slab_id);
        }
        if slab.free.len() as u32 != slab.num_entries {
            return None;
        }

        let slab = self.slabs.remove(&slab_id)?;
        if let Some(ids) = self.partial.get_mut(&key) {
            ids.retain(|id| *id != slab_id);
            if ids.is_empty() {
                self.partial.remove(&key);
            }
        }
        log::debug!("slab {}: all entries free, releasing backing", slab_id);
        Some(slab.backing)
    }

    /// Remove every slab. Reclaim entries are forgotten; callers make sure
    /// the queues are idle first.
    pub(crate) fn drain(&mut self) -> Vec<Arc<BoInner>> {
        self.reclaim.clear();
        self.partial.clear();
        self.slabs.drain().map(|(_, slab)| slab.backing).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_of_two_classes() {
        let config = SlabConfig::default();
        assert_eq!(entry_size_for(&config, 1, 1), Some(256));
        assert_eq!(entry_size_for(&config, 256, 256), Some(256));
        assert_eq!(entry_size_for(&config, 1024, 1024), Some(1024));
        assert_eq!(entry_size_for(&config, 64 * 1024, 4096), Some(64 * 1024));
    }

    #[test]
    fn test_three_quarter_classes() {
        let config = SlabConfig::default();
        // 600 fits in 3/4 of 1024
        assert_eq!(entry_size_for(&config, 600, 256), Some(768));
        assert_eq!(entry_size_for(&config, 3000, 1024), Some(3072));
        // 3/4 class is not aligned enough
        assert_eq!(entry_size_for(&config, 3000, 2048), Some(4096));
        // Just above the 3/4 step
        assert_eq!(entry_size_for(&config, 800, 256), Some(1024));
    }

    #[test]
    fn test_beyond_threshold() {
        let config = SlabConfig::default();
        assert_eq!(entry_size_for(&config, 256 * 1024, 4096), Some(256 * 1024));
        assert_eq!(entry_size_for(&config, 256 * 1024 + 1, 4096), None);
        assert_eq!(entry_size_for(&config, 512, 4096), None);
    }

    #[test]
    fn test_slab_sizes_are_clamped() {
        let config = SlabConfig::default();
        assert_eq!(slab_size_for(&config, 256), 64 * 1024);
        assert_eq!(slab_size_for(&config, 64 * 1024), 1024 * 1024);
        assert_eq!(slab_size_for(&config, 256 * 1024), 2 * 1024 * 1024);
        assert_eq!(slab_size_for(&config, 3 * 1024), 64 * 1024);
    }

    #[test]
    fn test_natural_alignment() {
        assert_eq!(natural_alignment(768), 256);
        assert_eq!(natural_alignment(4096), 4096);
        assert_eq!(natural_alignment(3 * 64 * 1024), 64 * 1024);
    }
}
