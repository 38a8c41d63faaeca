//! # Recycling Cache
//!
//! Freed real buffers wait here for a matching allocation instead of going
//! straight back to the kernel. Buckets are keyed by domain and the
//! bucket-relevant flags; within a bucket entries are kept oldest first.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_core::{BoFlags, CacheConfig, Domain};
use cinder_sync::FenceRings;
use hashbrown::HashMap;

use crate::bo::BoInner;

#[derive(Debug)]
struct CacheEntry {
    bo: Arc<BoInner>,
    parked_at: u64,
}

/// Time- and size-bounded buffer cache
#[derive(Debug)]
pub(crate) struct BoCache {
    config: CacheConfig,
    buckets: HashMap<(Domain, BoFlags), VecDeque<CacheEntry>>,
    bytes: u64,
}

impl BoCache {
    pub(crate) fn new(config: CacheConfig) -> Self {
        Self {
            config,
            buckets: HashMap::new(),
            bytes: 0,
        }
    }

    /// Bytes held
    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Buffers held
    pub(crate) fn len(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }

    fn matches(&self, entry: &CacheEntry, size: u64, alignment: u64) -> bool {
        let max_size = size.saturating_mul(u64::from(self.config.size_factor_percent)) / 100;
        let bo_size = entry.bo.size();
        bo_size >= size && bo_size <= max_size && entry.bo.alignment() % alignment == 0
    }

    /// Remove and return an idle buffer able to serve the request
    pub(crate) fn take(
        &mut self,
        rings: &FenceRings,
        size: u64,
        alignment: u64,
        domain: Domain,
        flags: BoFlags,
    ) -> Option<Arc<BoInner>> {
        let key = (domain, flags.bucket());
        let position = self.buckets.get(&key)?.iter().position(|entry| {
            self.matches(entry, size, alignment)
                && rings.poll_idle(entry.bo.fences()).unwrap_or(false)
        })?;
        let entry = self.buckets.get_mut(&key)?.remove(position)?;
        self.bytes -= entry.bo.size();
        Some(entry.bo)
    }

    /// Park a buffer. Hands it back if the cache would exceed its byte limit.
    pub(crate) fn park(&mut self, bo: Arc<BoInner>, now: u64) -> Result<(), Arc<BoInner>> {
        if self.bytes + bo.size() > self.config.max_bytes {
            return Err(bo);
        }
        self.bytes += bo.size();
        let key = (bo.domain(), bo.flags().bucket());
        self.buckets.entry(key).or_default().push_back(CacheEntry { bo, parked_at: now });
        Ok(())
    }

    /// Remove idle buffers older than the maximum age
    pub(crate) fn expire(&mut self, rings: &FenceRings, now: u64) -> Vec<Arc<BoInner>> {
        let max_age = self.config.max_age_ns;
        let mut expired = Vec::new();
        for bucket in self.buckets.values_mut() {
            // Oldest first; stop at the first young or busy one
            while let Some(front) = bucket.front() {
                let old = now.saturating_sub(front.parked_at) >= max_age;
                if !old || !rings.is_reusable(front.bo.fences()) {
                    break;
                }
                if let Some(entry) = bucket.pop_front() {
                    self.bytes -= entry.bo.size();
                    expired.push(entry.bo);
                }
            }
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        expired
    }

    /// Remove every idle buffer
    pub(crate) fn drain_idle(&mut self, rings: &FenceRings) -> Vec<Arc<BoInner>> {
        let mut idle = Vec::new();
        for bucket in self.buckets.values_mut() {
            let mut kept = VecDeque::with_capacity(bucket.len());
            for entry in bucket.drain(..) {
                if rings.is_reusable(entry.bo.fences()) {
                    self.bytes -= entry.bo.size();
                    idle.push(entry.bo);
                } else {
                    kept.push_back(entry);
                }
            }
            *bucket = kept;
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        idle
    }

    /// Remove everything
    pub(crate) fn drain_all(&mut self) -> Vec<Arc<BoInner>> {
        self.bytes = 0;
        self.buckets
            .drain()
            .flat_map(|(_, bucket)| bucket.into_iter().map(|entry| entry.bo))
            .collect()
    }
}
