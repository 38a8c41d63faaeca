//! # Buffer Manager
//!
//! Front door of the allocator. Routes each request to the slab
//! sub-allocator, the recycling cache or the kernel, and routes each release
//! back the same way.
//!
//! ```text
//!   create(size)
//!       │
//!       ├── size <= 256 KiB ──▶ slab entry ──(no free slot)──┐
//!       │                                                    ▼
//!       └──────────────────────────────────────────▶ real buffer
//!                                                     │
//!                          cache hit (idle, fits) ◀───┤
//!                                                     ▼
//!                                         gem_create ──OOM──▶ flush idle
//!                                                              and retry once
//! ```
//!
//! Lock order: slab or cache lock, then the fence lock. Kernel calls that
//! may block are never made with any of them held.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::AtomicBool;

use cinder_core::{
    BoFlags, BoIdentity, CpuAddr, Domain, Error, GemCreateInfo, GpuAddr, ImportedBo,
    KernelInterface, KmsHandle, MapFlags, PAGE_SIZE, RawFd, Result, WinsysConfig, WinsysStats,
    checked_align_up,
};
use cinder_sync::FenceRings;

use crate::bo::{Bo, BoInner, BoKind, BoReleaser, MapState, RealBo, SlabEntry};
use crate::cache::BoCache;
use crate::slab::{self, SlabAllocator, SlabKey, SlabSlot};
use crate::vm::VmTimeline;

/// Allocator of one device
pub struct BufferManager {
    kernel: Arc<dyn KernelInterface>,
    fd: RawFd,
    config: WinsysConfig,
    rings: Arc<FenceRings>,
    stats: Arc<WinsysStats>,
    vm: VmTimeline,
    releaser: Weak<dyn BoReleaser>,
    slabs: spin::Mutex<SlabAllocator>,
    cache: spin::Mutex<BoCache>,
    /// Busy private buffers waiting to be destroyed
    deferred: spin::Mutex<Vec<Arc<BoInner>>>,
    #[cfg(feature = "debug-bo-list")]
    all_bos: spin::Mutex<Vec<Weak<BoInner>>>,
}

impl BufferManager {
    /// Create a manager. Buffers it hands out report their last release to
    /// `releaser`.
    pub fn new(
        kernel: Arc<dyn KernelInterface>,
        fd: RawFd,
        config: WinsysConfig,
        rings: Arc<FenceRings>,
        stats: Arc<WinsysStats>,
        vm: VmTimeline,
        releaser: Weak<dyn BoReleaser>,
    ) -> Self {
        Self {
            kernel,
            fd,
            config,
            rings,
            stats,
            vm,
            releaser,
            slabs: spin::Mutex::new(SlabAllocator::new()),
            cache: spin::Mutex::new(BoCache::new(config.cache)),
            deferred: spin::Mutex::new(Vec::new()),
            #[cfg(feature = "debug-bo-list")]
            all_bos: spin::Mutex::new(Vec::new()),
        }
    }

    /// Manager with its own fence rings and statistics that releases buffers
    /// to itself
    pub fn standalone(
        kernel: Arc<dyn KernelInterface>,
        fd: RawFd,
        config: WinsysConfig,
    ) -> Result<Arc<Self>> {
        let stats = Arc::new(WinsysStats::new());
        let rings = Arc::new(FenceRings::new(kernel.clone(), stats.clone()));
        let vm = VmTimeline::new(kernel.clone(), fd)?;
        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let releaser: Weak<dyn BoReleaser> = weak.clone();
            Self::new(kernel, fd, config, rings, stats, vm, releaser)
        }))
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn rings(&self) -> &Arc<FenceRings> {
        &self.rings
    }

    #[inline]
    pub fn stats(&self) -> &Arc<WinsysStats> {
        &self.stats
    }

    #[inline]
    pub fn vm(&self) -> &VmTimeline {
        &self.vm
    }

    #[inline]
    pub fn config(&self) -> &WinsysConfig {
        &self.config
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a buffer
    pub fn create(
        &self,
        size: u64,
        alignment: u64,
        domain: Domain,
        flags: BoFlags,
    ) -> Result<Bo> {
        if size == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }
        let mut flags = flags;
        if self.config.zero_vram && domain == Domain::Vram {
            flags |= BoFlags::ZERO_VRAM;
        }

        self.reap_deferred();

        let entry_size = if self.use_slab(flags) {
            slab::entry_size_for(&self.config.slab, size, alignment)
        } else {
            None
        };
        let inner = match entry_size {
            Some(entry_size) => self.create_slab_entry(size, alignment, domain, flags, entry_size)?,
            None => self.create_real(size, alignment, domain, flags)?,
        };

        Ok(Bo::acquire(&inner))
    }

    fn use_slab(&self, flags: BoFlags) -> bool {
        self.config.slab.enabled && !flags.intersects(BoFlags::NO_SUBALLOC | BoFlags::ZERO_VRAM)
    }

    fn cacheable_flags(&self, flags: BoFlags) -> bool {
        self.config.cache.enabled && !flags.intersects(BoFlags::NO_REUSE | BoFlags::ZERO_VRAM)
    }

    fn is_cacheable(&self, bo: &BoInner) -> bool {
        bo.real().is_some()
            && !bo.is_shared()
            && !bo.is_imported()
            && self.cacheable_flags(bo.flags())
    }

    fn create_slab_entry(
        &self,
        size: u64,
        alignment: u64,
        domain: Domain,
        flags: BoFlags,
        entry_size: u64,
    ) -> Result<Arc<BoInner>> {
        let key = SlabKey {
            domain,
            flags: flags.bucket(),
            entry_size,
        };

        let slot = match self.take_slot(key) {
            Some(slot) => slot,
            None => {
                let slab_size = slab::slab_size_for(&self.config.slab, entry_size);
                let alignment = slab::natural_alignment(entry_size).max(PAGE_SIZE);
                // Nothing is inserted unless the backing exists
                let backing = self.create_real(slab_size, alignment, domain, flags.bucket())?;
                let mut slabs = self.slabs.lock();
                slabs.insert(key, backing);
                slabs.take(key).ok_or(Error::OutOfMemory)?
            }
        };

        self.stats.inc_slab_hits();
        self.stats.add_slab_wasted(domain, entry_size - size);
        let inner = BoInner::new(
            self.stats.next_unique_id(),
            size,
            alignment,
            domain,
            flags,
            BoKind::Slab(SlabEntry {
                backing: slot.backing,
                slab_id: slot.slab_id,
                index: slot.index,
                entry_size,
            }),
            self.releaser.clone(),
        );
        self.track(&inner);
        Ok(inner)
    }

    /// Free slot of the group, reclaiming idle entries if none is free
    fn take_slot(&self, key: SlabKey) -> Option<SlabSlot> {
        let (slot, emptied) = {
            let mut slabs = self.slabs.lock();
            match slabs.take(key) {
                Some(slot) => (Some(slot), Vec::new()),
                None => {
                    let emptied = slabs.reclaim(&self.rings, &self.stats);
                    (slabs.take(key), emptied)
                }
            }
        };
        for backing in emptied {
            self.release_real(backing);
        }
        slot
    }

    /// Real buffer from the cache or the kernel
    fn create_real(
        &self,
        size: u64,
        alignment: u64,
        domain: Domain,
        flags: BoFlags,
    ) -> Result<Arc<BoInner>> {
        // No kernel can back a request that does not fit in a page-aligned u64
        let size = checked_align_up(size, PAGE_SIZE).ok_or(Error::OutOfMemory)?;
        let alignment = alignment.max(PAGE_SIZE);

        if self.cacheable_flags(flags) {
            let now = self.kernel.now_ns();
            let (hit, expired) = {
                let mut cache = self.cache.lock();
                let expired = cache.expire(&self.rings, now);
                (cache.take(&self.rings, size, alignment, domain, flags), expired)
            };
            for bo in expired {
                self.destroy_real(bo);
            }
            if let Some(bo) = hit {
                log::trace!("cache hit: {} bytes for a {} byte request", bo.size(), size);
                self.stats.inc_cache_hits();
                return Ok(bo);
            }
        }

        self.create_kernel_bo(size, alignment, domain, flags)
    }

    fn create_kernel_bo(
        &self,
        size: u64,
        alignment: u64,
        domain: Domain,
        flags: BoFlags,
    ) -> Result<Arc<BoInner>> {
        let info = GemCreateInfo {
            size,
            alignment,
            domain,
            flags,
        };
        let (handle, identity) = match self.kernel.gem_create(self.fd, &info) {
            Ok(created) => created,
            Err(Error::OutOfMemory) => {
                let released = self.release_idle_memory();
                log::debug!(
                    "gem_create of {} bytes in {:?} out of memory, released {} idle buffers, retrying",
                    size,
                    domain,
                    released
                );
                self.kernel.gem_create(self.fd, &info).map_err(|err| {
                    log::warn!("gem_create of {} bytes failed after retry: {}", size, err);
                    err
                })?
            }
            Err(err) => return Err(err),
        };

        let va = self.map_va(handle, size, alignment)?;
        self.stats.inc_kernel_allocs();
        self.stats.add_allocated(domain, size);
        Ok(self.new_real(handle, identity, va, size, alignment, domain, flags, false))
    }

    /// Reserve and map a VA range; closes `handle` on failure
    fn map_va(&self, handle: KmsHandle, size: u64, alignment: u64) -> Result<GpuAddr> {
        let va = match self.kernel.va_alloc(self.fd, size, alignment) {
            Ok(va) => va,
            Err(err) => {
                self.kernel.gem_close(self.fd, handle);
                return Err(err);
            }
        };
        if let Err(err) = self.vm.map(handle, va, size) {
            self.kernel.va_free(self.fd, va, size);
            self.kernel.gem_close(self.fd, handle);
            return Err(err);
        }
        Ok(va)
    }

    #[allow(clippy::too_many_arguments)]
    fn new_real(
        &self,
        handle: KmsHandle,
        identity: BoIdentity,
        va: GpuAddr,
        size: u64,
        alignment: u64,
        domain: Domain,
        flags: BoFlags,
        imported: bool,
    ) -> Arc<BoInner> {
        let inner = BoInner::new(
            self.stats.next_unique_id(),
            size,
            alignment,
            domain,
            flags,
            BoKind::Real(RealBo {
                handle,
                identity,
                va,
                imported,
                shared: AtomicBool::new(imported),
                map: spin::Mutex::new(MapState::default()),
            }),
            self.releaser.clone(),
        );
        self.track(&inner);
        inner
    }

    /// Wrap a buffer just imported into the device description. The result
    /// is shared from the start and has no client reference yet.
    pub fn wrap_imported(&self, imported: ImportedBo) -> Result<Arc<BoInner>> {
        let va = self.map_va(imported.handle, imported.size, PAGE_SIZE)?;
        self.stats.add_allocated(imported.domain, imported.size);
        Ok(self.new_real(
            imported.handle,
            imported.identity,
            va,
            imported.size,
            PAGE_SIZE,
            imported.domain,
            BoFlags::empty(),
            true,
        ))
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Release a private buffer whose last client reference is gone
    pub fn release_private(&self, bo: Arc<BoInner>) {
        debug_assert!(!bo.is_shared());
        match bo.kind() {
            BoKind::Slab(_) => self.slabs.lock().push_reclaim(bo),
            BoKind::Real(_) => self.release_real(bo),
        }
    }

    fn release_real(&self, bo: Arc<BoInner>) {
        self.force_unmap(&bo);
        if !self.is_cacheable(&bo) {
            self.destroy_when_idle(bo);
            return;
        }

        let now = self.kernel.now_ns();
        let (rejected, expired) = {
            let mut cache = self.cache.lock();
            let rejected = cache.park(bo, now).err();
            (rejected, cache.expire(&self.rings, now))
        };
        for bo in expired {
            self.destroy_real(bo);
        }
        if let Some(bo) = rejected {
            self.destroy_when_idle(bo);
        }
    }

    fn destroy_when_idle(&self, bo: Arc<BoInner>) {
        if self.rings.is_reusable(bo.fences()) {
            self.destroy_real(bo);
        } else {
            log::trace!("deferring destroy of busy buffer {}", bo.unique_id());
            self.deferred.lock().push(bo);
        }
    }

    /// Give a real buffer back to the kernel now
    pub fn destroy_real(&self, bo: Arc<BoInner>) {
        let Some(real) = bo.real() else {
            return;
        };
        self.force_unmap(&bo);
        if let Err(err) = self.vm.unmap(real.handle, real.va, bo.size()) {
            log::warn!("unmapping buffer {} failed: {}", bo.unique_id(), err);
        }
        self.kernel.va_free(self.fd, real.va, bo.size());
        self.kernel.gem_close(self.fd, real.handle);
        self.stats.sub_allocated(bo.domain(), bo.size());
    }

    /// Destroy deferred buffers that became idle
    pub fn reap_deferred(&self) -> usize {
        let candidates = core::mem::take(&mut *self.deferred.lock());
        if candidates.is_empty() {
            return 0;
        }
        let mut busy = Vec::new();
        let mut reaped = 0;
        for bo in candidates {
            if self.rings.is_reusable(bo.fences()) {
                self.destroy_real(bo);
                reaped += 1;
            } else {
                busy.push(bo);
            }
        }
        if !busy.is_empty() {
            self.deferred.lock().extend(busy);
        }
        reaped
    }

    /// Return idle slab entries to their slabs; emptied slabs release their
    /// backing
    pub fn reclaim_slabs(&self) {
        let emptied = self.slabs.lock().reclaim(&self.rings, &self.stats);
        for backing in emptied {
            self.release_real(backing);
        }
    }

    /// Hand every idle cached, reclaimable or deferred buffer back to the
    /// kernel. Returns the number of real buffers destroyed.
    pub fn release_idle_memory(&self) -> usize {
        let mut released = self.reap_deferred();
        let emptied = self.slabs.lock().reclaim(&self.rings, &self.stats);
        let idle = self.cache.lock().drain_idle(&self.rings);
        released += emptied.len() + idle.len();
        for bo in emptied.into_iter().chain(idle) {
            self.destroy_real(bo);
        }
        released
    }

    /// Wait for all queues and destroy everything the allocator still holds
    pub fn teardown(&self) {
        if let Err(err) = self.rings.wait_all() {
            log::warn!("teardown: waiting for queues failed: {}", err);
        }
        let backings = self.slabs.lock().drain();
        let cached = self.cache.lock().drain_all();
        let deferred = core::mem::take(&mut *self.deferred.lock());
        for bo in backings.into_iter().chain(cached).chain(deferred) {
            self.destroy_real(bo);
        }
        #[cfg(feature = "debug-bo-list")]
        self.all_bos.lock().clear();
    }

    // =========================================================================
    // CPU mapping
    // =========================================================================

    /// Map a buffer for CPU access
    pub fn map(&self, bo: &Bo, flags: MapFlags) -> Result<CpuAddr> {
        if bo.flags().contains(BoFlags::NO_CPU_ACCESS) {
            return Err(Error::NotSupported);
        }
        if !flags.contains(MapFlags::UNSYNCHRONIZED) {
            if flags.contains(MapFlags::DONT_BLOCK) {
                if !self.rings.poll_idle(bo.fences())? {
                    return Err(Error::Busy);
                }
            } else if !self.rings.wait_idle(bo.fences(), u64::MAX)? {
                return Err(Error::WaitTimeout);
            }
        }

        match bo.kind() {
            BoKind::Real(_) => self.map_real(bo.inner()),
            BoKind::Slab(entry) => Ok(self.map_real(&entry.backing)?.offset(entry.offset())),
        }
    }

    fn map_real(&self, bo: &BoInner) -> Result<CpuAddr> {
        let real = bo.real().ok_or(Error::InvalidParameter)?;
        let mut map = real.map.lock();
        if let Some(addr) = map.addr {
            map.count += 1;
            return Ok(addr);
        }
        let addr = self
            .kernel
            .gem_mmap(self.fd, real.handle, bo.size())
            .map_err(|err| {
                log::warn!("mmap of buffer {} failed: {}", bo.unique_id(), err);
                Error::MappingFailed
            })?;
        map.addr = Some(addr);
        map.count = 1;
        self.stats.add_mapped(bo.domain(), bo.size());
        Ok(addr)
    }

    /// Drop one CPU mapping reference
    pub fn unmap(&self, bo: &Bo) {
        let target: &BoInner = match bo.kind() {
            BoKind::Real(_) => bo,
            BoKind::Slab(entry) => &entry.backing,
        };
        let Some(real) = target.real() else {
            return;
        };
        let mut map = real.map.lock();
        let Some(addr) = map.addr else {
            log::warn!("unmap of unmapped buffer {}", bo.unique_id());
            return;
        };
        map.count -= 1;
        if map.count == 0 {
            map.addr = None;
            self.kernel.gem_munmap(addr, target.size());
            self.stats.sub_mapped(target.domain(), target.size());
        }
    }

    fn force_unmap(&self, bo: &BoInner) {
        let Some(real) = bo.real() else {
            return;
        };
        let mut map = real.map.lock();
        if let Some(addr) = map.addr.take() {
            map.count = 0;
            self.kernel.gem_munmap(addr, bo.size());
            self.stats.sub_mapped(bo.domain(), bo.size());
        }
    }

    // =========================================================================
    // Busy state
    // =========================================================================

    /// Whether any queue may still be using the buffer
    pub fn is_busy(&self, bo: &Bo) -> Result<bool> {
        Ok(!self.rings.poll_idle(bo.fences())?)
    }

    /// Wait up to `timeout_ns` for the buffer to become idle
    pub fn wait(&self, bo: &Bo, timeout_ns: u64) -> Result<bool> {
        self.rings.wait_idle(bo.fences(), timeout_ns)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Live slabs
    pub fn slab_count(&self) -> usize {
        self.slabs.lock().len()
    }

    /// Slab entries waiting to become idle
    pub fn slab_reclaim_count(&self) -> usize {
        self.slabs.lock().reclaim_len()
    }

    /// Buffers and bytes held by the cache
    pub fn cache_usage(&self) -> (usize, u64) {
        let cache = self.cache.lock();
        (cache.len(), cache.bytes())
    }

    /// Busy buffers waiting to be destroyed
    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    #[cfg(feature = "debug-bo-list")]
    fn track(&self, bo: &Arc<BoInner>) {
        if self.config.debug_all_bos {
            let mut all = self.all_bos.lock();
            all.retain(|weak| weak.strong_count() > 0);
            all.push(Arc::downgrade(bo));
        }
    }

    #[cfg(not(feature = "debug-bo-list"))]
    #[inline]
    fn track(&self, _bo: &Arc<BoInner>) {}

    /// Every buffer still alive (including cached and parked ones)
    #[cfg(feature = "debug-bo-list")]
    pub fn live_buffers(&self) -> Vec<Arc<BoInner>> {
        self.all_bos.lock().iter().filter_map(Weak::upgrade).collect()
    }
}

impl BoReleaser for BufferManager {
    fn release(&self, bo: Arc<BoInner>) {
        if !bo.is_shared() {
            self.release_private(bo);
        } else if bo.refcount() == 0 {
            self.destroy_real(bo);
        }
    }
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("fd", &self.fd)
            .field("slabs", &self.slab_count())
            .field("cache", &self.cache_usage())
            .field("deferred", &self.deferred_count())
            .finish_non_exhaustive()
    }
}
