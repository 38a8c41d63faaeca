//! # Devices
//!
//! One [`Device`] per physical GPU. It owns the device's file description,
//! the allocator, the fence rings, the submission worker and the export
//! table. Front-ends keep it alive; it only knows them weakly.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use cinder_cmd::{CsQueue, SubmitTicket, Submission, Submitter};
use cinder_core::{
    BoFlags, CpuAddr, DeviceKey, Domain, Error, GpuAddr, HandleKind, KernelInterface,
    MapFlags, RawFd, Result, SeqNo, StatsSnapshot, WinsysConfig, WinsysHandle, WinsysStats,
};
use cinder_mem::{Bo, BoInner, BoReleaser, BufferManager, VmTimeline};
use cinder_sync::FenceRings;

use crate::export::ExportTable;
use crate::frontend::{FrontEnd, HandleTable};

/// Owned descriptor of the device description, closed last
struct DeviceFd {
    kernel: Arc<dyn KernelInterface>,
    fd: RawFd,
}

impl Drop for DeviceFd {
    fn drop(&mut self) {
        self.kernel.close_fd(self.fd);
    }
}

/// Logical device shared by every front-end opened on one GPU
pub struct Device {
    key: DeviceKey,
    kernel: Arc<dyn KernelInterface>,
    config: WinsysConfig,
    stats: Arc<WinsysStats>,
    lost: Arc<AtomicBool>,
    cs: CsQueue,
    buffers: BufferManager,
    exports: ExportTable,
    frontends: spin::Mutex<Vec<Weak<FrontEnd>>>,
    /// Handle table of the device's own description
    placeholder: HandleTable,
    frontend_refs: AtomicU32,
    fd: DeviceFd,
}

impl Device {
    /// Set up a device on `fd`, which the device takes ownership of
    pub(crate) fn new(
        kernel: Arc<dyn KernelInterface>,
        fd: RawFd,
        key: DeviceKey,
        config: WinsysConfig,
    ) -> Result<Arc<Self>> {
        let fd_guard = DeviceFd {
            kernel: kernel.clone(),
            fd,
        };
        let stats = Arc::new(WinsysStats::new());
        let rings = Arc::new(FenceRings::new(kernel.clone(), stats.clone()));
        let vm = VmTimeline::new(kernel.clone(), fd)?;
        let lost = Arc::new(AtomicBool::new(false));
        let submitter = Arc::new(Submitter::new(
            kernel.clone(),
            fd,
            rings.clone(),
            stats.clone(),
            lost.clone(),
        )
        .with_noop(config.noop_cs));
        let cs = CsQueue::new(submitter, config.cs_queue_depth)?;

        log::info!("{}: device created on fd {}", key, fd);
        Ok(Arc::new_cyclic(|weak: &Weak<Device>| {
            let releaser: Weak<dyn BoReleaser> = weak.clone();
            Device {
                buffers: BufferManager::new(
                    kernel.clone(),
                    fd,
                    config,
                    rings,
                    stats.clone(),
                    vm,
                    releaser,
                ),
                placeholder: HandleTable::new(fd, true),
                key,
                kernel,
                config,
                stats,
                lost,
                cs,
                exports: ExportTable::new(),
                frontends: spin::Mutex::new(Vec::new()),
                frontend_refs: AtomicU32::new(0),
                fd: fd_guard,
            }
        }))
    }

    /// Device path
    #[inline]
    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    /// Descriptor of the device's own file description
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.fd
    }

    #[inline]
    pub fn config(&self) -> &WinsysConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn kernel(&self) -> &Arc<dyn KernelInterface> {
        &self.kernel
    }

    #[inline]
    pub(crate) fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    #[cfg(test)]
    pub(crate) fn exports(&self) -> &ExportTable {
        &self.exports
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the GPU was lost. Once set, every operation fails with
    /// [`Error::DeviceLost`].
    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn check_lost(&self) -> Result<()> {
        if self.is_lost() {
            Err(Error::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::DeviceLost) = result {
            if !self.lost.swap(true, Ordering::AcqRel) {
                log::error!("{}: GPU device lost", self.key);
            }
        }
        result
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    /// Allocate a buffer
    pub fn buffer_create(
        &self,
        size: u64,
        alignment: u64,
        domain: Domain,
        flags: BoFlags,
    ) -> Result<Bo> {
        self.check_lost()?;
        self.observe(self.buffers.create(size, alignment, domain, flags))
    }

    /// Map a buffer for CPU access. Queued submissions touching the buffer
    /// are flushed first unless the mapping is unsynchronized.
    pub fn buffer_map(&self, bo: &Bo, flags: MapFlags) -> Result<CpuAddr> {
        self.check_lost()?;
        if !flags.contains(MapFlags::UNSYNCHRONIZED) && bo.pending_submissions() > 0 {
            if flags.contains(MapFlags::DONT_BLOCK) {
                return Err(Error::Busy);
            }
            self.cs.flush()?;
        }
        self.observe(self.buffers.map(bo, flags))
    }

    /// Drop one CPU mapping reference
    pub fn buffer_unmap(&self, bo: &Bo) {
        self.buffers.unmap(bo);
    }

    /// Whether the GPU may still use the buffer, counting queued work
    pub fn buffer_is_busy(&self, bo: &Bo) -> Result<bool> {
        self.check_lost()?;
        if bo.pending_submissions() > 0 {
            return Ok(true);
        }
        self.observe(self.buffers.is_busy(bo))
    }

    /// Wait up to `timeout_ns` for the buffer to become idle
    pub fn buffer_wait(&self, bo: &Bo, timeout_ns: u64) -> Result<bool> {
        self.check_lost()?;
        if bo.pending_submissions() > 0 {
            self.cs.flush()?;
        }
        self.observe(self.buffers.wait(bo, timeout_ns))
    }

    /// Shareable handle for `bo`. KMS handles are relative to `front_end`,
    /// or to the device's own description when `None`. The buffer becomes
    /// shared and is never recycled afterwards.
    pub fn buffer_get_handle(
        &self,
        bo: &Bo,
        front_end: Option<&FrontEnd>,
        kind: HandleKind,
    ) -> Result<WinsysHandle> {
        self.check_lost()?;
        if bo.is_slab() {
            return Err(Error::InvalidParameter);
        }
        let table = self.table_for(front_end)?;
        let native = bo.kms_handle().ok_or(Error::InvalidParameter)?;
        self.exports.insert_shared(bo.inner());

        let result = match kind {
            HandleKind::Fd => self
                .kernel
                .prime_export(self.fd(), native)
                .map(WinsysHandle::Fd)
                .map_err(|err| {
                    log::warn!("{}: dma-buf export of buffer {} failed: {}", self.key, bo.unique_id(), err);
                    err.unless_fatal(Error::ExportFailed)
                }),
            HandleKind::Kms => table
                .get_or_import(self.kernel.as_ref(), self.fd(), bo)
                .map(WinsysHandle::Kms),
        };
        self.observe(result)
    }

    /// Buffer for a shared handle. A KMS handle is resolved in `front_end`'s
    /// description, or in the device's own when `None`.
    pub fn buffer_from_handle(
        &self,
        handle: WinsysHandle,
        front_end: Option<&FrontEnd>,
    ) -> Result<Bo> {
        self.check_lost()?;
        let result = match handle {
            WinsysHandle::Fd(dmabuf) => self.exports.import_dmabuf(self, dmabuf),
            WinsysHandle::Kms(kms) => {
                let table = self.table_for(front_end)?;
                match self.kernel.prime_export(table.fd(), kms) {
                    Ok(dmabuf) => {
                        let result = self.exports.import_dmabuf(self, dmabuf);
                        self.kernel.close_fd(dmabuf.0);
                        result
                    }
                    Err(err) => Err(err.unless_fatal(Error::ImportFailed)),
                }
            }
        };
        self.observe(result)
    }

    /// Handle table for `front_end`, which must belong to this device
    fn table_for<'a>(&'a self, front_end: Option<&'a FrontEnd>) -> Result<&'a HandleTable> {
        match front_end {
            None => Ok(&self.placeholder),
            Some(fe) if ptr::eq(Arc::as_ptr(fe.device()), self) => Ok(fe.table()),
            Some(_) => Err(Error::InvalidParameter),
        }
    }

    /// Close the handle every front-end holds for a buffer
    pub(crate) fn forget_handles(&self, unique_id: u64) {
        let frontends: Vec<Arc<FrontEnd>> = self
            .frontends
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for fe in &frontends {
            fe.table().forget(self.kernel.as_ref(), unique_id);
        }
        self.placeholder.forget(self.kernel.as_ref(), unique_id);
    }

    /// Number of buffers known to the export table
    pub fn shared_buffer_count(&self) -> usize {
        self.exports.len()
    }

    /// Every buffer still alive
    #[cfg(feature = "debug-bo-list")]
    pub fn live_buffers(&self) -> Vec<Arc<BoInner>> {
        self.buffers.live_buffers()
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Queue a submission for the worker
    pub fn submit(&self, cs: Submission) -> Result<SubmitTicket> {
        self.check_lost()?;
        self.cs.submit(cs)
    }

    /// Submit and wait until the kernel has accepted the work
    pub fn submit_sync(&self, cs: Submission) -> Result<SeqNo> {
        self.check_lost()?;
        self.cs.submit_sync(cs)
    }

    /// Wait until every queued submission reached the kernel
    pub fn flush(&self) -> Result<()> {
        self.cs.flush()
    }

    // =========================================================================
    // GPU virtual memory
    // =========================================================================

    /// Map a real buffer at an additional GPU address. Returns the timeline
    /// point signaled once the mapping is live.
    pub fn vm_map(&self, bo: &Bo, va: GpuAddr) -> Result<u64> {
        self.check_lost()?;
        let handle = bo.kms_handle().ok_or(Error::InvalidParameter)?;
        self.observe(self.buffers.vm().map(handle, va, bo.size()))
    }

    /// Remove a mapping made with [`Device::vm_map`]
    pub fn vm_unmap(&self, bo: &Bo, va: GpuAddr) -> Result<u64> {
        self.check_lost()?;
        let handle = bo.kms_handle().ok_or(Error::InvalidParameter)?;
        self.observe(self.buffers.vm().unmap(handle, va, bo.size()))
    }

    /// Last timeline point handed out by a page-table update
    pub fn vm_timeline_point(&self) -> u64 {
        self.buffers.vm().point()
    }

    // =========================================================================
    // Front-ends
    // =========================================================================

    pub(crate) fn attach_frontend(&self, fe: &Arc<FrontEnd>) {
        self.frontends.lock().push(Arc::downgrade(fe));
        self.frontend_refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach_frontend(&self, fe: &FrontEnd) {
        self.frontends
            .lock()
            .retain(|weak| weak.strong_count() > 0 && !ptr::eq(weak.as_ptr(), fe));
    }

    /// Drop one front-end reference; true when it was the last
    pub(crate) fn release_frontend_ref(&self) -> bool {
        self.frontend_refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[inline]
    pub(crate) fn frontend_refs(&self) -> u32 {
        self.frontend_refs.load(Ordering::Acquire)
    }

    /// Live front-end matching `fd`'s file description
    pub(crate) fn find_frontend(
        &self,
        fd: RawFd,
        keep: &mut Vec<Arc<FrontEnd>>,
    ) -> Result<Option<Arc<FrontEnd>>> {
        let start = keep.len();
        keep.extend(self.frontends.lock().iter().filter_map(Weak::upgrade));
        for fe in &keep[start..] {
            if self.kernel.same_file_description(fe.fd(), fd)? {
                return Ok(Some(fe.clone()));
            }
        }
        Ok(None)
    }

    /// Number of live front-ends
    pub fn frontend_count(&self) -> usize {
        self.frontends
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl BoReleaser for Device {
    fn release(&self, bo: Arc<BoInner>) {
        if bo.is_shared() {
            self.exports.destroy(self, bo);
        } else {
            self.buffers.release_private(bo);
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("{}: tearing down device", self.key);
        self.cs.shutdown();
        self.buffers.teardown();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("key", &self.key)
            .field("fd", &self.fd())
            .field("lost", &self.is_lost())
            .field("frontends", &self.frontend_refs())
            .field("buffers", &self.buffers)
            .finish_non_exhaustive()
    }
}
