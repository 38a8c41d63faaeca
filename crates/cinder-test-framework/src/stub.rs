//! In-memory kernel implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use cinder_core::kernel::{GemCreateInfo, ImportedBo, KernelInterface, SubmitRequest, VmOp};
use cinder_core::{
    BoIdentity, CpuAddr, DeviceKey, DmaBufFd, Domain, Error, FenceId, GpuAddr, KmsHandle, QueueKind,
    RawFd, Result, SyncobjHandle, align_up,
};
use hashbrown::{HashMap, HashSet};
use spin::Mutex;

const EBADF: i32 = -9;
const ENOENT: i32 = -2;
const EINVAL: i32 = -22;

/// First GPU virtual address handed out per description
const VA_BASE: u64 = 0x1_0000_0000;

// =============================================================================
// OBSERVABLE RECORDS
// =============================================================================

/// Call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelCounters {
    /// Successful GEM allocations
    pub gem_creates: u64,
    /// GEM handle closes
    pub gem_closes: u64,
    /// dma-buf exports
    pub prime_exports: u64,
    /// dma-buf imports
    pub prime_imports: u64,
    /// CPU mappings
    pub mmaps: u64,
    /// CPU unmappings
    pub munmaps: u64,
    /// VA reservations
    pub va_allocs: u64,
    /// VA releases
    pub va_frees: u64,
    /// Page-table updates
    pub vm_binds: u64,
    /// Accepted submissions
    pub submits: u64,
    /// Fence waits that found the fence pending
    pub fence_waits: u64,
    /// Fence references dropped
    pub fence_releases: u64,
}

/// One accepted submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSubmit {
    /// Target queue
    pub queue: QueueKind,
    /// Submitting context
    pub context: cinder_core::ContextId,
    /// Buffers as handles in the submitting description
    pub buffers: Vec<KmsHandle>,
    /// Explicit dependencies
    pub dependencies: Vec<FenceId>,
    /// Fence returned
    pub fence: FenceId,
}

// =============================================================================
// INTERNAL STATE
// =============================================================================

#[derive(Debug)]
struct Description {
    path: String,
    handles: HashMap<KmsHandle, BoIdentity>,
    by_identity: HashMap<BoIdentity, KmsHandle>,
    next_va: u64,
}

impl Description {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            handles: HashMap::new(),
            by_identity: HashMap::new(),
            next_va: VA_BASE,
        }
    }
}

#[derive(Debug)]
struct Object {
    size: u64,
    domain: Domain,
}

#[derive(Debug, Default)]
struct StubFence {
    signaled: bool,
    released: bool,
}

#[derive(Debug, Default)]
struct State {
    fds: HashMap<RawFd, u64>,
    descriptions: HashMap<u64, Description>,
    dmabufs: HashMap<RawFd, BoIdentity>,
    objects: HashMap<BoIdentity, Object>,
    fences: HashMap<FenceId, StubFence>,
    syncobjs: HashSet<u32>,
    mappings: HashMap<usize, u64>,

    submissions: Vec<RecordedSubmit>,
    wait_log: Vec<FenceId>,
    vm_ops: Vec<(VmOp, u64)>,
    counters: KernelCounters,

    next_fd: RawFd,
    next_description: u64,
    next_handle: u32,
    next_identity: u64,
    next_fence: u64,
    next_syncobj: u32,
    next_cpu: usize,

    memory_used: u64,
    memory_limit: Option<u64>,
    failing_allocs: u32,
    failing_imports: u32,
    lost: bool,
    hang_fences: bool,
    query_error: Option<Error>,
    wait_error: Option<Error>,
    prime_error: Option<Error>,
}

impl State {
    fn description(&self, fd: RawFd) -> Result<&Description> {
        let id = self.fds.get(&fd).ok_or(Error::Kernel(EBADF))?;
        self.descriptions.get(id).ok_or(Error::Kernel(EBADF))
    }

    fn description_mut(&mut self, fd: RawFd) -> Result<&mut Description> {
        let id = *self.fds.get(&fd).ok_or(Error::Kernel(EBADF))?;
        self.descriptions.get_mut(&id).ok_or(Error::Kernel(EBADF))
    }

    fn alloc_fd(&mut self) -> RawFd {
        self.next_fd += 1;
        self.next_fd
    }

    fn alloc_handle(&mut self) -> KmsHandle {
        self.next_handle += 1;
        KmsHandle(self.next_handle)
    }

    /// Handle for `identity` in `fd`'s description, creating one if needed
    fn handle_for(&mut self, fd: RawFd, identity: BoIdentity) -> Result<KmsHandle> {
        if let Some(handle) = self.description(fd)?.by_identity.get(&identity) {
            return Ok(*handle);
        }
        let handle = self.alloc_handle();
        let desc = self.description_mut(fd)?;
        desc.handles.insert(handle, identity);
        desc.by_identity.insert(identity, handle);
        Ok(handle)
    }

    /// Free the object once no handle or dma-buf refers to it
    fn collect(&mut self, identity: BoIdentity) {
        let referenced = self.dmabufs.values().any(|id| *id == identity)
            || self
                .descriptions
                .values()
                .any(|d| d.by_identity.contains_key(&identity));
        if !referenced {
            if let Some(object) = self.objects.remove(&identity) {
                self.memory_used -= object.size;
            }
        }
    }
}

// =============================================================================
// STUB KERNEL
// =============================================================================

/// In-memory DRM kernel
#[derive(Debug)]
pub struct StubKernel {
    state: Mutex<State>,
    clock_ns: AtomicU64,
}

impl Default for StubKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl StubKernel {
    /// Create an empty kernel
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_fd: 100,
                next_cpu: 0x7f00_0000_0000,
                ..State::default()
            }),
            clock_ns: AtomicU64::new(1_000_000),
        }
    }

    /// Open `path`, creating a new file description
    pub fn open(&self, path: &str) -> RawFd {
        let mut state = self.state.lock();
        state.next_description += 1;
        let id = state.next_description;
        state.descriptions.insert(id, Description::new(path));
        let fd = state.alloc_fd();
        state.fds.insert(fd, id);
        fd
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Identity a handle refers to inside `fd`'s description
    pub fn resolve(&self, fd: RawFd, handle: KmsHandle) -> Option<BoIdentity> {
        let state = self.state.lock();
        state.description(fd).ok()?.handles.get(&handle).copied()
    }

    /// Whether `handle` is open in `fd`'s description
    pub fn handle_valid(&self, fd: RawFd, handle: KmsHandle) -> bool {
        self.resolve(fd, handle).is_some()
    }

    /// Number of open handles in `fd`'s description
    pub fn handle_count(&self, fd: RawFd) -> usize {
        let state = self.state.lock();
        state.description(fd).map_or(0, |d| d.handles.len())
    }

    /// Whether `fd` is open (description or dma-buf)
    pub fn is_fd_open(&self, fd: RawFd) -> bool {
        let state = self.state.lock();
        state.fds.contains_key(&fd) || state.dmabufs.contains_key(&fd)
    }

    /// Number of open descriptors, dma-bufs included
    pub fn open_fd_count(&self) -> usize {
        let state = self.state.lock();
        state.fds.len() + state.dmabufs.len()
    }

    /// Number of live allocations
    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Bytes held by live allocations
    pub fn memory_used(&self) -> u64 {
        self.state.lock().memory_used
    }

    /// Number of live CPU mappings
    pub fn live_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Number of live timeline objects
    pub fn live_syncobjs(&self) -> usize {
        self.state.lock().syncobjs.len()
    }

    /// Fences not yet released
    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.values().filter(|f| !f.released).count()
    }

    /// Call counters
    pub fn counters(&self) -> KernelCounters {
        self.state.lock().counters
    }

    /// Every accepted submission, in order
    pub fn submissions(&self) -> Vec<RecordedSubmit> {
        self.state.lock().submissions.clone()
    }

    /// Fences that were pending when waited on, in wait order
    pub fn wait_log(&self) -> Vec<FenceId> {
        self.state.lock().wait_log.clone()
    }

    /// Page-table updates with their timeline points
    pub fn vm_ops(&self) -> Vec<(VmOp, u64)> {
        self.state.lock().vm_ops.clone()
    }

    /// Whether a fence has signaled
    pub fn is_signaled(&self, fence: FenceId) -> bool {
        self.state.lock().fences.get(&fence).is_some_and(|f| f.signaled)
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Signal every pending fence
    pub fn signal_all(&self) {
        let mut state = self.state.lock();
        for fence in state.fences.values_mut() {
            fence.signaled = true;
        }
    }

    /// Signal one fence
    pub fn signal(&self, fence: FenceId) {
        if let Some(f) = self.state.lock().fences.get_mut(&fence) {
            f.signaled = true;
        }
    }

    /// Make waits on pending fences time out instead of completing them
    pub fn set_hang_fences(&self, hang: bool) {
        self.state.lock().hang_fences = hang;
    }

    /// Make fence queries fail with `error` until reset with `None`
    pub fn fail_fence_queries(&self, error: Option<Error>) {
        self.state.lock().query_error = error;
    }

    /// Make fence waits fail with `error` until reset with `None`
    pub fn fail_fence_waits(&self, error: Option<Error>) {
        self.state.lock().wait_error = error;
    }

    /// Cap total allocated bytes; allocations beyond fail with `OutOfMemory`
    pub fn set_memory_limit(&self, limit: Option<u64>) {
        self.state.lock().memory_limit = limit;
    }

    /// Fail the next `count` GEM allocations with `OutOfMemory`
    pub fn fail_next_allocs(&self, count: u32) {
        self.state.lock().failing_allocs = count;
    }

    /// Fail the next `count` prime imports
    pub fn fail_next_imports(&self, count: u32) {
        self.state.lock().failing_imports = count;
    }

    /// Make prime exports and imports fail with `error` until reset with
    /// `None`
    pub fn fail_prime(&self, error: Option<Error>) {
        self.state.lock().prime_error = error;
    }

    /// Simulate a GPU reset: submissions, waits and VM updates fail with
    /// `DeviceLost`
    pub fn inject_device_lost(&self) {
        self.state.lock().lost = true;
    }

    /// Advance the monotonic clock
    pub fn advance_clock(&self, ns: u64) {
        self.clock_ns.fetch_add(ns, Ordering::SeqCst);
    }
}

impl KernelInterface for StubKernel {
    fn device_key(&self, fd: RawFd) -> Result<DeviceKey> {
        let state = self.state.lock();
        Ok(DeviceKey(state.description(fd)?.path.clone()))
    }

    fn same_file_description(&self, a: RawFd, b: RawFd) -> Result<bool> {
        let state = self.state.lock();
        let da = state.fds.get(&a).ok_or(Error::Kernel(EBADF))?;
        let db = state.fds.get(&b).ok_or(Error::Kernel(EBADF))?;
        Ok(da == db)
    }

    fn dup_fd(&self, fd: RawFd) -> Result<RawFd> {
        let mut state = self.state.lock();
        let id = *state.fds.get(&fd).ok_or(Error::Kernel(EBADF))?;
        let new_fd = state.alloc_fd();
        state.fds.insert(new_fd, id);
        Ok(new_fd)
    }

    fn close_fd(&self, fd: RawFd) {
        let mut state = self.state.lock();
        if let Some(identity) = state.dmabufs.remove(&fd) {
            state.collect(identity);
            return;
        }
        let Some(id) = state.fds.remove(&fd) else {
            return;
        };
        if state.fds.values().any(|other| *other == id) {
            return;
        }
        // Last descriptor gone: the description and its handles die with it
        if let Some(desc) = state.descriptions.remove(&id) {
            for identity in desc.by_identity.keys() {
                state.collect(*identity);
            }
        }
    }

    fn gem_create(&self, fd: RawFd, info: &GemCreateInfo) -> Result<(KmsHandle, BoIdentity)> {
        let mut state = self.state.lock();
        state.description(fd)?;
        if info.size == 0 || !info.alignment.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }
        if state.failing_allocs > 0 {
            state.failing_allocs -= 1;
            return Err(Error::OutOfMemory);
        }
        if let Some(limit) = state.memory_limit {
            if state.memory_used + info.size > limit {
                return Err(Error::OutOfMemory);
            }
        }
        state.next_identity += 1;
        let identity = BoIdentity(state.next_identity);
        state.objects.insert(
            identity,
            Object {
                size: info.size,
                domain: info.domain,
            },
        );
        state.memory_used += info.size;
        let handle = state.handle_for(fd, identity)?;
        state.counters.gem_creates += 1;
        log::trace!(
            "stub: gem_create {:?} {} bytes in {:?} -> {:?}",
            identity,
            info.size,
            info.domain,
            handle
        );
        Ok((handle, identity))
    }

    fn gem_close(&self, fd: RawFd, handle: KmsHandle) {
        let mut state = self.state.lock();
        let Ok(desc) = state.description_mut(fd) else {
            return;
        };
        let Some(identity) = desc.handles.remove(&handle) else {
            return;
        };
        desc.by_identity.remove(&identity);
        state.counters.gem_closes += 1;
        state.collect(identity);
    }

    fn prime_export(&self, fd: RawFd, handle: KmsHandle) -> Result<DmaBufFd> {
        let mut state = self.state.lock();
        if let Some(err) = state.prime_error {
            return Err(err);
        }
        let identity = *state
            .description(fd)?
            .handles
            .get(&handle)
            .ok_or(Error::Kernel(ENOENT))?;
        let dmabuf = state.alloc_fd();
        state.dmabufs.insert(dmabuf, identity);
        state.counters.prime_exports += 1;
        Ok(DmaBufFd(dmabuf))
    }

    fn prime_import(&self, fd: RawFd, dmabuf: DmaBufFd) -> Result<ImportedBo> {
        let mut state = self.state.lock();
        if let Some(err) = state.prime_error {
            return Err(err);
        }
        if state.failing_imports > 0 {
            state.failing_imports -= 1;
            return Err(Error::Kernel(EINVAL));
        }
        let identity = *state.dmabufs.get(&dmabuf.0).ok_or(Error::Kernel(EBADF))?;
        let (size, domain) = state
            .objects
            .get(&identity)
            .map(|o| (o.size, o.domain))
            .ok_or(Error::Kernel(ENOENT))?;
        let handle = state.handle_for(fd, identity)?;
        state.counters.prime_imports += 1;
        Ok(ImportedBo {
            handle,
            identity,
            size,
            domain,
        })
    }

    fn gem_mmap(&self, fd: RawFd, handle: KmsHandle, size: u64) -> Result<CpuAddr> {
        let mut state = self.state.lock();
        if !state.description(fd)?.handles.contains_key(&handle) {
            return Err(Error::Kernel(ENOENT));
        }
        let addr = state.next_cpu;
        state.next_cpu += align_up(size, 4096) as usize;
        state.mappings.insert(addr, size);
        state.counters.mmaps += 1;
        Ok(CpuAddr::new(addr))
    }

    fn gem_munmap(&self, addr: CpuAddr, _size: u64) {
        let mut state = self.state.lock();
        if state.mappings.remove(&addr.raw()).is_some() {
            state.counters.munmaps += 1;
        }
    }

    fn va_alloc(&self, fd: RawFd, size: u64, alignment: u64) -> Result<GpuAddr> {
        let mut state = self.state.lock();
        let desc = state.description_mut(fd)?;
        let va = align_up(desc.next_va, alignment.max(4096));
        desc.next_va = va + size;
        state.counters.va_allocs += 1;
        Ok(GpuAddr::new(va))
    }

    fn va_free(&self, _fd: RawFd, _va: GpuAddr, _size: u64) {
        self.state.lock().counters.va_frees += 1;
    }

    fn vm_bind(&self, fd: RawFd, op: VmOp, timeline: SyncobjHandle, point: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(Error::DeviceLost);
        }
        let handle = match op {
            VmOp::Map { handle, .. } | VmOp::Unmap { handle, .. } => handle,
        };
        if !state.description(fd)?.handles.contains_key(&handle) {
            return Err(Error::Kernel(ENOENT));
        }
        if !state.syncobjs.contains(&timeline.0) {
            return Err(Error::Kernel(EINVAL));
        }
        state.vm_ops.push((op, point));
        state.counters.vm_binds += 1;
        Ok(())
    }

    fn syncobj_create(&self, fd: RawFd) -> Result<SyncobjHandle> {
        let mut state = self.state.lock();
        state.description(fd)?;
        state.next_syncobj += 1;
        let handle = state.next_syncobj;
        state.syncobjs.insert(handle);
        Ok(SyncobjHandle(handle))
    }

    fn syncobj_destroy(&self, _fd: RawFd, syncobj: SyncobjHandle) {
        self.state.lock().syncobjs.remove(&syncobj.0);
    }

    fn submit(&self, fd: RawFd, request: &SubmitRequest<'_>) -> Result<FenceId> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(Error::DeviceLost);
        }
        let desc = state.description(fd)?;
        if let Some(bad) = request.buffers.iter().find(|h| !desc.handles.contains_key(*h)) {
            log::warn!("stub: submit references unknown handle {:?}", bad);
            return Err(Error::Kernel(ENOENT));
        }
        if request.dependencies.iter().any(|d| !state.fences.contains_key(d)) {
            return Err(Error::InvalidParameter);
        }
        state.next_fence += 1;
        let fence = FenceId(state.next_fence);
        state.fences.insert(fence, StubFence::default());
        state.submissions.push(RecordedSubmit {
            queue: request.queue,
            context: request.context,
            buffers: request.buffers.to_vec(),
            dependencies: request.dependencies.to_vec(),
            fence,
        });
        state.counters.submits += 1;
        Ok(fence)
    }

    fn fence_query(&self, fence: FenceId) -> Result<bool> {
        let state = self.state.lock();
        if state.lost {
            return Err(Error::DeviceLost);
        }
        if let Some(err) = state.query_error {
            return Err(err);
        }
        state
            .fences
            .get(&fence)
            .map(|f| f.signaled)
            .ok_or(Error::Kernel(ENOENT))
    }

    fn fence_wait(&self, fence: FenceId, _timeout_ns: u64) -> Result<bool> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(Error::DeviceLost);
        }
        if let Some(err) = state.wait_error {
            return Err(err);
        }
        let hang = state.hang_fences;
        let f = state.fences.get_mut(&fence).ok_or(Error::Kernel(ENOENT))?;
        if f.signaled {
            return Ok(true);
        }
        if hang {
            return Ok(false);
        }
        f.signaled = true;
        state.wait_log.push(fence);
        state.counters.fence_waits += 1;
        Ok(true)
    }

    fn fence_release(&self, fence: FenceId) {
        let mut state = self.state.lock();
        if let Some(f) = state.fences.get_mut(&fence) {
            f.released = true;
            state.counters.fence_releases += 1;
        }
    }

    fn now_ns(&self) -> u64 {
        self.clock_ns.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::{BoFlags, ContextId};

    fn create(kernel: &StubKernel, fd: RawFd, size: u64) -> (KmsHandle, BoIdentity) {
        let info = GemCreateInfo {
            size,
            alignment: 4096,
            domain: Domain::Vram,
            flags: BoFlags::empty(),
        };
        kernel.gem_create(fd, &info).unwrap()
    }

    #[test]
    fn test_handles_are_scoped_per_description() {
        let kernel = StubKernel::new();
        let a = kernel.open("/dev/dri/renderD128");
        let b = kernel.open("/dev/dri/renderD128");
        let (handle, identity) = create(&kernel, a, 4096);

        assert!(kernel.handle_valid(a, handle));
        assert!(!kernel.handle_valid(b, handle));

        let dmabuf = kernel.prime_export(a, handle).unwrap();
        let imported = kernel.prime_import(b, dmabuf).unwrap();
        assert_ne!(imported.handle, handle);
        assert_eq!(imported.identity, identity);
        assert_eq!(kernel.resolve(b, imported.handle), Some(identity));
    }

    #[test]
    fn test_import_dedupes_within_description() {
        let kernel = StubKernel::new();
        let a = kernel.open("/dev/dri/renderD128");
        let (handle, _) = create(&kernel, a, 4096);
        let dmabuf = kernel.prime_export(a, handle).unwrap();

        let again = kernel.prime_import(a, dmabuf).unwrap();
        assert_eq!(again.handle, handle);
    }

    #[test]
    fn test_dup_shares_description() {
        let kernel = StubKernel::new();
        let a = kernel.open("/dev/dri/renderD128");
        let dup = kernel.dup_fd(a).unwrap();
        let other = kernel.open("/dev/dri/renderD128");

        assert!(kernel.same_file_description(a, dup).unwrap());
        assert!(!kernel.same_file_description(a, other).unwrap());
    }

    #[test]
    fn test_object_freed_after_last_reference() {
        let kernel = StubKernel::new();
        let a = kernel.open("/dev/dri/renderD128");
        let (handle, _) = create(&kernel, a, 8192);
        let dmabuf = kernel.prime_export(a, handle).unwrap();

        kernel.gem_close(a, handle);
        assert_eq!(kernel.live_objects(), 1);
        kernel.close_fd(dmabuf.0);
        assert_eq!(kernel.live_objects(), 0);
        assert_eq!(kernel.memory_used(), 0);
    }

    #[test]
    fn test_memory_limit() {
        let kernel = StubKernel::new();
        let a = kernel.open("/dev/dri/renderD128");
        kernel.set_memory_limit(Some(8192));
        create(&kernel, a, 8192);

        let info = GemCreateInfo {
            size: 4096,
            alignment: 4096,
            domain: Domain::Gtt,
            flags: BoFlags::empty(),
        };
        assert_eq!(kernel.gem_create(a, &info), Err(Error::OutOfMemory));
    }

    #[test]
    fn test_fences_signal_on_wait() {
        let kernel = StubKernel::new();
        let a = kernel.open("/dev/dri/renderD128");
        let request = SubmitRequest {
            queue: QueueKind::Gfx,
            context: ContextId(1),
            commands: &[0],
            buffers: &[],
            dependencies: &[],
        };
        let fence = kernel.submit(a, &request).unwrap();
        assert!(!kernel.fence_query(fence).unwrap());
        assert!(kernel.fence_wait(fence, 0).unwrap());
        assert!(kernel.fence_query(fence).unwrap());
        assert_eq!(kernel.wait_log(), vec![fence]);
    }

    #[test]
    fn test_device_lost() {
        let kernel = StubKernel::new();
        let a = kernel.open("/dev/dri/renderD128");
        kernel.inject_device_lost();
        let request = SubmitRequest {
            queue: QueueKind::Compute,
            context: ContextId(1),
            commands: &[],
            buffers: &[],
            dependencies: &[],
        };
        assert_eq!(kernel.submit(a, &request), Err(Error::DeviceLost));
    }
}
