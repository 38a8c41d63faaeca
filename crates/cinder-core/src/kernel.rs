//! # Kernel Interface
//!
//! The ioctl surface the winsys is built on.
//!
//! ```text
//!   ┌──────────────┐  GEM create/close   ┌────────────────────────┐
//!   │              │ ──────────────────▶ │                        │
//!   │   winsys     │  prime export/import│   DRM file description │
//!   │              │ ──────────────────▶ │   (handle namespace)   │
//!   │              │  submit / fences    │                        │
//!   └──────────────┘ ──────────────────▶ └────────────────────────┘
//! ```
//!
//! Every handle-taking call names the file descriptor whose description the
//! handle belongs to. GEM handles from one description mean nothing in
//! another, even for the same device.

use crate::error::Result;
use crate::types::*;

/// Parameters of a GEM allocation
#[derive(Debug, Clone, Copy)]
pub struct GemCreateInfo {
    /// Size in bytes (page aligned)
    pub size: u64,
    /// Alignment in bytes
    pub alignment: u64,
    /// Memory domain
    pub domain: Domain,
    /// Creation flags
    pub flags: BoFlags,
}

/// Result of importing a dma-buf
#[derive(Debug, Clone, Copy)]
pub struct ImportedBo {
    /// Handle in the importing description. Importing the same allocation
    /// twice into one description yields the same handle.
    pub handle: KmsHandle,
    /// Stable identity of the underlying allocation
    pub identity: BoIdentity,
    /// Allocation size
    pub size: u64,
    /// Domain the allocation lives in
    pub domain: Domain,
}

/// Page-table operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmOp {
    /// Map `handle` at `va`
    Map {
        /// Buffer handle in the device description
        handle: KmsHandle,
        /// Virtual address
        va: GpuAddr,
        /// Mapping size
        size: u64,
    },
    /// Unmap the range at `va`
    Unmap {
        /// Buffer handle in the device description
        handle: KmsHandle,
        /// Virtual address
        va: GpuAddr,
        /// Mapping size
        size: u64,
    },
}

/// One command submission as handed to the kernel
#[derive(Debug, Clone, Copy)]
pub struct SubmitRequest<'a> {
    /// Target hardware queue
    pub queue: QueueKind,
    /// Submitting context
    pub context: ContextId,
    /// Encoded command stream (opaque to this layer)
    pub commands: &'a [u32],
    /// Every buffer referenced, as handles in the device description
    pub buffers: &'a [KmsHandle],
    /// Fences that must signal before this work starts
    pub dependencies: &'a [FenceId],
}

/// Kernel boundary
///
/// Implementations must be callable from any thread. Blocking calls
/// ([`fence_wait`](Self::fence_wait)) must never be invoked with a winsys lock
/// held.
pub trait KernelInterface: Send + Sync {
    // =========================================================================
    // Identity
    // =========================================================================

    /// Stable identity of the device behind `fd` (device node path)
    fn device_key(&self, fd: RawFd) -> Result<DeviceKey>;

    /// Whether two descriptors name the same open file description
    fn same_file_description(&self, a: RawFd, b: RawFd) -> Result<bool>;

    /// Duplicate a descriptor (same description)
    fn dup_fd(&self, fd: RawFd) -> Result<RawFd>;

    /// Close a descriptor
    fn close_fd(&self, fd: RawFd);

    // =========================================================================
    // GEM objects
    // =========================================================================

    /// Allocate a buffer; returns its handle and stable identity
    fn gem_create(&self, fd: RawFd, info: &GemCreateInfo) -> Result<(KmsHandle, BoIdentity)>;

    /// Close a handle
    fn gem_close(&self, fd: RawFd, handle: KmsHandle);

    /// Export a handle as a dma-buf
    fn prime_export(&self, fd: RawFd, handle: KmsHandle) -> Result<DmaBufFd>;

    /// Import a dma-buf into `fd`'s description
    fn prime_import(&self, fd: RawFd, dmabuf: DmaBufFd) -> Result<ImportedBo>;

    /// Map a buffer into the CPU address space
    fn gem_mmap(&self, fd: RawFd, handle: KmsHandle, size: u64) -> Result<CpuAddr>;

    /// Drop a CPU mapping
    fn gem_munmap(&self, addr: CpuAddr, size: u64);

    // =========================================================================
    // Virtual memory
    // =========================================================================

    /// Reserve a GPU virtual address range
    fn va_alloc(&self, fd: RawFd, size: u64, alignment: u64) -> Result<GpuAddr>;

    /// Release a GPU virtual address range
    fn va_free(&self, fd: RawFd, va: GpuAddr, size: u64);

    /// Apply a page-table update; `point` is signaled on `timeline` once the
    /// update is visible to the GPU
    fn vm_bind(&self, fd: RawFd, op: VmOp, timeline: SyncobjHandle, point: u64) -> Result<()>;

    /// Create a timeline synchronization object
    fn syncobj_create(&self, fd: RawFd) -> Result<SyncobjHandle>;

    /// Destroy a timeline synchronization object
    fn syncobj_destroy(&self, fd: RawFd, syncobj: SyncobjHandle);

    // =========================================================================
    // Submission and fences
    // =========================================================================

    /// Submit work; returns a fence that signals on completion
    fn submit(&self, fd: RawFd, request: &SubmitRequest<'_>) -> Result<FenceId>;

    /// Non-blocking signaled check
    fn fence_query(&self, fence: FenceId) -> Result<bool>;

    /// Block until signaled or `timeout_ns` elapses. `Ok(false)` on timeout.
    fn fence_wait(&self, fence: FenceId, timeout_ns: u64) -> Result<bool>;

    /// Drop the kernel reference to a fence
    fn fence_release(&self, fence: FenceId);

    // =========================================================================
    // Time
    // =========================================================================

    /// Monotonic clock in nanoseconds
    fn now_ns(&self) -> u64;
}
