//! # Front-Ends
//!
//! One [`FrontEnd`] per open file description using a device. Buffer
//! handles are only valid inside the description that produced them, so
//! every front-end keeps its own table of handles; tables are never shared.

use std::fmt;
use std::sync::Arc;

use cinder_core::{
    BoFlags, Domain, Error, HandleKind, KernelInterface, KmsHandle, RawFd, Result, WinsysHandle,
};
use cinder_mem::Bo;
use hashbrown::HashMap;

use crate::device::Device;
use crate::registry::RegistryInner;

// =============================================================================
// HANDLE TABLE
// =============================================================================

/// Buffer unique id to handle in one file description
pub(crate) struct HandleTable {
    fd: RawFd,
    /// Same description as the device: handles are the native ones
    native: bool,
    handles: spin::Mutex<HashMap<u64, KmsHandle>>,
}

impl HandleTable {
    pub(crate) fn new(fd: RawFd, native: bool) -> Self {
        Self {
            fd,
            native,
            handles: spin::Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub(crate) fn is_native(&self) -> bool {
        self.native
    }

    /// Handle for `bo` in this description, importing it on first use
    pub(crate) fn get_or_import(
        &self,
        kernel: &dyn KernelInterface,
        device_fd: RawFd,
        bo: &Bo,
    ) -> Result<KmsHandle> {
        let native = bo.kms_handle().ok_or(Error::InvalidParameter)?;
        if self.native {
            return Ok(native);
        }

        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(&bo.unique_id()) {
            return Ok(*handle);
        }
        let dmabuf = kernel
            .prime_export(device_fd, native)
            .map_err(|err| err.unless_fatal(Error::ExportFailed))?;
        let imported = kernel.prime_import(self.fd, dmabuf);
        kernel.close_fd(dmabuf.0);
        let handle = imported
            .map_err(|err| {
                log::warn!("fd {}: importing buffer {} failed: {}", self.fd, bo.unique_id(), err);
                err.unless_fatal(Error::ExportFailed)
            })?
            .handle;
        handles.insert(bo.unique_id(), handle);
        Ok(handle)
    }

    /// Close this description's handle for a buffer
    pub(crate) fn forget(&self, kernel: &dyn KernelInterface, unique_id: u64) {
        if let Some(handle) = self.handles.lock().remove(&unique_id) {
            kernel.gem_close(self.fd, handle);
        }
    }

    pub(crate) fn close_all(&self, kernel: &dyn KernelInterface) {
        let handles: Vec<KmsHandle> = self.handles.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            kernel.gem_close(self.fd, handle);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.lock().len()
    }
}

// =============================================================================
// FRONT-END
// =============================================================================

/// Client view of a device through one file description
pub struct FrontEnd {
    table: HandleTable,
    device: Arc<Device>,
    registry: Arc<RegistryInner>,
}

impl FrontEnd {
    pub(crate) fn new(
        fd: RawFd,
        native: bool,
        device: Arc<Device>,
        registry: Arc<RegistryInner>,
    ) -> Self {
        Self {
            table: HandleTable::new(fd, native),
            device,
            registry,
        }
    }

    /// The shared device
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// This front-end's own descriptor
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.table.fd()
    }

    /// Whether this description is the device's own
    #[inline]
    pub fn is_native(&self) -> bool {
        self.table.is_native()
    }

    #[inline]
    pub(crate) fn table(&self) -> &HandleTable {
        &self.table
    }

    /// Buffers this front-end holds an imported handle for
    pub fn imported_handle_count(&self) -> usize {
        self.table.len()
    }

    /// Allocate a buffer on the device
    pub fn buffer_create(
        &self,
        size: u64,
        alignment: u64,
        domain: Domain,
        flags: BoFlags,
    ) -> Result<Bo> {
        self.device.buffer_create(size, alignment, domain, flags)
    }

    /// Handle for `bo` valid in this front-end's description
    pub fn buffer_get_handle(&self, bo: &Bo, kind: HandleKind) -> Result<WinsysHandle> {
        self.device.buffer_get_handle(bo, Some(self), kind)
    }

    /// Buffer for a handle from this front-end's description or a dma-buf
    pub fn buffer_from_handle(&self, handle: WinsysHandle) -> Result<Bo> {
        self.device.buffer_from_handle(handle, Some(self))
    }
}

impl Drop for FrontEnd {
    fn drop(&mut self) {
        self.device.detach_frontend(self);
        let kernel = self.device.kernel();
        self.table.close_all(kernel.as_ref());
        kernel.close_fd(self.table.fd());
        self.registry.release_device(&self.device);
    }
}

impl fmt::Debug for FrontEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrontEnd")
            .field("fd", &self.fd())
            .field("native", &self.is_native())
            .field("device", self.device.key())
            .finish()
    }
}
