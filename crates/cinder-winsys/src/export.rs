//! # Export Table
//!
//! Maps the stable kernel identity of every shared buffer to its one
//! canonical [`BoInner`]. Imports look up here first so an allocation is
//! never wrapped twice, and destruction of a shared buffer re-checks its
//! reference count under this table's lock because an import may revive it.
//!
//! Lock order: export table, then the device's front-end list, then a
//! front-end's handle table.

use std::fmt;
use std::sync::Arc;

use cinder_core::{BoIdentity, DmaBufFd, Error, Result};
use cinder_mem::{Bo, BoInner};
use hashbrown::HashMap;

use crate::device::Device;

/// Shared buffers of one device, by kernel identity
pub(crate) struct ExportTable {
    map: spin::Mutex<HashMap<BoIdentity, Arc<BoInner>>>,
}

impl ExportTable {
    pub(crate) fn new() -> Self {
        Self {
            map: spin::Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Hold the table lock, stalling every import and shared release
    #[cfg(test)]
    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, HashMap<BoIdentity, Arc<BoInner>>> {
        self.map.lock()
    }

    /// Mark a real buffer shared and make it findable by identity
    pub(crate) fn insert_shared(&self, bo: &Arc<BoInner>) {
        let Some(identity) = bo.identity() else {
            return;
        };
        let mut map = self.map.lock();
        bo.mark_shared();
        map.entry(identity).or_insert_with(|| bo.clone());
    }

    /// Import a dma-buf into the device description, returning the existing
    /// buffer when the allocation is already known
    pub(crate) fn import_dmabuf(&self, device: &Device, dmabuf: DmaBufFd) -> Result<Bo> {
        let mut map = self.map.lock();
        let imported = device
            .kernel()
            .prime_import(device.fd(), dmabuf)
            .map_err(|err| {
                log::warn!("{}: dma-buf import failed: {}", device.key(), err);
                err.unless_fatal(Error::ImportFailed)
            })?;

        if let Some(existing) = map.get(&imported.identity) {
            log::trace!(
                "{}: import of {:?} found buffer {}",
                device.key(),
                imported.identity,
                existing.unique_id()
            );
            return Ok(Bo::acquire(existing));
        }

        let identity = imported.identity;
        let inner = device.buffers().wrap_imported(imported).map_err(|err| {
            log::warn!("{}: wrapping imported {:?} failed: {}", device.key(), identity, err);
            err.unless_fatal(Error::ImportFailed)
        })?;
        map.insert(identity, inner.clone());
        Ok(Bo::acquire(&inner))
    }

    /// Destroy a shared buffer whose last client reference was dropped,
    /// unless an import revived it meanwhile.
    ///
    /// Only the release that takes the buffer out of the table destroys it.
    /// A revived buffer that drops to zero again releases a second time; the
    /// loser of that race finds the entry gone and leaves.
    pub(crate) fn destroy(&self, device: &Device, bo: Arc<BoInner>) {
        let mut map = self.map.lock();
        if bo.refcount() > 0 {
            return;
        }
        let Some(identity) = bo.identity() else {
            return;
        };
        if !map.get(&identity).is_some_and(|entry| Arc::ptr_eq(entry, &bo)) {
            log::trace!("{}: buffer {} already destroyed", device.key(), bo.unique_id());
            return;
        }
        map.remove(&identity);
        device.forget_handles(bo.unique_id());
        // Still under the lock: a racing import must not see the handle
        // being closed
        device.buffers().destroy_real(bo);
        drop(map);
    }
}

impl fmt::Debug for ExportTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportTable")
            .field("buffers", &self.len())
            .finish()
    }
}
