//! # Device Registry
//!
//! Maps device paths to live [`Device`]s. Opening a descriptor finds or
//! creates the device and the front-end for the descriptor's file
//! description; the device is torn down when its last front-end goes away.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cinder_core::{DeviceKey, KernelInterface, RawFd, Result, WinsysConfig};
use hashbrown::HashMap;

use crate::device::Device;
use crate::frontend::FrontEnd;

pub(crate) struct RegistryInner {
    kernel: Arc<dyn KernelInterface>,
    config: WinsysConfig,
    devices: Mutex<HashMap<DeviceKey, Arc<Device>>>,
}

impl RegistryInner {
    fn devices(&self) -> MutexGuard<'_, HashMap<DeviceKey, Arc<Device>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop a front-end's device reference; the last one unregisters the
    /// device
    pub(crate) fn release_device(&self, device: &Arc<Device>) {
        let removed = {
            let mut devices = self.devices();
            if !device.release_frontend_ref() {
                return;
            }
            match devices.get(device.key()) {
                Some(entry) if Arc::ptr_eq(entry, device) => devices.remove(device.key()),
                _ => None,
            }
        };
        if removed.is_some() {
            log::debug!("{}: last front-end closed", device.key());
        }
    }
}

/// Registry of the devices opened through it
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    /// Empty registry; devices it creates use `config`
    pub fn new(kernel: Arc<dyn KernelInterface>, config: WinsysConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                kernel,
                config,
                devices: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Front-end for `fd`. The caller keeps ownership of `fd`; the
    /// front-end works on its own duplicate.
    pub fn open(&self, fd: RawFd) -> Result<Arc<FrontEnd>> {
        let key = self.inner.kernel.device_key(fd)?;
        // Upgraded front-ends are dropped only after the lock is released
        let mut seen = Vec::new();
        let result = {
            let mut devices = self.inner.devices();
            self.open_locked(&mut devices, key, fd, &mut seen)
        };
        drop(seen);
        result
    }

    fn open_locked(
        &self,
        devices: &mut HashMap<DeviceKey, Arc<Device>>,
        key: DeviceKey,
        fd: RawFd,
        seen: &mut Vec<Arc<FrontEnd>>,
    ) -> Result<Arc<FrontEnd>> {
        let kernel = &self.inner.kernel;
        let device = match devices.get(&key) {
            Some(device) => device.clone(),
            None => {
                let device_fd = kernel.dup_fd(fd)?;
                let device = Device::new(kernel.clone(), device_fd, key.clone(), self.inner.config)?;
                devices.insert(key.clone(), device.clone());
                device
            }
        };

        let frontend = match device.find_frontend(fd, seen) {
            Ok(Some(existing)) => return Ok(existing),
            Ok(None) => self.new_frontend(&device, fd),
            Err(err) => Err(err),
        };
        if frontend.is_err() && device.frontend_refs() == 0 {
            devices.remove(&key);
        }
        let frontend = frontend?;
        device.attach_frontend(&frontend);
        log::debug!(
            "{}: front-end on fd {} ({})",
            key,
            frontend.fd(),
            if frontend.is_native() { "native" } else { "foreign description" }
        );
        Ok(frontend)
    }

    fn new_frontend(&self, device: &Arc<Device>, fd: RawFd) -> Result<Arc<FrontEnd>> {
        let kernel = &self.inner.kernel;
        let fe_fd = kernel.dup_fd(fd)?;
        let native = match kernel.same_file_description(fe_fd, device.fd()) {
            Ok(native) => native,
            Err(err) => {
                kernel.close_fd(fe_fd);
                return Err(err);
            }
        };
        Ok(Arc::new(FrontEnd::new(
            fe_fd,
            native,
            device.clone(),
            self.inner.clone(),
        )))
    }

    /// Number of live devices
    pub fn device_count(&self) -> usize {
        self.inner.devices().len()
    }

    /// Device registered for `key`
    pub fn device(&self, key: &DeviceKey) -> Option<Arc<Device>> {
        self.inner.devices().get(key).cloned()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.device_count())
            .finish()
    }
}
