//! # GPU Virtual Memory Timeline
//!
//! Page-table updates are asynchronous. Each update signals the next point
//! on a device-wide timeline object; submissions that need a mapping wait
//! for its point. The lock keeps point order equal to kernel call order.

use alloc::sync::Arc;
use core::fmt;

use cinder_core::{GpuAddr, KernelInterface, KmsHandle, RawFd, Result, SyncobjHandle, VmOp};

/// Serialized page-table updates of one device
pub struct VmTimeline {
    kernel: Arc<dyn KernelInterface>,
    fd: RawFd,
    syncobj: SyncobjHandle,
    point: spin::Mutex<u64>,
}

impl VmTimeline {
    /// Create the timeline object on `fd`
    pub fn new(kernel: Arc<dyn KernelInterface>, fd: RawFd) -> Result<Self> {
        let syncobj = kernel.syncobj_create(fd)?;
        Ok(Self {
            kernel,
            fd,
            syncobj,
            point: spin::Mutex::new(0),
        })
    }

    /// Map `handle` at `va`; returns the point signaled when the mapping is live
    pub fn map(&self, handle: KmsHandle, va: GpuAddr, size: u64) -> Result<u64> {
        self.bind(VmOp::Map { handle, va, size })
    }

    /// Unmap the range at `va`; returns the point signaled when it is gone
    pub fn unmap(&self, handle: KmsHandle, va: GpuAddr, size: u64) -> Result<u64> {
        self.bind(VmOp::Unmap { handle, va, size })
    }

    fn bind(&self, op: VmOp) -> Result<u64> {
        let mut point = self.point.lock();
        let next = *point + 1;
        self.kernel.vm_bind(self.fd, op, self.syncobj, next)?;
        *point = next;
        Ok(next)
    }

    /// Last point handed out
    pub fn point(&self) -> u64 {
        *self.point.lock()
    }

    /// Timeline object
    pub fn syncobj(&self) -> SyncobjHandle {
        self.syncobj
    }
}

impl Drop for VmTimeline {
    fn drop(&mut self) {
        self.kernel.syncobj_destroy(self.fd, self.syncobj);
    }
}

impl fmt::Debug for VmTimeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmTimeline")
            .field("fd", &self.fd)
            .field("syncobj", &self.syncobj)
            .field("point", &self.point())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::{BoFlags, Domain, GemCreateInfo};
    use cinder_test_framework::StubKernel;

    #[test]
    fn test_points_follow_call_order() {
        let stub = Arc::new(StubKernel::new());
        let fd = stub.open("/dev/dri/renderD128");
        let info = GemCreateInfo {
            size: 4096,
            alignment: 4096,
            domain: Domain::Vram,
            flags: BoFlags::empty(),
        };
        let (handle, _) = stub.gem_create(fd, &info).unwrap();

        let vm = VmTimeline::new(stub.clone(), fd).unwrap();
        let va = GpuAddr::new(0x10_0000);
        assert_eq!(vm.map(handle, va, 4096).unwrap(), 1);
        assert_eq!(vm.unmap(handle, va, 4096).unwrap(), 2);
        assert_eq!(vm.point(), 2);

        let ops = stub.vm_ops();
        assert_eq!(ops[0], (VmOp::Map { handle, va, size: 4096 }, 1));
        assert_eq!(ops[1].1, 2);

        drop(vm);
        assert_eq!(stub.live_syncobjs(), 0);
    }

    #[test]
    fn test_failed_bind_does_not_advance() {
        let stub = Arc::new(StubKernel::new());
        let fd = stub.open("/dev/dri/renderD128");
        let vm = VmTimeline::new(stub.clone(), fd).unwrap();

        assert!(vm.map(KmsHandle(999), GpuAddr::new(0), 4096).is_err());
        assert_eq!(vm.point(), 0);
    }
}
