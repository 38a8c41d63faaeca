//! # Kernel Fences
//!
//! Reference-counted wrapper around a kernel fence object.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use cinder_core::{ContextId, Error, FenceId, KernelInterface, QueueKind, Result};

/// Shared fence handle
pub type FenceRef = Arc<Fence>;

/// Completion fence of one submission
///
/// The kernel reference is dropped together with the last [`FenceRef`].
/// Signaled state is cached: once a query or wait has observed completion,
/// later checks never reach the kernel.
pub struct Fence {
    id: FenceId,
    queue: QueueKind,
    context: ContextId,
    kernel: Arc<dyn KernelInterface>,
    signaled: AtomicBool,
}

impl Fence {
    /// Wrap a fence returned by a submission
    pub fn new(
        kernel: Arc<dyn KernelInterface>,
        id: FenceId,
        queue: QueueKind,
        context: ContextId,
    ) -> FenceRef {
        Arc::new(Self {
            id,
            queue,
            context,
            kernel,
            signaled: AtomicBool::new(false),
        })
    }

    /// Kernel fence id
    #[inline]
    pub fn id(&self) -> FenceId {
        self.id
    }

    /// Queue the submission ran on
    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Context that submitted the work
    #[inline]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Completion already observed; never calls into the kernel
    #[inline]
    pub fn is_known_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Non-blocking completion check. Kernel failures other than a lost
    /// device surface as [`Error::WaitFailed`].
    pub fn is_signaled(&self) -> Result<bool> {
        if self.is_known_signaled() {
            return Ok(true);
        }
        let signaled = self
            .kernel
            .fence_query(self.id)
            .map_err(|err| err.unless_fatal(Error::WaitFailed))?;
        if signaled {
            self.signaled.store(true, Ordering::Release);
        }
        Ok(signaled)
    }

    /// Wait up to `timeout_ns`; `Ok(false)` on timeout
    pub fn wait(&self, timeout_ns: u64) -> Result<bool> {
        if self.is_known_signaled() {
            return Ok(true);
        }
        let signaled = self
            .kernel
            .fence_wait(self.id, timeout_ns)
            .map_err(|err| err.unless_fatal(Error::WaitFailed))?;
        if signaled {
            self.signaled.store(true, Ordering::Release);
        }
        Ok(signaled)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.kernel.fence_release(self.id);
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("context", &self.context)
            .field("signaled", &self.is_known_signaled())
            .finish()
    }
}
