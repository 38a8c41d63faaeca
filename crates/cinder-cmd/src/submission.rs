//! # Submissions
//!
//! A command stream for one queue together with the buffers it touches and
//! any fences it must wait for.

use cinder_core::{ContextId, QueueKind};
use cinder_mem::Bo;
use cinder_sync::FenceRef;

/// Work for one hardware queue
#[derive(Debug)]
pub struct Submission {
    queue: QueueKind,
    context: ContextId,
    commands: Vec<u32>,
    buffers: Vec<Bo>,
    dependencies: Vec<FenceRef>,
}

impl Submission {
    /// Empty submission for `queue` on behalf of `context`
    pub fn new(queue: QueueKind, context: ContextId) -> Self {
        Self {
            queue,
            context,
            commands: Vec::new(),
            buffers: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    #[inline]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Append encoded command dwords
    pub fn emit(&mut self, dwords: &[u32]) {
        self.commands.extend_from_slice(dwords);
    }

    /// Reference a buffer. Adding the same buffer twice is a no-op.
    pub fn add_buffer(&mut self, bo: &Bo) {
        if !self.buffers.iter().any(|b| Bo::ptr_eq(b, bo)) {
            self.buffers.push(bo.clone());
        }
    }

    /// Wait for `fence` before executing
    pub fn add_dependency(&mut self, fence: FenceRef) {
        if !self.dependencies.iter().any(|f| f.id() == fence.id()) {
            self.dependencies.push(fence);
        }
    }

    #[inline]
    pub fn commands(&self) -> &[u32] {
        &self.commands
    }

    #[inline]
    pub fn buffers(&self) -> &[Bo] {
        &self.buffers
    }

    #[inline]
    pub fn dependencies(&self) -> &[FenceRef] {
        &self.dependencies
    }
}

/// Submission sitting in the worker queue. Its buffers count it as pending
/// until it is dropped.
#[derive(Debug)]
pub(crate) struct Queued(Submission);

impl Queued {
    pub(crate) fn new(submission: Submission) -> Self {
        for bo in submission.buffers() {
            bo.begin_pending();
        }
        Self(submission)
    }

    pub(crate) fn submission(&self) -> &Submission {
        &self.0
    }
}

impl Drop for Queued {
    fn drop(&mut self) {
        for bo in self.0.buffers() {
            bo.end_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::{BoFlags, Domain, WinsysConfig};
    use cinder_mem::BufferManager;
    use cinder_test_framework::StubKernel;
    use std::sync::Arc;

    #[test]
    fn test_buffers_are_deduplicated() {
        let stub = Arc::new(StubKernel::new());
        let fd = stub.open("/dev/dri/renderD128");
        let mgr = BufferManager::standalone(stub.clone(), fd, WinsysConfig::default()).unwrap();
        let bo = mgr.create(4096, 4096, Domain::Gtt, BoFlags::empty()).unwrap();

        let mut cs = Submission::new(QueueKind::Gfx, ContextId(1));
        cs.add_buffer(&bo);
        cs.add_buffer(&bo.clone());
        cs.emit(&[0xC000_1000, 0]);

        assert_eq!(cs.buffers().len(), 1);
        assert_eq!(cs.commands().len(), 2);
        assert_eq!(bo.refcount(), 2);
    }

    #[test]
    fn test_queued_marks_pending() {
        let stub = Arc::new(StubKernel::new());
        let fd = stub.open("/dev/dri/renderD128");
        let mgr = BufferManager::standalone(stub.clone(), fd, WinsysConfig::default()).unwrap();
        let bo = mgr.create(4096, 4096, Domain::Gtt, BoFlags::empty()).unwrap();

        let mut cs = Submission::new(QueueKind::Compute, ContextId(1));
        cs.add_buffer(&bo);
        let queued = Queued::new(cs);
        assert_eq!(bo.pending_submissions(), 1);
        drop(queued);
        assert_eq!(bo.pending_submissions(), 0);
    }
}
