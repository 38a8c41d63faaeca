//! # Kernel Submission
//!
//! Resolves the implicit dependencies of a submission, hands it to the
//! kernel and records the returned fence in the queue's ring. Every buffer
//! of the submission is stamped with the new sequence number while the
//! fence lock is held.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cinder_core::{
    Error, FenceId, KernelInterface, KmsHandle, RawFd, Result, SeqNo, SubmitRequest,
    WinsysStats,
};
use cinder_sync::{Fence, FenceRef, FenceRings};

use crate::submission::Submission;

/// Synchronous submission path of one device
pub struct Submitter {
    kernel: Arc<dyn KernelInterface>,
    fd: RawFd,
    rings: Arc<FenceRings>,
    stats: Arc<WinsysStats>,
    lost: Arc<AtomicBool>,
    noop: bool,
}

impl Submitter {
    /// `lost` is the device's sticky loss flag
    pub fn new(
        kernel: Arc<dyn KernelInterface>,
        fd: RawFd,
        rings: Arc<FenceRings>,
        stats: Arc<WinsysStats>,
        lost: Arc<AtomicBool>,
    ) -> Self {
        Self {
            kernel,
            fd,
            rings,
            stats,
            lost,
            noop: false,
        }
    }

    /// Accept submissions without handing them to the kernel. Buffers are
    /// not stamped, so nothing ever waits on dropped work.
    pub fn with_noop(mut self, noop: bool) -> Self {
        self.noop = noop;
        self
    }

    /// Whether the device has been lost
    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::DeviceLost) = result {
            if !self.lost.swap(true, Ordering::AcqRel) {
                log::error!("fd {}: GPU device lost, all further submissions fail", self.fd);
            }
        }
        result
    }

    /// Submit now on the calling thread. Returns the sequence number the
    /// submission's buffers were stamped with.
    pub fn submit_now(&self, cs: &Submission) -> Result<SeqNo> {
        if self.is_lost() {
            return Err(Error::DeviceLost);
        }
        let queue = cs.queue();
        if self.noop {
            log::trace!("{:?}: dropping submission of {} dwords", queue, cs.commands().len());
            return Ok(self.rings.latest_seq_no(queue));
        }

        let mut deps: Vec<FenceRef> = cs.dependencies().to_vec();
        if let Some(fence) = self.observe(self.rings.context_dependency(queue, cs.context()))? {
            deps.push(fence);
        }
        let cross = self.observe(
            self.rings
                .cross_queue_dependencies(queue, cs.buffers().iter().map(|bo| bo.fences())),
        )?;
        deps.extend(cross);
        deps.retain(|fence| !fence.is_known_signaled());

        let mut dependencies: Vec<FenceId> = deps.iter().map(|fence| fence.id()).collect();
        dependencies.sort_unstable_by_key(|id| id.0);
        dependencies.dedup();

        // Slab entries share their backing's handle
        let mut buffers: Vec<KmsHandle> = cs.buffers().iter().map(|bo| bo.submit_handle()).collect();
        buffers.sort_unstable();
        buffers.dedup();

        let request = SubmitRequest {
            queue,
            context: cs.context(),
            commands: cs.commands(),
            buffers: &buffers,
            dependencies: &dependencies,
        };
        let id = match self.observe(self.kernel.submit(self.fd, &request)) {
            Ok(id) => id,
            Err(Error::DeviceLost) => return Err(Error::DeviceLost),
            Err(err) => {
                log::warn!("{:?}: kernel rejected submission: {}", queue, err);
                return Err(Error::SubmissionFailed);
            }
        };

        let fence = Fence::new(self.kernel.clone(), id, queue, cs.context());
        let seq = self.observe(self.rings.record_submission_with(queue, fence, |seq| {
            for bo in cs.buffers() {
                bo.fences().lock().set(queue, seq);
            }
        }))?;

        self.stats.inc_submissions(queue);
        log::trace!(
            "{:?}: seq {} -> {:?}, {} buffers, {} deps",
            queue,
            seq.raw(),
            id,
            buffers.len(),
            dependencies.len()
        );
        Ok(seq)
    }

    #[inline]
    pub fn rings(&self) -> &Arc<FenceRings> {
        &self.rings
    }
}

impl fmt::Debug for Submitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submitter")
            .field("fd", &self.fd)
            .field("lost", &self.is_lost())
            .field("noop", &self.noop)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::{BoFlags, ContextId, Domain, QueueKind, WinsysConfig};
    use cinder_mem::{Bo, BufferManager};
    use cinder_test_framework::StubKernel;

    struct Harness {
        stub: Arc<StubKernel>,
        mgr: Arc<BufferManager>,
        submitter: Submitter,
    }

    impl Harness {
        fn new() -> Self {
            let stub = Arc::new(StubKernel::new());
            let fd = stub.open("/dev/dri/renderD128");
            let mgr = BufferManager::standalone(stub.clone(), fd, WinsysConfig::default()).unwrap();
            let submitter = Submitter::new(
                stub.clone(),
                fd,
                mgr.rings().clone(),
                mgr.stats().clone(),
                Arc::new(AtomicBool::new(false)),
            );
            Self {
                stub,
                mgr,
                submitter,
            }
        }

        fn create(&self, size: u64) -> Bo {
            self.mgr
                .create(size, 4096, Domain::Gtt, BoFlags::empty())
                .unwrap()
        }

        fn submit(&self, queue: QueueKind, context: u32, bos: &[&Bo]) -> Result<SeqNo> {
            let mut cs = Submission::new(queue, ContextId(context));
            cs.emit(&[0xFFFF_1000]);
            for bo in bos {
                cs.add_buffer(bo);
            }
            self.submitter.submit_now(&cs)
        }
    }

    #[test]
    fn test_submit_stamps_buffers() {
        let h = Harness::new();
        let bo = h.create(1 << 20);
        let seq = h.submit(QueueKind::Gfx, 1, &[&bo]).unwrap();

        assert_eq!(seq, SeqNo::new(1));
        assert_eq!(bo.fences().lock().get(QueueKind::Gfx), Some(seq));
        assert!(h.mgr.is_busy(&bo).unwrap());
        let recorded = h.stub.submissions();
        assert_eq!(recorded[0].buffers, [bo.kms_handle().unwrap()]);
        assert_eq!(h.mgr.stats().snapshot().num_gfx_ibs, 1);
    }

    #[test]
    fn test_slab_entries_share_backing_handle() {
        let h = Harness::new();
        let a = h.create(4096);
        let b = h.create(4096);
        assert!(a.is_slab() && b.is_slab());

        h.submit(QueueKind::Compute, 1, &[&a, &b]).unwrap();
        let recorded = h.stub.submissions();
        assert_eq!(recorded[0].buffers.len(), 1);
        assert!(h.mgr.is_busy(&a).unwrap());
        assert!(h.mgr.is_busy(&b).unwrap());
    }

    #[test]
    fn test_cross_queue_dependency() {
        let h = Harness::new();
        let bo = h.create(1 << 20);
        h.submit(QueueKind::Gfx, 1, &[&bo]).unwrap();
        h.submit(QueueKind::Sdma, 1, &[&bo]).unwrap();

        let recorded = h.stub.submissions();
        assert_eq!(recorded[1].dependencies, [recorded[0].fence]);
        assert_eq!(h.mgr.stats().snapshot().num_sdma_ibs, 1);
    }

    #[test]
    fn test_retired_work_adds_no_dependency() {
        let h = Harness::new();
        let bo = h.create(1 << 20);
        h.submit(QueueKind::Gfx, 1, &[&bo]).unwrap();
        h.stub.signal_all();
        h.submit(QueueKind::Sdma, 1, &[&bo]).unwrap();

        assert!(h.stub.submissions()[1].dependencies.is_empty());
    }

    #[test]
    fn test_context_switch_dependency() {
        let h = Harness::new();
        h.submit(QueueKind::Gfx, 1, &[]).unwrap();
        h.submit(QueueKind::Gfx, 1, &[]).unwrap();
        h.submit(QueueKind::Gfx, 2, &[]).unwrap();

        let recorded = h.stub.submissions();
        assert!(recorded[1].dependencies.is_empty());
        assert_eq!(recorded[2].dependencies, [recorded[1].fence]);
    }

    #[test]
    fn test_device_lost_is_sticky() {
        let h = Harness::new();
        h.stub.inject_device_lost();

        assert_eq!(h.submit(QueueKind::Gfx, 1, &[]), Err(Error::DeviceLost));
        assert!(h.submitter.is_lost());
        assert_eq!(h.submit(QueueKind::Gfx, 1, &[]), Err(Error::DeviceLost));
        assert_eq!(h.stub.counters().submits, 0);
    }

    #[test]
    fn test_rejected_submission() {
        let h = Harness::new();
        let bo = h.create(1 << 20);
        let mut cs = Submission::new(QueueKind::Gfx, ContextId(1));
        cs.add_buffer(&bo);
        // Destroying the buffer's handle behind the allocator's back
        h.stub.gem_close(h.mgr.fd(), bo.kms_handle().unwrap());

        assert_eq!(h.submitter.submit_now(&cs), Err(Error::SubmissionFailed));
        assert!(!h.submitter.is_lost());
        assert_eq!(bo.fences().lock().get(QueueKind::Gfx), None);
    }

    #[test]
    fn test_noop_skips_kernel() {
        let mut h = Harness::new();
        let bo = h.create(1 << 20);
        h.submit(QueueKind::Gfx, 1, &[&bo]).unwrap();
        h.submitter = Submitter::new(
            h.stub.clone(),
            h.mgr.fd(),
            h.mgr.rings().clone(),
            h.mgr.stats().clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .with_noop(true);

        let other = h.create(1 << 20);
        assert_eq!(h.submit(QueueKind::Gfx, 1, &[&other]), Ok(SeqNo::new(1)));
        assert_eq!(h.stub.counters().submits, 1);
        assert!(other.fences().lock().is_empty());
        assert_eq!(h.mgr.stats().snapshot().num_gfx_ibs, 1);
    }
}
