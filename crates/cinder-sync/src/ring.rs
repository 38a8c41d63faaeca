//! # Per-Queue Fence Rings
//!
//! One ring of the last [`FENCE_RING_SIZE`] submission fences per hardware
//! queue, all behind a single lock (the "fence lock"). Buffer fence cells are
//! only read or written with that lock held; the cell lock nests inside it.
//!
//! No kernel wait ever happens with the fence lock held: waiters collect the
//! fences they need, drop the lock, wait, then re-validate.

use alloc::sync::Arc;
use core::fmt;

use arrayvec::ArrayVec;
use cinder_core::{
    ContextId, Error, FENCE_RING_SIZE, KernelInterface, MAX_QUEUES, QueueKind, Result, SeqNo,
    WinsysStats,
};

use crate::fence::FenceRef;
use crate::seqno::BufferFences;

const RING: usize = FENCE_RING_SIZE as usize;

// =============================================================================
// QUEUE STATE
// =============================================================================

struct QueueState {
    latest: SeqNo,
    fences: [Option<FenceRef>; RING],
    last_context: Option<ContextId>,
}

impl QueueState {
    fn new(initial: SeqNo) -> Self {
        Self {
            latest: initial,
            fences: core::array::from_fn(|_| None),
            last_context: None,
        }
    }

    #[inline]
    fn in_window(&self, seq: SeqNo) -> bool {
        self.latest.distance_from(seq) < FENCE_RING_SIZE
    }

    /// Fence of `seq` if it may still be pending
    #[inline]
    fn fence_for(&self, seq: SeqNo) -> Option<&FenceRef> {
        if self.in_window(seq) {
            self.fences[seq.ring_slot()].as_ref()
        } else {
            None
        }
    }

    #[inline]
    fn latest_fence(&self) -> Option<&FenceRef> {
        self.fences[self.latest.ring_slot()].as_ref()
    }
}

/// A fence a buffer is still waiting on
#[derive(Debug, Clone)]
pub struct BusyFence {
    /// Queue the fence belongs to
    pub queue: QueueKind,
    /// Sequence number the buffer was stamped with
    pub seq: SeqNo,
    /// The fence itself
    pub fence: FenceRef,
}

// =============================================================================
// FENCE RINGS
// =============================================================================

/// Fence rings of every queue of a device
pub struct FenceRings {
    kernel: Arc<dyn KernelInterface>,
    stats: Arc<WinsysStats>,
    queues: spin::Mutex<[QueueState; MAX_QUEUES]>,
}

impl FenceRings {
    /// Empty rings; the first submission on each queue gets sequence number 1
    pub fn new(kernel: Arc<dyn KernelInterface>, stats: Arc<WinsysStats>) -> Self {
        Self::with_initial_seq(kernel, stats, SeqNo::new(0))
    }

    /// Rings whose counters start at `initial`
    pub fn with_initial_seq(
        kernel: Arc<dyn KernelInterface>,
        stats: Arc<WinsysStats>,
        initial: SeqNo,
    ) -> Self {
        Self {
            kernel,
            stats,
            queues: spin::Mutex::new(core::array::from_fn(|_| QueueState::new(initial))),
        }
    }

    /// Latest sequence number handed out on `queue`
    pub fn latest_seq_no(&self, queue: QueueKind) -> SeqNo {
        self.queues.lock()[queue.index()].latest
    }

    /// Fence of the latest submission on `queue`
    pub fn latest_fence(&self, queue: QueueKind) -> Option<FenceRef> {
        self.queues.lock()[queue.index()].latest_fence().cloned()
    }

    /// Whether a use stamped `seq` on `queue` has left the window
    ///
    /// `false` only means "may still be busy".
    pub fn is_idle(&self, queue: QueueKind, seq: SeqNo) -> bool {
        !self.queues.lock()[queue.index()].in_window(seq)
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Store `fence` as the next sequence number of `queue`
    pub fn record_submission(&self, queue: QueueKind, fence: FenceRef) -> Result<SeqNo> {
        self.record_submission_with(queue, fence, |_| {})
    }

    /// Store `fence` and run `stamp` with its sequence number while the fence
    /// lock is held, so buffers never observe a number without its fence.
    ///
    /// If the slot to overwrite still holds a pending fence, that fence is
    /// waited on first with the lock released.
    pub fn record_submission_with<F>(
        &self,
        queue: QueueKind,
        fence: FenceRef,
        stamp: F,
    ) -> Result<SeqNo>
    where
        F: FnOnce(SeqNo),
    {
        debug_assert_eq!(fence.queue(), queue);
        loop {
            let evicted = {
                let mut queues = self.queues.lock();
                let state = &mut queues[queue.index()];
                let next = state.latest.next();
                let slot = next.ring_slot();
                match state.fences[slot].as_ref() {
                    Some(old) if !old.is_signaled()? => old.clone(),
                    _ => {
                        state.last_context = Some(fence.context());
                        state.fences[slot] = Some(fence);
                        state.latest = next;
                        stamp(next);
                        return Ok(next);
                    }
                }
            };

            log::trace!(
                "{:?}: ring full, waiting for {:?} before reusing its slot",
                queue,
                evicted.id()
            );
            self.stats.inc_ring_eviction_waits();
            if !evicted.wait(u64::MAX)? {
                log::warn!("{:?}: unbounded wait on {:?} returned early", queue, evicted.id());
                return Err(Error::WaitTimeout);
            }
        }
    }

    // =========================================================================
    // Buffer queries
    // =========================================================================

    /// Non-blocking idle check. Clears the valid bit of every queue found
    /// idle.
    pub fn poll_idle(&self, buffer: &BufferFences) -> Result<bool> {
        let queues = self.queues.lock();
        let mut cell = buffer.lock();
        let used: ArrayVec<(QueueKind, SeqNo), MAX_QUEUES> = cell.iter().collect();

        let mut idle = true;
        for (queue, seq) in used {
            match queues[queue.index()].fence_for(seq) {
                Some(fence) if !fence.is_signaled()? => idle = false,
                _ => cell.clear(queue),
            }
        }
        Ok(idle)
    }

    /// Whether the memory behind `buffer` may be handed out again. A lost
    /// device never signals again, so its buffers count as idle; any other
    /// query failure keeps the buffer busy.
    pub fn is_reusable(&self, buffer: &BufferFences) -> bool {
        match self.poll_idle(buffer) {
            Ok(idle) => idle,
            Err(Error::DeviceLost) => true,
            Err(err) => {
                log::warn!("fence query failed, keeping buffer busy: {}", err);
                false
            }
        }
    }

    /// Fences `buffer` may still be waiting on. Queues known idle are
    /// cleared; no kernel call is made.
    pub fn busy_fences(&self, buffer: &BufferFences) -> ArrayVec<BusyFence, MAX_QUEUES> {
        let queues = self.queues.lock();
        let mut cell = buffer.lock();
        let used: ArrayVec<(QueueKind, SeqNo), MAX_QUEUES> = cell.iter().collect();

        let mut busy = ArrayVec::new();
        for (queue, seq) in used {
            match queues[queue.index()].fence_for(seq) {
                Some(fence) if !fence.is_known_signaled() => busy.push(BusyFence {
                    queue,
                    seq,
                    fence: fence.clone(),
                }),
                _ => cell.clear(queue),
            }
        }
        busy
    }

    /// Block until `buffer` is idle on every queue or `timeout_ns` elapses.
    ///
    /// Returns `Ok(false)` on timeout. Valid bits are cleared only for queues
    /// whose sequence number did not move while waiting.
    pub fn wait_idle(&self, buffer: &BufferFences, timeout_ns: u64) -> Result<bool> {
        let busy = self.busy_fences(buffer);
        if busy.is_empty() {
            return Ok(true);
        }

        let start = self.kernel.now_ns();
        for entry in &busy {
            let elapsed = self.kernel.now_ns().saturating_sub(start);
            let remaining = timeout_ns.saturating_sub(elapsed);
            if !entry.fence.wait(remaining)? {
                self.stats
                    .add_buffer_wait_time(self.kernel.now_ns().saturating_sub(start));
                return Ok(false);
            }
        }

        {
            let _queues = self.queues.lock();
            let mut cell = buffer.lock();
            for entry in &busy {
                if cell.get(entry.queue) == Some(entry.seq) {
                    cell.clear(entry.queue);
                }
            }
        }
        self.stats
            .add_buffer_wait_time(self.kernel.now_ns().saturating_sub(start));
        Ok(true)
    }

    // =========================================================================
    // Submission dependencies
    // =========================================================================

    /// Latest fence of `queue` if it was submitted by a different context
    /// and is still pending. Work from several contexts sharing one queue is
    /// serialized through this dependency.
    pub fn context_dependency(
        &self,
        queue: QueueKind,
        context: ContextId,
    ) -> Result<Option<FenceRef>> {
        let queues = self.queues.lock();
        let state = &queues[queue.index()];
        match (state.last_context, state.latest_fence()) {
            (Some(last), Some(fence)) if last != context && !fence.is_signaled()? => {
                Ok(Some(fence.clone()))
            }
            _ => Ok(None),
        }
    }

    /// Pending fences on queues other than `queue` that any of `buffers` is
    /// still in use on. One fence per queue: the newest, since queues retire
    /// in order.
    pub fn cross_queue_dependencies<'a, I>(
        &self,
        queue: QueueKind,
        buffers: I,
    ) -> Result<ArrayVec<FenceRef, MAX_QUEUES>>
    where
        I: IntoIterator<Item = &'a BufferFences>,
    {
        let queues = self.queues.lock();
        let mut newest: [Option<SeqNo>; MAX_QUEUES] = [None; MAX_QUEUES];

        for buffer in buffers {
            let cell = buffer.lock();
            for (other, seq) in cell.iter() {
                let state = &queues[other.index()];
                if other == queue || !state.in_window(seq) {
                    continue;
                }
                let slot = &mut newest[other.index()];
                let is_newer = match *slot {
                    Some(current) => {
                        state.latest.distance_from(seq) < state.latest.distance_from(current)
                    }
                    None => true,
                };
                if is_newer {
                    *slot = Some(seq);
                }
            }
        }

        let mut deps = ArrayVec::new();
        for (index, seq) in newest.iter().enumerate() {
            let Some(seq) = seq else { continue };
            if let Some(fence) = queues[index].fence_for(*seq) {
                if !fence.is_signaled()? {
                    deps.push(fence.clone());
                }
            }
        }
        Ok(deps)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Wait for the latest submission of every queue
    pub fn wait_all(&self) -> Result<()> {
        let latest: ArrayVec<FenceRef, MAX_QUEUES> = {
            let queues = self.queues.lock();
            queues
                .iter()
                .filter_map(|q| q.latest_fence().cloned())
                .collect()
        };
        for fence in latest {
            fence.wait(u64::MAX)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FenceRings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues = self.queues.lock();
        let mut list = f.debug_map();
        for kind in QueueKind::ALL {
            list.entry(&kind, &queues[kind.index()].latest);
        }
        list.finish()
    }
}
