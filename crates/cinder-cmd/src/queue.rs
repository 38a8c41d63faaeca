//! # Submission Worker
//!
//! One thread per device drains a bounded queue of submissions. Callers
//! block only when the queue is full or when they wait on a ticket.

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};

use cinder_core::{Error, Result, SeqNo};

use crate::submission::{Queued, Submission};
use crate::submitter::Submitter;

enum Job {
    Submit {
        cs: Queued,
        reply: mpsc::Sender<Result<SeqNo>>,
    },
    Flush(mpsc::Sender<()>),
}

/// Completion handle of a queued submission
#[derive(Debug)]
pub struct SubmitTicket {
    reply: Receiver<Result<SeqNo>>,
}

impl SubmitTicket {
    /// Block until the worker has submitted the work
    pub fn wait(self) -> Result<SeqNo> {
        self.reply.recv().map_err(|_| Error::QueueClosed)?
    }

    /// Result if the worker is done with it. The result is delivered once.
    pub fn try_wait(&self) -> Option<Result<SeqNo>> {
        match self.reply.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::QueueClosed)),
        }
    }
}

/// Bounded submission queue with its worker thread
pub struct CsQueue {
    submitter: Arc<Submitter>,
    sender: spin::Mutex<Option<SyncSender<Job>>>,
    worker: spin::Mutex<Option<JoinHandle<()>>>,
}

impl CsQueue {
    /// Start the worker. At most `depth` submissions wait in the queue.
    pub fn new(submitter: Arc<Submitter>, depth: usize) -> Result<Self> {
        let (sender, jobs) = mpsc::sync_channel(depth.max(1));
        let worker_submitter = submitter.clone();
        let worker = thread::Builder::new()
            .name("cinder-cs".into())
            .spawn(move || run(&worker_submitter, jobs))
            .map_err(|err| {
                log::error!("failed to spawn submission worker: {}", err);
                Error::OutOfMemory
            })?;

        Ok(Self {
            submitter,
            sender: spin::Mutex::new(Some(sender)),
            worker: spin::Mutex::new(Some(worker)),
        })
    }

    fn send(&self, job: Job) -> Result<()> {
        // Clone out of the lock; a full queue blocks in send
        let sender = self.sender.lock().clone().ok_or(Error::QueueClosed)?;
        sender.send(job).map_err(|_| Error::QueueClosed)
    }

    /// Queue a submission
    pub fn submit(&self, cs: Submission) -> Result<SubmitTicket> {
        if self.submitter.is_lost() {
            return Err(Error::DeviceLost);
        }
        let (reply, ticket) = mpsc::channel();
        self.send(Job::Submit {
            cs: Queued::new(cs),
            reply,
        })?;
        Ok(SubmitTicket { reply: ticket })
    }

    /// Queue a submission and wait for it to reach the kernel
    pub fn submit_sync(&self, cs: Submission) -> Result<SeqNo> {
        self.submit(cs)?.wait()
    }

    /// Wait until everything queued so far has been submitted
    pub fn flush(&self) -> Result<()> {
        let (reply, done) = mpsc::channel();
        self.send(Job::Flush(reply))?;
        done.recv().map_err(|_| Error::QueueClosed)
    }

    /// Drain the queue and stop the worker. Later submissions fail with
    /// [`Error::QueueClosed`].
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            log::error!("submission worker panicked");
        }
    }

    #[inline]
    pub fn submitter(&self) -> &Arc<Submitter> {
        &self.submitter
    }
}

fn run(submitter: &Submitter, jobs: Receiver<Job>) {
    for job in jobs {
        match job {
            Job::Submit { cs, reply } => {
                let result = submitter.submit_now(cs.submission());
                // Clear the pending marks before the ticket resolves
                drop(cs);
                let _ = reply.send(result);
            }
            Job::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
    log::debug!("submission worker stopped");
}

impl Drop for CsQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for CsQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsQueue")
            .field("open", &self.sender.lock().is_some())
            .field("submitter", &self.submitter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use cinder_core::{BoFlags, ContextId, Domain, QueueKind, WinsysConfig};
    use cinder_mem::BufferManager;
    use cinder_test_framework::StubKernel;

    fn setup(depth: usize) -> (Arc<StubKernel>, Arc<BufferManager>, CsQueue) {
        let stub = Arc::new(StubKernel::new());
        let fd = stub.open("/dev/dri/renderD128");
        let mgr = BufferManager::standalone(stub.clone(), fd, WinsysConfig::default()).unwrap();
        let submitter = Arc::new(Submitter::new(
            stub.clone(),
            fd,
            mgr.rings().clone(),
            mgr.stats().clone(),
            Arc::new(AtomicBool::new(false)),
        ));
        let queue = CsQueue::new(submitter, depth).unwrap();
        (stub, mgr, queue)
    }

    #[test]
    fn test_ticket_resolves_after_submit() {
        let (stub, mgr, queue) = setup(8);
        let bo = mgr.create(4096, 4096, Domain::Vram, BoFlags::empty()).unwrap();
        let mut cs = Submission::new(QueueKind::Gfx, ContextId(1));
        cs.add_buffer(&bo);

        let ticket = queue.submit(cs).unwrap();
        assert_eq!(ticket.wait(), Ok(SeqNo::new(1)));
        assert_eq!(bo.pending_submissions(), 0);
        assert!(mgr.is_busy(&bo).unwrap());
        assert_eq!(stub.counters().submits, 1);
    }

    #[test]
    fn test_submissions_keep_order() {
        let (stub, _mgr, queue) = setup(2);
        let tickets: Vec<SubmitTicket> = (0..20)
            .map(|_| {
                queue
                    .submit(Submission::new(QueueKind::Compute, ContextId(1)))
                    .unwrap()
            })
            .collect();
        queue.flush().unwrap();

        for (i, ticket) in tickets.into_iter().enumerate() {
            assert_eq!(ticket.try_wait(), Some(Ok(SeqNo::new(i as u32 + 1))));
        }
        assert_eq!(stub.counters().submits, 20);
    }

    #[test]
    fn test_submit_sync() {
        let (_stub, mgr, queue) = setup(8);
        let seq = queue
            .submit_sync(Submission::new(QueueKind::Sdma, ContextId(3)))
            .unwrap();
        assert_eq!(seq, SeqNo::new(1));
        assert_eq!(mgr.stats().snapshot().num_sdma_ibs, 1);
    }

    #[test]
    fn test_shutdown_closes_queue() {
        let (stub, _mgr, queue) = setup(8);
        let ticket = queue
            .submit(Submission::new(QueueKind::Gfx, ContextId(1)))
            .unwrap();
        queue.shutdown();

        // Work queued before shutdown is still submitted
        assert!(ticket.wait().is_ok());
        assert_eq!(stub.counters().submits, 1);
        assert_eq!(
            queue
                .submit(Submission::new(QueueKind::Gfx, ContextId(1)))
                .err(),
            Some(Error::QueueClosed)
        );
        assert_eq!(queue.flush(), Err(Error::QueueClosed));
    }

    #[test]
    fn test_lost_device_fails_fast() {
        let (stub, _mgr, queue) = setup(8);
        stub.inject_device_lost();
        let ticket = queue
            .submit(Submission::new(QueueKind::Gfx, ContextId(1)))
            .unwrap();
        assert_eq!(ticket.wait(), Err(Error::DeviceLost));

        assert_eq!(
            queue
                .submit(Submission::new(QueueKind::Gfx, ContextId(1)))
                .err(),
            Some(Error::DeviceLost)
        );
        assert_eq!(stub.counters().submits, 0);
    }
}
