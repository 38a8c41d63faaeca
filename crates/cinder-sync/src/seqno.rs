//! # Buffer Sequence Numbers
//!
//! Per-buffer record of the last submission on each queue that used it.

use cinder_core::{MAX_QUEUES, QueueKind, SeqNo};
use static_assertions::const_assert;

// The valid mask is a u8
const_assert!(MAX_QUEUES <= 8);

/// Fence state cell of a buffer. Only touched with the ring lock held.
pub type BufferFences = spin::Mutex<SeqNoFences>;

/// Last-use sequence number per queue, with a valid bit per queue.
///
/// An unset valid bit means the buffer is idle on that queue regardless of
/// the stored number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqNoFences {
    seq_no: [SeqNo; MAX_QUEUES],
    valid_mask: u8,
}

impl SeqNoFences {
    /// No queue has used the buffer
    pub const fn new() -> Self {
        Self {
            seq_no: [SeqNo::new(0); MAX_QUEUES],
            valid_mask: 0,
        }
    }

    /// Sequence number on `queue`, if valid
    #[inline]
    pub fn get(&self, queue: QueueKind) -> Option<SeqNo> {
        if self.valid_mask & queue.mask_bit() != 0 {
            Some(self.seq_no[queue.index()])
        } else {
            None
        }
    }

    /// Record a use on `queue`
    #[inline]
    pub fn set(&mut self, queue: QueueKind, seq: SeqNo) {
        self.seq_no[queue.index()] = seq;
        self.valid_mask |= queue.mask_bit();
    }

    /// Mark the buffer idle on `queue`
    #[inline]
    pub fn clear(&mut self, queue: QueueKind) {
        self.valid_mask &= !queue.mask_bit();
    }

    /// Mark the buffer idle everywhere
    #[inline]
    pub fn clear_all(&mut self) {
        self.valid_mask = 0;
    }

    /// No queue may still be using the buffer
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.valid_mask == 0
    }

    /// Raw valid mask
    #[inline]
    pub fn valid_mask(&self) -> u8 {
        self.valid_mask
    }

    /// Valid `(queue, seq)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (QueueKind, SeqNo)> + '_ {
        QueueKind::ALL
            .iter()
            .filter_map(move |q| self.get(*q).map(|seq| (*q, seq)))
    }
}
