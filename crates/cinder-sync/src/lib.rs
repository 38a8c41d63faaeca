//! # CINDER Sync
//!
//! Tracks when hardware queues are done with buffers.
//!
//! ## Design
//!
//! Storing a fence per buffer per submission is expensive. Instead each
//! queue hands out a monotonically increasing [`SeqNo`] per submission and
//! remembers the fences of its last [`FENCE_RING_SIZE`] submissions in a
//! ring. A buffer records only the sequence number of its last use on each
//! queue.
//!
//! ```text
//!   queue Gfx            latest = 41
//!   ┌────┬────┬────┬─────┬────┬────┐
//!   │ 32 │ 33 │ 34 │ ... │ 40 │ 41 │   fences of seq 10..=41
//!   └────┴────┴────┴─────┴────┴────┘
//!
//!   buffer.seq[Gfx] = 7   ──▶ 41 - 7 >= 32  ──▶ idle, no fence needed
//!   buffer.seq[Gfx] = 38  ──▶ in window     ──▶ query ring slot 38 % 32
//! ```
//!
//! Overwriting a ring slot first waits for the fence it holds, so "outside
//! the window" always means "finished".
//!
//! [`SeqNo`]: cinder_core::SeqNo
//! [`FENCE_RING_SIZE`]: cinder_core::FENCE_RING_SIZE

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod fence;
pub mod ring;
pub mod seqno;

pub use fence::{Fence, FenceRef};
pub use ring::{BusyFence, FenceRings};
pub use seqno::{BufferFences, SeqNoFences};
