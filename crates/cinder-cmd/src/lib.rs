//! # CINDER Command Submission
//!
//! Hands command streams to the kernel and records their fences.
//!
//! ```text
//!   app thread                       worker thread "cinder-cs"
//!   ──────────                       ─────────────────────────
//!   CsQueue::submit ──▶ [ bounded queue ] ──▶ Submitter::submit_now
//!        │                                        │ dependencies
//!        ▼                                        │ kernel submit
//!   SubmitTicket ◀──────── result ────────────────┘ fence ring + buffer stamps
//! ```
//!
//! Buffers referenced by a queued submission are marked pending until the
//! worker has stamped them, so a map can tell it must flush first.

pub mod queue;
pub mod submission;
pub mod submitter;

pub use queue::{CsQueue, SubmitTicket};
pub use submission::Submission;
pub use submitter::Submitter;
