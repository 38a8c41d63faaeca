//! # CINDER Test Framework
//!
//! In-memory DRM kernel used by the test suites of every CINDER crate.
//!
//! [`StubKernel`] models what the winsys depends on:
//!
//! - GEM handles scoped per open file description, drawn from one global
//!   counter so a handle leaked into the wrong description never resolves
//! - prime export/import with per-description handle deduplication
//! - fences that stay pending until somebody waits on them (or
//!   [`StubKernel::signal_all`] is called)
//! - failure injection: memory limit, failing allocations and imports,
//!   device loss, hung fences
//! - a manually advanced monotonic clock

#![warn(missing_docs)]

mod stub;

pub use stub::{KernelCounters, RecordedSubmit, StubKernel};
