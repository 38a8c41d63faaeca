//! # CINDER Core
//!
//! Foundational types shared by every layer of the winsys.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      cinder-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Kernel    │  │   Types     │  │  Error / Config /   │  │
//! │  │  Interface  │  │ (SeqNo,     │  │  Statistics         │  │
//! │  │  (ioctls)   │  │  Domain)    │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything above this crate talks to the kernel exclusively through
//! [`KernelInterface`], which keeps the allocator, fence ring and export
//! table testable against an in-memory kernel.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod error;
pub mod kernel;
pub mod stats;
pub mod types;

// Re-exports for convenience
pub use config::{CacheConfig, SlabConfig, WinsysConfig};
pub use error::{Error, Result};
pub use kernel::{GemCreateInfo, ImportedBo, KernelInterface, SubmitRequest, VmOp};
pub use stats::{StatsSnapshot, WinsysStats};
pub use types::*;
