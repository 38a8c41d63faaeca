//! # CINDER Memory
//!
//! Buffer objects and the allocator that hands them out.
//!
//! - [`Bo`] / [`BoInner`]: client references and shared buffer state
//! - [`BufferManager`]: slab sub-allocation, the recycling cache, deferred
//!   destruction and CPU mapping
//! - [`VmTimeline`]: ordered GPU page-table updates

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod allocator;
pub mod bo;
mod cache;
mod slab;
pub mod vm;

pub use allocator::BufferManager;
pub use bo::{Bo, BoInner, BoKind, BoReleaser, RealBo, SlabEntry};
pub use vm::VmTimeline;
