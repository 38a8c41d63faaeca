//! # CINDER Winsys
//!
//! Devices and the file descriptions that share them.
//!
//! ```text
//!   DeviceRegistry ── path ──▶ Device ──▶ BufferManager, FenceRings, CsQueue
//!                                │  ▲
//!                   Weak list    │  │ Arc
//!                                ▼  │
//!                     FrontEnd (fd A)   FrontEnd (fd B)
//!                     handle table      handle table
//! ```
//!
//! Kernel buffer handles are scoped to a file description, not to a device.
//! Every kernel allocation has one canonical [`Bo`](cinder_mem::Bo) per
//! device; each front-end gets its own handle for it on demand.

pub mod config;
pub mod device;
pub mod export;
pub mod frontend;
pub mod registry;

#[cfg(test)]
mod tests;

pub use config::WinsysConfigExt;
pub use device::Device;
pub use frontend::FrontEnd;
pub use registry::DeviceRegistry;
