//! # CINDER Error Handling
//!
//! Error types for the buffer-management and submission stack.
//!
//! Error handling in CINDER follows these principles:
//! - Errors are typed and categorized
//! - "Still busy" and "device gone" are distinct conditions
//! - `DeviceLost` is fatal and never retried

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// CINDER Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// CINDER unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation not supported for this object
    NotSupported,
    /// Resource is busy and the caller asked not to block
    Busy,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Kernel and cache allocation both failed
    OutOfMemory,
    /// CPU mapping failed
    MappingFailed,

    // =========================================================================
    // Sharing Errors
    // =========================================================================
    /// Shared-handle resolution failed
    ImportFailed,
    /// Exporting a buffer to a portable handle failed
    ExportFailed,

    // =========================================================================
    // Synchronization Errors
    // =========================================================================
    /// Wait exceeded its bound while the work was still pending
    WaitTimeout,
    /// Kernel wait call failed
    WaitFailed,

    // =========================================================================
    // Submission Errors
    // =========================================================================
    /// Kernel rejected the submission
    SubmissionFailed,
    /// Submission worker is no longer accepting work
    QueueClosed,

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// GPU was reset or removed; every further operation fails
    DeviceLost,
    /// Raw kernel error number
    Kernel(i32),
}

impl Error {
    /// Check if this error poisons the device
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }

    /// `replacement`, unless this error poisons the device
    #[inline]
    pub const fn unless_fatal(self, replacement: Error) -> Error {
        if self.is_fatal() { self } else { replacement }
    }

    /// Check if this error means "try again later"
    #[inline]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Busy | Self::WaitTimeout)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::Busy => write!(f, "resource busy"),

            // Memory
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::MappingFailed => write!(f, "memory mapping failed"),

            // Sharing
            Self::ImportFailed => write!(f, "buffer import failed"),
            Self::ExportFailed => write!(f, "buffer export failed"),

            // Synchronization
            Self::WaitTimeout => write!(f, "wait timed out"),
            Self::WaitFailed => write!(f, "wait failed"),

            // Submission
            Self::SubmissionFailed => write!(f, "submission failed"),
            Self::QueueClosed => write!(f, "submission queue closed"),

            // Device
            Self::DeviceLost => write!(f, "device lost"),
            Self::Kernel(errno) => write!(f, "kernel error {}", errno),
        }
    }
}

impl core::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_device_lost_is_fatal() {
        assert!(Error::DeviceLost.is_fatal());
        assert!(!Error::WaitTimeout.is_fatal());
        assert!(!Error::OutOfMemory.is_fatal());
    }

    #[test]
    fn test_busy_conditions() {
        assert!(Error::Busy.is_busy());
        assert!(Error::WaitTimeout.is_busy());
        assert!(!Error::WaitFailed.is_busy());
    }

    #[test]
    fn test_device_lost_survives_remapping() {
        assert_eq!(Error::DeviceLost.unless_fatal(Error::ImportFailed), Error::DeviceLost);
        assert_eq!(Error::Kernel(-4).unless_fatal(Error::WaitFailed), Error::WaitFailed);
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::Kernel(-12).to_string(), "kernel error -12");
        assert_eq!(Error::ImportFailed.to_string(), "buffer import failed");
    }
}
