//! # CINDER Core Types
//!
//! Fundamental type definitions used across the winsys.
//!
//! These types provide:
//! - Strong typing for kernel handles (which are scoped per file description)
//! - Wraparound-safe queue sequence numbers
//! - Memory domains and buffer flags

use alloc::string::String;
use core::fmt;

// =============================================================================
// ARCHITECTURAL CONSTANTS
// =============================================================================

/// Maximum number of hardware queues tracked per device.
pub const MAX_QUEUES: usize = 6;

/// Fences remembered per queue. Submitting a new fence waits for the one it
/// evicts, so every sequence number older than the ring is known to be idle.
pub const FENCE_RING_SIZE: u32 = 32;

/// Page size used for kernel allocations.
pub const PAGE_SIZE: u64 = 4096;

static_assertions::const_assert!(FENCE_RING_SIZE.is_power_of_two());
static_assertions::const_assert!(PAGE_SIZE.is_power_of_two());

/// Round `value` up to a power-of-two `alignment`.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// [`align_up`], or `None` when the rounded value does not fit in a `u64`.
#[inline]
pub const fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    let mask = alignment - 1;
    match value.checked_add(mask) {
        Some(sum) => Some(sum & !mask),
        None => None,
    }
}

// =============================================================================
// SEQUENCE NUMBERS
// =============================================================================

/// Driver-private per-queue submission sequence number.
///
/// Comparisons are modular: only the distance from the queue's latest
/// sequence number matters, so the counter may wrap freely. A 32-bit counter
/// keeps a wrap during any buffer's lifetime astronomically unlikely.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct SeqNo(u32);

impl SeqNo {
    /// Create a sequence number
    #[inline]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw counter value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The sequence number following this one
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Number of submissions between `older` and `self`
    #[inline]
    pub const fn distance_from(self, older: SeqNo) -> u32 {
        self.0.wrapping_sub(older.0)
    }

    /// Ring slot holding the fence of this sequence number
    #[inline]
    pub const fn ring_slot(self) -> usize {
        (self.0 % FENCE_RING_SIZE) as usize
    }
}

impl fmt::Debug for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNo({})", self.0)
    }
}

// =============================================================================
// QUEUES
// =============================================================================

/// Hardware queue (one per engine type)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum QueueKind {
    /// Graphics
    Gfx         = 0,
    /// Asynchronous compute
    Compute     = 1,
    /// DMA engine
    Sdma        = 2,
    /// Video decode
    VideoDecode = 3,
    /// Video encode
    VideoEncode = 4,
    /// JPEG decode
    Jpeg        = 5,
}

impl QueueKind {
    /// All queues, in index order
    pub const ALL: [QueueKind; MAX_QUEUES] = [
        QueueKind::Gfx,
        QueueKind::Compute,
        QueueKind::Sdma,
        QueueKind::VideoDecode,
        QueueKind::VideoEncode,
        QueueKind::Jpeg,
    ];

    /// Index into per-queue arrays
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Bit in a buffer's valid-fence mask
    #[inline]
    pub const fn mask_bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Queue for an array index
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < MAX_QUEUES {
            Some(Self::ALL[index])
        } else {
            None
        }
    }
}

/// Submitting context. Several contexts may feed the same hardware queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ContextId(pub u32);

// =============================================================================
// MEMORY DOMAINS
// =============================================================================

/// Memory domain of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Device-local memory
    Vram,
    /// Host-visible system memory mapped through the GART
    Gtt,
}

impl Domain {
    /// Both domains, in index order
    pub const ALL: [Domain; 2] = [Domain::Vram, Domain::Gtt];

    /// Index into per-domain arrays
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Domain::Vram => 0,
            Domain::Gtt => 1,
        }
    }
}

bitflags::bitflags! {
    /// Buffer creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BoFlags: u32 {
        /// CPU never maps this buffer
        const NO_CPU_ACCESS = 1 << 0;
        /// Write-combined CPU mapping
        const WRITE_COMBINE = 1 << 1;
        /// Never recycle through the cache
        const NO_REUSE = 1 << 2;
        /// Never sub-allocate from a slab
        const NO_SUBALLOC = 1 << 3;
        /// Clear contents on allocation
        const ZERO_VRAM = 1 << 4;
        /// Encrypted allocation
        const ENCRYPTED = 1 << 5;
    }
}

impl BoFlags {
    /// Flags that select a distinct cache/slab bucket
    pub const BUCKET_MASK: BoFlags = BoFlags::NO_CPU_ACCESS
        .union(BoFlags::WRITE_COMBINE)
        .union(BoFlags::ENCRYPTED);

    /// Bucket-relevant subset of these flags
    #[inline]
    pub const fn bucket(self) -> BoFlags {
        self.intersection(Self::BUCKET_MASK)
    }
}

bitflags::bitflags! {
    /// CPU mapping flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        /// Map for reading
        const READ = 1 << 0;
        /// Map for writing
        const WRITE = 1 << 1;
        /// Do not wait for the GPU to finish with the buffer
        const UNSYNCHRONIZED = 1 << 2;
        /// Fail with `Busy` instead of waiting
        const DONT_BLOCK = 1 << 3;
    }
}

// =============================================================================
// KERNEL HANDLES
// =============================================================================

/// Raw file descriptor number
pub type RawFd = i32;

/// GEM handle. Valid only inside the file description that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct KmsHandle(pub u32);

/// dma-buf file descriptor: a portable reference to a kernel allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DmaBufFd(pub RawFd);

/// Stable kernel identity of an allocation, identical in every file
/// description that has a handle to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BoIdentity(pub u64);

/// Kernel fence object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct FenceId(pub u64);

/// Kernel timeline synchronization object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SyncobjHandle(pub u32);

/// Stable identity of a physical device (its device node path)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey(pub String);

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shareable buffer handle exchanged with other components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinsysHandle {
    /// GEM handle relative to a front-end's file description
    Kms(KmsHandle),
    /// dma-buf file descriptor
    Fd(DmaBufFd),
}

/// Kind of handle requested from `buffer_get_handle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// GEM handle in the target front-end's description
    Kms,
    /// Freshly exported dma-buf
    Fd,
}

// =============================================================================
// ADDRESSES
// =============================================================================

/// GPU virtual address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

/// CPU address of a buffer mapping. Opaque to this layer; never dereferenced
/// here.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CpuAddr(usize);

impl CpuAddr {
    /// Create a new CPU address
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes as usize))
    }
}

impl fmt::Debug for CpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuAddr(0x{:x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_no_distance_wraps() {
        let old = SeqNo::new(u32::MAX - 2);
        let new = SeqNo::new(3);
        assert_eq!(new.distance_from(old), 6);
        assert_eq!(SeqNo::new(u32::MAX).next(), SeqNo::new(0));
    }

    #[test]
    fn test_ring_slot() {
        assert_eq!(SeqNo::new(33).ring_slot(), 1);
        assert_eq!(SeqNo::new(u32::MAX).ring_slot(), 31);
    }

    #[test]
    fn test_queue_mask_bits_are_distinct() {
        let mut seen = 0u8;
        for q in QueueKind::ALL {
            assert_eq!(seen & q.mask_bit(), 0);
            seen |= q.mask_bit();
            assert_eq!(QueueKind::from_index(q.index()), Some(q));
        }
        assert_eq!(QueueKind::from_index(MAX_QUEUES), None);
    }

    #[test]
    fn test_bucket_ignores_behavioral_flags() {
        let flags = BoFlags::WRITE_COMBINE | BoFlags::NO_REUSE | BoFlags::ZERO_VRAM;
        assert_eq!(flags.bucket(), BoFlags::WRITE_COMBINE);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(checked_align_up(u64::MAX - 4095, PAGE_SIZE), Some(u64::MAX - 4095));
        assert_eq!(checked_align_up(u64::MAX - 4094, PAGE_SIZE), None);
    }
}
