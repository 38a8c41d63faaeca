//! # Buffer Objects
//!
//! [`Bo`] is the client reference to a buffer. Cloning it takes a reference,
//! dropping it releases one. When the last client reference goes away the
//! buffer is handed to its [`BoReleaser`], which decides between recycling,
//! deferred destruction and immediate destruction.
//!
//! The reference count lives next to the buffer state rather than in the
//! `Arc`: allocator structures (cache, slab reclaim list, export table) hold
//! `Arc<BoInner>` without counting as clients, and can bring a buffer back
//! from zero with [`Bo::acquire`].

use alloc::sync::{Arc, Weak};
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{self, AtomicBool, AtomicU32, Ordering};

use cinder_core::{BoFlags, BoIdentity, CpuAddr, Domain, GpuAddr, KmsHandle};
use cinder_sync::{BufferFences, SeqNoFences};

// =============================================================================
// RELEASER
// =============================================================================

/// Receives buffers whose last client reference was dropped
pub trait BoReleaser: Send + Sync {
    /// Take ownership of a buffer with a client refcount of zero.
    ///
    /// The buffer may be revived concurrently through the export table;
    /// implementations must re-check [`BoInner::refcount`] under the lock
    /// that guards revival before destroying a shared buffer.
    fn release(&self, bo: Arc<BoInner>);
}

// =============================================================================
// BUFFER KINDS
// =============================================================================

/// CPU mapping state of a real buffer
#[derive(Debug, Default)]
pub(crate) struct MapState {
    pub(crate) addr: Option<CpuAddr>,
    pub(crate) count: u32,
}

/// Buffer owning a kernel allocation
#[derive(Debug)]
pub struct RealBo {
    pub(crate) handle: KmsHandle,
    pub(crate) identity: BoIdentity,
    pub(crate) va: GpuAddr,
    pub(crate) imported: bool,
    pub(crate) shared: AtomicBool,
    pub(crate) map: spin::Mutex<MapState>,
}

/// Fixed-size sub-range of a slab backing buffer
#[derive(Debug)]
pub struct SlabEntry {
    pub(crate) backing: Arc<BoInner>,
    pub(crate) slab_id: u64,
    pub(crate) index: u32,
    pub(crate) entry_size: u64,
}

impl SlabEntry {
    /// Offset inside the backing buffer
    #[inline]
    pub fn offset(&self) -> u64 {
        u64::from(self.index) * self.entry_size
    }

    /// Size of the slot this entry occupies
    #[inline]
    pub fn entry_size(&self) -> u64 {
        self.entry_size
    }

    /// The backing buffer
    #[inline]
    pub fn backing(&self) -> &Arc<BoInner> {
        &self.backing
    }
}

/// What a buffer is backed by
#[derive(Debug)]
pub enum BoKind {
    /// Owns a kernel allocation
    Real(RealBo),
    /// Lives inside a slab
    Slab(SlabEntry),
}

// =============================================================================
// BUFFER STATE
// =============================================================================

/// Shared buffer state
pub struct BoInner {
    unique_id: u64,
    size: u64,
    alignment: u64,
    domain: Domain,
    flags: BoFlags,
    refcount: AtomicU32,
    pending: AtomicU32,
    fences: BufferFences,
    kind: BoKind,
    releaser: Weak<dyn BoReleaser>,
}

impl BoInner {
    pub(crate) fn new(
        unique_id: u64,
        size: u64,
        alignment: u64,
        domain: Domain,
        flags: BoFlags,
        kind: BoKind,
        releaser: Weak<dyn BoReleaser>,
    ) -> Arc<Self> {
        Arc::new(Self {
            unique_id,
            size,
            alignment,
            domain,
            flags,
            refcount: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            fences: BufferFences::new(SeqNoFences::new()),
            kind,
            releaser,
        })
    }

    /// Device-unique id, stable for the buffer's lifetime
    #[inline]
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    /// Usable size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    #[inline]
    pub fn domain(&self) -> Domain {
        self.domain
    }

    #[inline]
    pub fn flags(&self) -> BoFlags {
        self.flags
    }

    /// Client references
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Per-queue last-use sequence numbers
    #[inline]
    pub fn fences(&self) -> &BufferFences {
        &self.fences
    }

    #[inline]
    pub fn kind(&self) -> &BoKind {
        &self.kind
    }

    #[inline]
    pub fn is_slab(&self) -> bool {
        matches!(self.kind, BoKind::Slab(_))
    }

    /// Real buffer state, `None` for slab entries
    #[inline]
    pub fn real(&self) -> Option<&RealBo> {
        match &self.kind {
            BoKind::Real(real) => Some(real),
            BoKind::Slab(_) => None,
        }
    }

    /// Whether the buffer is known outside this device's allocator
    pub fn is_shared(&self) -> bool {
        self.real()
            .is_some_and(|real| real.shared.load(Ordering::Acquire))
    }

    /// Mark the buffer shared; it will never be recycled
    pub fn mark_shared(&self) {
        if let Some(real) = self.real() {
            real.shared.store(true, Ordering::Release);
        }
    }

    /// Whether the buffer came from another process or device
    pub fn is_imported(&self) -> bool {
        self.real().is_some_and(|real| real.imported)
    }

    /// Handle in the device's own file description (real buffers only)
    pub fn kms_handle(&self) -> Option<KmsHandle> {
        self.real().map(|real| real.handle)
    }

    /// Stable kernel identity (real buffers only)
    pub fn identity(&self) -> Option<BoIdentity> {
        self.real().map(|real| real.identity)
    }

    /// Handle to list in a submission: the buffer itself or its slab backing
    pub fn submit_handle(&self) -> KmsHandle {
        match &self.kind {
            BoKind::Real(real) => real.handle,
            BoKind::Slab(entry) => entry.backing.submit_handle(),
        }
    }

    /// GPU virtual address of the first byte
    pub fn gpu_address(&self) -> GpuAddr {
        match &self.kind {
            BoKind::Real(real) => real.va,
            BoKind::Slab(entry) => entry.backing.gpu_address().offset(entry.offset()),
        }
    }

    // =========================================================================
    // Queued submissions
    // =========================================================================

    /// A submission referencing this buffer was queued but not yet handed to
    /// the kernel
    pub fn begin_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// The queued submission was submitted or dropped
    pub fn end_pending(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Queued submissions not yet visible in the fence rings
    #[inline]
    pub fn pending_submissions(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }
}

impl fmt::Debug for BoInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoInner")
            .field("unique_id", &self.unique_id)
            .field("size", &self.size)
            .field("domain", &self.domain)
            .field("flags", &self.flags)
            .field("refcount", &self.refcount())
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CLIENT REFERENCE
// =============================================================================

/// Client reference to a buffer
pub struct Bo {
    inner: Arc<BoInner>,
}

impl Bo {
    /// Take a client reference, reviving a buffer whose count reached zero
    pub fn acquire(inner: &Arc<BoInner>) -> Bo {
        inner.refcount.fetch_add(1, Ordering::AcqRel);
        Bo {
            inner: Arc::clone(inner),
        }
    }

    /// Shared state
    #[inline]
    pub fn inner(&self) -> &Arc<BoInner> {
        &self.inner
    }

    /// Whether two references name the same buffer
    #[inline]
    pub fn ptr_eq(a: &Bo, b: &Bo) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl Deref for Bo {
    type Target = BoInner;

    fn deref(&self) -> &BoInner {
        &self.inner
    }
}

impl Clone for Bo {
    fn clone(&self) -> Self {
        Bo::acquire(&self.inner)
    }
}

impl Drop for Bo {
    fn drop(&mut self) {
        if self.inner.refcount.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);
        if let Some(releaser) = self.inner.releaser.upgrade() {
            releaser.release(Arc::clone(&self.inner));
        }
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[derive(Default)]
    struct Collector {
        released: spin::Mutex<Vec<u64>>,
    }

    impl BoReleaser for Collector {
        fn release(&self, bo: Arc<BoInner>) {
            self.released.lock().push(bo.unique_id());
        }
    }

    fn real(id: u64, releaser: &Arc<Collector>) -> Arc<BoInner> {
        let weak: Weak<dyn BoReleaser> = Arc::downgrade(releaser) as Weak<Collector>;
        BoInner::new(
            id,
            4096,
            4096,
            Domain::Gtt,
            BoFlags::empty(),
            BoKind::Real(RealBo {
                handle: KmsHandle(id as u32),
                identity: BoIdentity(id),
                va: GpuAddr::new(0x1000 * id),
                imported: false,
                shared: AtomicBool::new(false),
                map: spin::Mutex::new(MapState::default()),
            }),
            weak,
        )
    }

    #[test]
    fn test_release_on_last_drop() {
        let collector = Arc::new(Collector::default());
        let bo = Bo::acquire(&real(7, &collector));
        let second = bo.clone();
        assert_eq!(bo.refcount(), 2);

        drop(bo);
        assert!(collector.released.lock().is_empty());
        drop(second);
        assert_eq!(*collector.released.lock(), [7]);
    }

    #[test]
    fn test_revive_after_release() {
        let collector = Arc::new(Collector::default());
        let inner = real(3, &collector);
        drop(Bo::acquire(&inner));
        assert_eq!(inner.refcount(), 0);

        let revived = Bo::acquire(&inner);
        assert_eq!(revived.refcount(), 1);
        drop(revived);
        assert_eq!(*collector.released.lock(), [3, 3]);
    }

    #[test]
    fn test_slab_entry_addresses() {
        let collector = Arc::new(Collector::default());
        let backing = real(1, &collector);
        let weak: Weak<dyn BoReleaser> = Arc::downgrade(&collector) as Weak<Collector>;
        let entry = BoInner::new(
            2,
            1000,
            256,
            Domain::Gtt,
            BoFlags::empty(),
            BoKind::Slab(SlabEntry {
                backing: backing.clone(),
                slab_id: 1,
                index: 3,
                entry_size: 1024,
            }),
            weak,
        );

        assert_eq!(entry.gpu_address(), backing.gpu_address().offset(3072));
        assert_eq!(entry.submit_handle(), backing.kms_handle().unwrap());
        assert!(entry.kms_handle().is_none());
        entry.mark_shared();
        assert!(!entry.is_shared());
    }
}
