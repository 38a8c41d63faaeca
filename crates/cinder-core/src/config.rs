//! # Winsys Configuration
//!
//! Tunables for the allocator and the submission worker.

// =============================================================================
// CACHE CONFIGURATION
// =============================================================================

/// Recycling cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Recycle freed buffers at all
    pub enabled: bool,
    /// Age after which an idle cached buffer goes back to the kernel
    pub max_age_ns: u64,
    /// A cached buffer serves requests down to `size * 100 / size_factor_percent`
    pub size_factor_percent: u32,
    /// Upper bound on bytes held by the cache
    pub max_bytes: u64,
}

impl CacheConfig {
    /// Default cache configuration
    pub const fn new() -> Self {
        Self {
            enabled: true,
            max_age_ns: 500_000_000,
            size_factor_percent: 200,
            max_bytes: 512 * 1024 * 1024,
        }
    }

    /// Disabled cache
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// With maximum age
    #[inline]
    pub const fn with_max_age_ns(mut self, max_age_ns: u64) -> Self {
        self.max_age_ns = max_age_ns;
        self
    }

    /// With byte limit
    #[inline]
    pub const fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SLAB CONFIGURATION
// =============================================================================

/// Slab sub-allocator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabConfig {
    /// Sub-allocate small buffers at all
    pub enabled: bool,
    /// Smallest entry size, log2
    pub min_order: u32,
    /// Largest entry size, log2. Requests above `1 << max_order` bypass slabs.
    pub max_order: u32,
    /// Entries per slab before clamping
    pub entries_per_slab: u32,
    /// Smallest slab backing allocation
    pub min_slab_size: u64,
    /// Largest slab backing allocation
    pub max_slab_size: u64,
}

impl SlabConfig {
    /// Default slab configuration
    pub const fn new() -> Self {
        Self {
            enabled: true,
            min_order: 8,
            max_order: 18,
            entries_per_slab: 16,
            min_slab_size: 64 * 1024,
            max_slab_size: 2 * 1024 * 1024,
        }
    }

    /// Disabled slabs
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Largest request served by slabs
    #[inline]
    pub const fn max_entry_size(&self) -> u64 {
        1 << self.max_order
    }
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// WINSYS CONFIGURATION
// =============================================================================

/// Top-level winsys configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinsysConfig {
    /// Recycling cache
    pub cache: CacheConfig,
    /// Slab sub-allocator
    pub slab: SlabConfig,
    /// Depth of the bounded submission queue
    pub cs_queue_depth: usize,
    /// Clear every VRAM allocation
    pub zero_vram: bool,
    /// Keep a list of every live buffer (needs the `debug-bo-list` feature)
    pub debug_all_bos: bool,
    /// Accept submissions without handing them to the kernel
    pub noop_cs: bool,
}

impl WinsysConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            cache: CacheConfig::new(),
            slab: SlabConfig::new(),
            cs_queue_depth: 8,
            zero_vram: false,
            debug_all_bos: false,
            noop_cs: false,
        }
    }

    /// With cache configuration
    #[inline]
    pub const fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// With slab configuration
    #[inline]
    pub const fn with_slab(mut self, slab: SlabConfig) -> Self {
        self.slab = slab;
        self
    }

    /// With submission queue depth
    #[inline]
    pub const fn with_cs_queue_depth(mut self, depth: usize) -> Self {
        self.cs_queue_depth = depth;
        self
    }

    /// With VRAM clearing
    #[inline]
    pub const fn with_zero_vram(mut self, zero_vram: bool) -> Self {
        self.zero_vram = zero_vram;
        self
    }

    /// With submissions dropped before the kernel
    #[inline]
    pub const fn with_noop_cs(mut self, noop_cs: bool) -> Self {
        self.noop_cs = noop_cs;
        self
    }
}

impl Default for WinsysConfig {
    fn default() -> Self {
        Self::new()
    }
}
