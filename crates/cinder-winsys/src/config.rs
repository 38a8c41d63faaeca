//! Environment overrides for [`WinsysConfig`]

use cinder_core::{CacheConfig, SlabConfig, WinsysConfig};

/// Variable holding comma-separated debug flags
pub const DEBUG_ENV: &str = "CINDER_DEBUG";

/// Debug-flag parsing for [`WinsysConfig`]
pub trait WinsysConfigExt: Sized {
    /// Defaults with the flags of `CINDER_DEBUG` applied
    fn from_env() -> Self;

    /// Apply comma-separated debug flags:
    /// `nocache`, `noslab`, `zerovram`, `allbos`, `noopcs`
    fn with_debug_flags(self, flags: &str) -> Self;
}

impl WinsysConfigExt for WinsysConfig {
    fn from_env() -> Self {
        match std::env::var(DEBUG_ENV) {
            Ok(flags) => Self::new().with_debug_flags(&flags),
            Err(_) => Self::new(),
        }
    }

    fn with_debug_flags(mut self, flags: &str) -> Self {
        for flag in flags.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            match flag {
                "nocache" => self.cache = CacheConfig::disabled(),
                "noslab" => self.slab = SlabConfig::disabled(),
                "zerovram" => self.zero_vram = true,
                "allbos" => self.debug_all_bos = true,
                "noopcs" => self.noop_cs = true,
                other => log::warn!("ignoring unknown {} flag `{}`", DEBUG_ENV, other),
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flags() {
        let config = WinsysConfig::new().with_debug_flags("nocache, zerovram,,bogus");
        assert!(!config.cache.enabled);
        assert!(config.slab.enabled);
        assert!(config.zero_vram);
        assert!(!config.debug_all_bos);

        let config = WinsysConfig::new().with_debug_flags("noslab,allbos,noopcs");
        assert!(!config.slab.enabled);
        assert!(config.debug_all_bos);
        assert!(config.noop_cs);
    }

    #[test]
    fn test_no_flags_is_default() {
        assert_eq!(WinsysConfig::new().with_debug_flags(""), WinsysConfig::default());
    }
}
