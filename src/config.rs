//! Target Configuration
//!
//! Construction-time configuration for a remap target instance. Runtime
//! tunables (auto-remap toggle, error threshold) live on the target itself
//! as atomics so the administrative surface can change them without a
//! rebuild; everything here is fixed for the lifetime of the instance.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Hard cap on the spare area length; larger values are clamped, not rejected.
pub const MAX_SPARE_LEN: u64 = 1 << 22;

/// Default health score above which a sector is considered safe.
pub const DEFAULT_WARNING_THRESHOLD: u16 = 700;

/// Default health score below which a sector is considered in danger.
pub const DEFAULT_DANGER_THRESHOLD: u16 = 300;

/// Default consecutive-error count that triggers automatic remapping.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

/// Default interval between background scan cycles.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum accepted scan interval.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Default number of sectors probed per scan cycle.
pub const DEFAULT_SECTORS_PER_SCAN: u64 = 256;

/// Default number of free-sector candidates examined per cache refill.
pub const DEFAULT_ALLOC_CACHE_REFILL: usize = 64;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a remap target instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Number of addressable sectors on the main device
    pub main_sectors: u64,

    /// First sector of the spare area on the spare device
    pub spare_start: u64,

    /// Number of sectors in the spare area
    pub spare_len: u64,

    /// Error count at which a sector becomes eligible for auto-remap
    pub error_threshold: u32,

    /// Whether automatic remapping is enabled at startup
    pub auto_remap_enabled: bool,

    /// Interval between background scan cycles
    pub scan_interval: Duration,

    /// Sectors probed per scan cycle
    pub sectors_per_scan: u64,

    /// Health score at or above which a sector is Safe
    pub warning_threshold: u16,

    /// Health score below which a sector is in Danger
    pub danger_threshold: u16,

    /// Whether the spare allocator keeps a FIFO cache of free sectors
    pub alloc_cache: bool,

    /// Maximum candidates examined per allocation-cache refill
    pub alloc_cache_refill: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            main_sectors: 1 << 20,
            spare_start: 0,
            spare_len: 1024,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            auto_remap_enabled: true,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            sectors_per_scan: DEFAULT_SECTORS_PER_SCAN,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            danger_threshold: DEFAULT_DANGER_THRESHOLD,
            alloc_cache: true,
            alloc_cache_refill: DEFAULT_ALLOC_CACHE_REFILL,
        }
    }
}

impl TargetConfig {
    /// Validate the configuration.
    ///
    /// `spare_len` above [`MAX_SPARE_LEN`] is clamped (the one documented
    /// exception to reject-don't-clamp); everything else invalid is rejected
    /// with a descriptive reason.
    pub fn validate(&mut self) -> Result<()> {
        if self.main_sectors == 0 {
            return Err(Error::InvalidConfig("main_sectors must be > 0".into()));
        }
        if self.spare_len == 0 {
            return Err(Error::InvalidConfig("spare_len must be > 0".into()));
        }
        if self.spare_len > MAX_SPARE_LEN {
            self.spare_len = MAX_SPARE_LEN;
        }
        if self.error_threshold == 0 {
            return Err(Error::InvalidConfig("error_threshold must be >= 1".into()));
        }
        if self.scan_interval < MIN_SCAN_INTERVAL {
            return Err(Error::InvalidConfig(format!(
                "scan_interval must be >= {}ms",
                MIN_SCAN_INTERVAL.as_millis()
            )));
        }
        if self.sectors_per_scan == 0 {
            return Err(Error::InvalidConfig("sectors_per_scan must be >= 1".into()));
        }
        if self.warning_threshold > 1000 {
            return Err(Error::InvalidConfig(
                "warning_threshold must be <= 1000".into(),
            ));
        }
        if self.danger_threshold >= self.warning_threshold {
            return Err(Error::InvalidConfig(
                "danger_threshold must be < warning_threshold".into(),
            ));
        }
        if self.alloc_cache && self.alloc_cache_refill == 0 {
            return Err(Error::InvalidConfig(
                "alloc_cache_refill must be >= 1 when the cache is enabled".into(),
            ));
        }
        Ok(())
    }

    /// One past the last sector of the spare area.
    pub fn spare_end(&self) -> u64 {
        self.spare_start + self.spare_len
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_is_valid() {
        let mut config = TargetConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_spare_rejected() {
        let mut config = TargetConfig {
            spare_len: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_oversized_spare_clamped() {
        let mut config = TargetConfig {
            spare_len: MAX_SPARE_LEN + 1,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.spare_len, MAX_SPARE_LEN);
    }

    #[test]
    fn test_zero_error_threshold_rejected() {
        let mut config = TargetConfig {
            error_threshold: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_tiny_scan_interval_rejected() {
        let mut config = TargetConfig {
            scan_interval: Duration::from_millis(10),
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = TargetConfig {
            warning_threshold: 300,
            danger_threshold: 700,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_spare_end() {
        let config = TargetConfig {
            spare_start: 1000,
            spare_len: 100,
            ..Default::default()
        };
        assert_eq!(config.spare_end(), 1100);
    }
}
