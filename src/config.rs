//! Engine Configuration
//!
//! Paging and allocation constants. All of them are tunable; the defaults
//! are the values the engine was built around.
//!
//! # Examples
//!
//! ```
//! use vbar::EngineConfig;
//!
//! let config = EngineConfig::new()
//!     .with_page_size(2 << 20)
//!     .with_vram_headroom(0);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.pages_for(5 << 20), 3);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, VbarError};

/// Default page size (32 MiB)
pub const DEFAULT_PAGE_SIZE: u64 = 32 << 20;

/// Default VRAM buffer growth increment (16 MiB)
pub const DEFAULT_VRAM_CHUNK_SIZE: u64 = 16 << 20;

/// Default sub-allocation alignment
pub const DEFAULT_ALLOC_ALIGNMENT: u64 = 512;

/// Default headroom kept free on the device (256 MiB)
pub const DEFAULT_VRAM_HEADROOM: u64 = 256 << 20;

/// Default allocator shim rounding (2 MiB)
pub const DEFAULT_SHIM_GRANULARITY: u64 = 2 << 20;

/// Paging engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes per VBAR page
    pub page_size: u64,
    /// Bytes per VRAM buffer growth step
    pub vram_chunk_size: u64,
    /// Alignment of VBAR sub-allocations
    pub alloc_alignment: u64,
    /// Bytes the engine tries to keep free on every device
    pub vram_headroom: u64,
    /// Allocator shim size rounding
    pub shim_granularity: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            vram_chunk_size: DEFAULT_VRAM_CHUNK_SIZE,
            alloc_alignment: DEFAULT_ALLOC_ALIGNMENT,
            vram_headroom: DEFAULT_VRAM_HEADROOM,
            shim_granularity: DEFAULT_SHIM_GRANULARITY,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size in bytes
    #[must_use]
    pub fn with_page_size(mut self, bytes: u64) -> Self {
        self.page_size = bytes;
        self
    }

    /// Set the VRAM buffer growth increment in bytes
    #[must_use]
    pub fn with_vram_chunk_size(mut self, bytes: u64) -> Self {
        self.vram_chunk_size = bytes;
        self
    }

    /// Set the sub-allocation alignment in bytes
    #[must_use]
    pub fn with_alloc_alignment(mut self, bytes: u64) -> Self {
        self.alloc_alignment = bytes;
        self
    }

    /// Set the device headroom in bytes
    #[must_use]
    pub fn with_vram_headroom(mut self, bytes: u64) -> Self {
        self.vram_headroom = bytes;
        self
    }

    /// Set the allocator shim rounding in bytes
    #[must_use]
    pub fn with_shim_granularity(mut self, bytes: u64) -> Self {
        self.shim_granularity = bytes;
        self
    }

    /// Check that every size is a non-zero power of two and that page, chunk
    /// and shim sizes are whole multiples of `alloc_alignment`
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::InvalidArgument)` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("page_size", self.page_size),
            ("vram_chunk_size", self.vram_chunk_size),
            ("alloc_alignment", self.alloc_alignment),
            ("shim_granularity", self.shim_granularity),
        ];
        for (name, value) in fields {
            if value == 0 || !value.is_power_of_two() {
                return Err(VbarError::InvalidArgument(format!(
                    "{} must be a non-zero power of two, got {}",
                    name, value
                )));
            }
        }
        // Sub-allocations are aligned inside pages, chunks and shim blocks
        let granular = [
            ("page_size", self.page_size),
            ("vram_chunk_size", self.vram_chunk_size),
            ("shim_granularity", self.shim_granularity),
        ];
        for (name, value) in granular {
            if value % self.alloc_alignment != 0 {
                return Err(VbarError::InvalidArgument(format!(
                    "{} {} is not a multiple of alloc_alignment {}",
                    name, value, self.alloc_alignment
                )));
            }
        }
        Ok(())
    }

    /// Defaults overlaid with `VBAR_*` environment variables (byte values)
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::InvalidArgument)` if a variable is not a number
    /// or the result fails [`EngineConfig::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let fields: [(&str, &mut u64); 5] = [
            ("VBAR_PAGE_SIZE", &mut config.page_size),
            ("VBAR_VRAM_CHUNK_SIZE", &mut config.vram_chunk_size),
            ("VBAR_ALLOC_ALIGNMENT", &mut config.alloc_alignment),
            ("VBAR_VRAM_HEADROOM", &mut config.vram_headroom),
            ("VBAR_SHIM_GRANULARITY", &mut config.shim_granularity),
        ];
        for (key, slot) in fields {
            if let Some(raw) = lookup(key) {
                *slot = raw.trim().parse().map_err(|_| {
                    VbarError::InvalidArgument(format!("{}={:?} is not a byte count", key, raw))
                })?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON object; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::InvalidArgument)` on malformed JSON or a
    /// configuration that fails [`EngineConfig::validate`].
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| VbarError::InvalidArgument(format!("bad engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Number of pages covering `bytes`
    #[must_use]
    pub fn pages_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.page_size)
    }

    /// Round `bytes` up to a whole number of pages, `None` past `u64::MAX`
    #[must_use]
    pub fn round_to_pages(&self, bytes: u64) -> Option<u64> {
        self.pages_for(bytes).checked_mul(self.page_size)
    }
}

/// Round `bytes` up to a multiple of `granule`
///
/// # Errors
///
/// Returns `Err(VbarError::VirtualRangeExhausted)` if the rounded size does
/// not fit the 64-bit address space.
pub(crate) fn round_up(bytes: u64, granule: u64) -> Result<u64> {
    bytes
        .div_ceil(granule)
        .checked_mul(granule)
        .ok_or(VbarError::VirtualRangeExhausted {
            requested: bytes,
            available: u64::MAX / granule * granule,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.page_size, 32 * 1024 * 1024);
        assert_eq!(config.vram_chunk_size, 16 * 1024 * 1024);
        assert_eq!(config.alloc_alignment, 512);
        assert_eq!(config.vram_headroom, 256 * 1024 * 1024);
        assert_eq!(config.shim_granularity, 2 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chaining() {
        let config = EngineConfig::new()
            .with_page_size(1 << 20)
            .with_vram_chunk_size(1 << 19)
            .with_alloc_alignment(256)
            .with_vram_headroom(0)
            .with_shim_granularity(1 << 16);
        assert_eq!(config.page_size, 1 << 20);
        assert_eq!(config.vram_chunk_size, 1 << 19);
        assert_eq!(config.alloc_alignment, 256);
        assert_eq!(config.vram_headroom, 0);
        assert_eq!(config.shim_granularity, 1 << 16);
    }

    #[test]
    fn test_validate_rejects_non_power_of_two() {
        let err = EngineConfig::new().with_page_size(3 << 20).validate().unwrap_err();
        assert!(err.to_string().contains("page_size"));
        assert!(EngineConfig::new().with_alloc_alignment(0).validate().is_err());
    }

    #[test]
    fn test_validate_alignment_above_page() {
        let config = EngineConfig::new().with_page_size(256).with_alloc_alignment(512);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_lookup_overlays() {
        let vars: HashMap<&str, &str> = [("VBAR_PAGE_SIZE", "2097152"), ("VBAR_VRAM_HEADROOM", " 0 ")]
            .into_iter()
            .collect();
        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.page_size, 2 << 20);
        assert_eq!(config.vram_headroom, 0);
        assert_eq!(config.vram_chunk_size, DEFAULT_VRAM_CHUNK_SIZE);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = EngineConfig::from_lookup(|k| (k == "VBAR_PAGE_SIZE").then(|| "big".to_string()))
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json(r#"{"page_size": 4194304}"#).unwrap();
        assert_eq!(config.page_size, 4 << 20);
        assert_eq!(config.alloc_alignment, 512);
        assert!(EngineConfig::from_json("{").is_err());
        assert!(EngineConfig::from_json(r#"{"page_size": 1000}"#).is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = EngineConfig::new().with_vram_headroom(7);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_page_rounding() {
        let config = EngineConfig::new().with_page_size(1024);
        assert_eq!(config.pages_for(0), 0);
        assert_eq!(config.pages_for(1), 1);
        assert_eq!(config.pages_for(1024), 1);
        assert_eq!(config.pages_for(1025), 2);
        assert_eq!(config.round_to_pages(1025), Some(2048));
        assert_eq!(config.round_to_pages(u64::MAX), None);
    }

    #[test]
    fn test_round_up_overflow() {
        assert_eq!(round_up(0, 4096).unwrap(), 0);
        assert_eq!(round_up(4097, 4096).unwrap(), 8192);
        assert_eq!(round_up(u64::MAX - 4095, 4096).unwrap(), u64::MAX - 4095);
        let err = round_up(u64::MAX, 4096).unwrap_err();
        assert!(matches!(
            err,
            VbarError::VirtualRangeExhausted { requested: u64::MAX, .. }
        ));
        assert!(!err.is_contract_violation());
    }

    #[test]
    fn test_validate_requires_alignment_multiples() {
        let err = EngineConfig::new()
            .with_alloc_alignment(1 << 20)
            .with_vram_chunk_size(1 << 19)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("vram_chunk_size"));

        let err = EngineConfig::new()
            .with_alloc_alignment(1 << 20)
            .with_shim_granularity(1 << 16)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("shim_granularity"));

        assert!(EngineConfig::new()
            .with_page_size(1 << 20)
            .with_vram_chunk_size(1 << 20)
            .with_alloc_alignment(1 << 20)
            .with_shim_granularity(1 << 20)
            .validate()
            .is_ok());
    }
}
