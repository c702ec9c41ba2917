// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Instantiation parameters of the secure memory controller.
//!
//! Everything here is fixed when the controller is built. Fields missing from
//! a serialised configuration fall back to [`Default`]: 128 KiB 4-way
//! metadata caches with 4 MSHRs each.

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::geometry::LINE_BYTES;

/// Simulation time unit
pub type Tick = u64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Protected region must not be empty")]
    EmptyRegion,

    #[error("Protected region of {0} bytes is not a multiple of the line size")]
    UnalignedRegion(u64),

    #[error("Protected region holds {0} lines, more than the nonce can index")]
    RegionTooLarge(u64),

    #[error("Unsupported counter width of {0} bits (expected 16, 32 or 64)")]
    CounterWidth(u32),

    #[error("Unsupported tag width of {0} bits (expected 32, 64 or 128)")]
    TagWidth(u32),

    #[error("Unsupported tree arity {0} (expected 2, 4 or 8)")]
    TreeArity(u32),

    #[error("Cache {name}: {reason}")]
    Cache { name: &'static str, reason: String },

    #[error("Key material rejected: {0}")]
    Key(&'static str),

    #[error("At least one request must be allowed in flight")]
    NoPendingSlots,

    #[error("Cannot read configuration: {0}")]
    Io(String),

    #[error("Malformed configuration: {0}")]
    Parse(String),
}

/// Parameters of one metadata cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub size_bytes: u64,
    pub assoc: u32,
    pub tag_latency: Tick,
    pub data_latency: Tick,
    pub response_latency: Tick,
    pub mshrs: u32,
    pub tgts_per_mshr: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_bytes: 128 * 1024,
            assoc: 4,
            tag_latency: 2,
            data_latency: 2,
            response_latency: 2,
            mshrs: 4,
            tgts_per_mshr: 20,
        }
    }
}

impl CacheConfig {
    /// Number of metadata blocks the cache can hold
    pub fn entries(&self) -> u64 {
        self.size_bytes / LINE_BYTES as u64
    }

    /// Latency of an access that hits
    pub fn hit_latency(&self) -> Tick {
        self.tag_latency + self.data_latency
    }

    fn validate(&self, name: &'static str) -> Result<(), ConfigError> {
        let fail = |reason: String| Err(ConfigError::Cache { name, reason });

        if self.assoc == 0 {
            return fail("associativity must be positive".into());
        }
        let entries = self.entries();
        if entries == 0 {
            return fail(format!("{} bytes cannot hold a single line", self.size_bytes));
        }
        if entries % self.assoc as u64 != 0 {
            return fail(format!(
                "{entries} entries are not divisible into {}-way sets",
                self.assoc
            ));
        }
        if self.mshrs == 0 || self.tgts_per_mshr == 0 {
            return fail("MSHRs and targets per MSHR must be positive".into());
        }
        Ok(())
    }
}

/// Where counter, tree and MAC traffic leaves the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum PortLayout {
    /// Dedicated `cnt_port`, `mt_port` and `mac_port`
    #[default]
    Split,
    /// All metadata on a single `meta_port`
    Merged,
}

/// When dirty metadata is written back to memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum WritebackPolicy {
    /// On eviction, or on an explicit flush
    #[default]
    Lazy,
    /// As part of every committed write
    Eager,
}

/// Pre-provisioned key material
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyMaterial {
    #[serde(with = "hex")]
    pub encryption: [u8; 32],
    #[serde(with = "hex")]
    pub authentication: [u8; 32],
}

impl KeyMaterial {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.encryption == [0; 32] || self.authentication == [0; 32] {
            return Err(ConfigError::Key("all-zero key"));
        }
        if self.encryption == self.authentication {
            return Err(ConfigError::Key(
                "encryption and authentication keys must differ",
            ));
        }
        Ok(())
    }
}

impl Default for KeyMaterial {
    /// Fixed development keys. Real deployments supply their own.
    fn default() -> Self {
        let mut encryption = [0u8; 32];
        let mut authentication = [0u8; 32];
        for i in 0..32 {
            encryption[i] = 0x5a ^ (i as u8).wrapping_mul(37);
            authentication[i] = 0xa5 ^ (i as u8).wrapping_mul(101);
        }
        Self {
            encryption,
            authentication,
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

/// Full controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecCtrlConfig {
    /// Size of the protected data region in bytes
    pub data_bytes: u64,
    pub counter_cache: CacheConfig,
    pub mac_cache: CacheConfig,
    pub tree_cache: CacheConfig,
    pub keys: KeyMaterial,
    pub counter_bits: u32,
    pub tag_bits: u32,
    pub tree_arity: u32,
    pub ports: PortLayout,
    pub writeback: WritebackPolicy,
    /// Cost of one encryption or decryption including tag computation
    pub crypto_latency: Tick,
    /// CPU-side requests the controller tracks at once
    pub max_pending: usize,
}

impl Default for SecCtrlConfig {
    fn default() -> Self {
        Self {
            data_bytes: 1 << 20,
            counter_cache: CacheConfig::default(),
            mac_cache: CacheConfig::default(),
            tree_cache: CacheConfig::default(),
            keys: KeyMaterial::default(),
            counter_bits: 64,
            tag_bits: 64,
            tree_arity: 8,
            ports: PortLayout::default(),
            writeback: WritebackPolicy::default(),
            crypto_latency: 20,
            max_pending: 64,
        }
    }
}

impl SecCtrlConfig {
    /// Check every parameter. Called by every constructor that consumes a
    /// configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let line = LINE_BYTES as u64;
        if self.data_bytes == 0 {
            return Err(ConfigError::EmptyRegion);
        }
        if self.data_bytes % line != 0 {
            return Err(ConfigError::UnalignedRegion(self.data_bytes));
        }
        let lines = self.data_bytes / line;
        if lines > u32::MAX as u64 + 1 {
            return Err(ConfigError::RegionTooLarge(lines));
        }
        if !matches!(self.counter_bits, 16 | 32 | 64) {
            return Err(ConfigError::CounterWidth(self.counter_bits));
        }
        if !matches!(self.tag_bits, 32 | 64 | 128) {
            return Err(ConfigError::TagWidth(self.tag_bits));
        }
        if !matches!(self.tree_arity, 2 | 4 | 8) {
            return Err(ConfigError::TreeArity(self.tree_arity));
        }
        self.counter_cache.validate("counter")?;
        self.mac_cache.validate("mac")?;
        self.tree_cache.validate("tree")?;
        self.keys.validate()?;
        if self.max_pending == 0 {
            return Err(ConfigError::NoPendingSlots);
        }
        Ok(())
    }

    /// Load a JSON configuration file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        Self::from_json(&text)
    }

    /// Parse a JSON configuration and validate it.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Largest value a counter may take
    pub fn counter_max(&self) -> u64 {
        match self.counter_bits {
            64 => u64::MAX,
            bits => (1 << bits) - 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(SecCtrlConfig::default().validate(), Ok(()));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config = SecCtrlConfig::from_json(
            r#"{ "data_bytes": 65536, "tree_arity": 4, "ports": "merged",
                 "tree_cache": { "size_bytes": 1024, "assoc": 2 } }"#,
        )
        .unwrap();
        assert_eq!(config.data_bytes, 65536);
        assert_eq!(config.tree_arity, 4);
        assert_eq!(config.ports, PortLayout::Merged);
        assert_eq!(config.tree_cache.assoc, 2);
        assert_eq!(config.tree_cache.mshrs, 4);
        assert_eq!(config.counter_cache, CacheConfig::default());
    }

    #[test]
    fn keys_are_hex_encoded() {
        let config = SecCtrlConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(&hex::encode(config.keys.encryption)));
        assert_eq!(SecCtrlConfig::from_json(&json), Ok(config));
    }

    #[test]
    fn rejects_malformed_parameters() {
        let check = |f: fn(&mut SecCtrlConfig)| {
            let mut config = SecCtrlConfig::default();
            f(&mut config);
            config.validate()
        };

        assert_eq!(check(|c| c.data_bytes = 0), Err(ConfigError::EmptyRegion));
        assert_eq!(
            check(|c| c.data_bytes = 100),
            Err(ConfigError::UnalignedRegion(100))
        );
        assert_eq!(
            check(|c| c.counter_bits = 24),
            Err(ConfigError::CounterWidth(24))
        );
        assert_eq!(check(|c| c.tag_bits = 16), Err(ConfigError::TagWidth(16)));
        assert_eq!(check(|c| c.tree_arity = 3), Err(ConfigError::TreeArity(3)));
        assert_eq!(check(|c| c.max_pending = 0), Err(ConfigError::NoPendingSlots));
        assert!(matches!(
            check(|c| c.mac_cache.size_bytes = 32),
            Err(ConfigError::Cache { name: "mac", .. })
        ));
        assert!(matches!(
            check(|c| c.tree_cache.assoc = 3),
            Err(ConfigError::Cache { name: "tree", .. })
        ));
        assert!(matches!(
            check(|c| c.keys.encryption = [0; 32]),
            Err(ConfigError::Key(_))
        ));
        assert!(matches!(
            check(|c| c.keys.authentication = c.keys.encryption),
            Err(ConfigError::Key(_))
        ));
        assert!(matches!(
            SecCtrlConfig::from_json(r#"{ "bogus": 1 }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn counter_max_follows_width() {
        let mut config = SecCtrlConfig::default();
        assert_eq!(config.counter_max(), u64::MAX);
        config.counter_bits = 16;
        assert_eq!(config.counter_max(), 0xffff);
    }
}
