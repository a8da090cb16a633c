// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Cache configuration and its storage port.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Logical key the cache configuration is stored under.
pub const CONFIG_KEY: &str = "refcache";

/// Diagnostics level of a cache instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// Data-loss warnings on.
    #[default]
    Development,
    /// All diagnostics skipped.
    Production,
}

/// How leaf values (fields without a selection set) are stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafValues {
    /// Structural deep copy; JSON objects stay mergeable.
    #[default]
    Copy,
    /// Containers cloned once into an `Arc`, then shared and treated as
    /// atomic by the merge. Later copies are reference-count bumps.
    Shared,
}

/// Eviction scheduling knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Delay of the fallback job scheduled when an in-place update fails.
    pub fallback_delay_ms: u64,
    /// Interval between job-queue ticks.
    pub tick_interval_ms: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            fallback_delay_ms: 1_000,
            tick_interval_ms: 250,
        }
    }
}

/// Settings for one cache instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Diagnostics level.
    pub mode: BuildMode,
    /// Leaf storage strategy.
    pub leaf_values: LeafValues,
    /// Consult the freshness probe before merging an entity.
    ///
    /// Only sound when nothing mutates the store between the probe's read and
    /// the write, so it stays off unless explicitly enabled.
    pub freshness_short_circuit: bool,
    /// Field carrying an entity's absolute expiry (Unix milliseconds).
    pub ttl_field: String,
    /// Maximum characters of JSON included in diagnostics.
    pub snapshot_limit: usize,
    /// Eviction scheduling.
    pub eviction: EvictionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: BuildMode::Development,
            leaf_values: LeafValues::Copy,
            freshness_short_circuit: false,
            ttl_field: "maxAge".to_owned(),
            snapshot_limit: 1_000,
            eviction: EvictionConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Returns `true` when diagnostics (data-loss warnings) should run.
    pub fn diagnostics_enabled(&self) -> bool {
        self.mode == BuildMode::Development
    }

    /// Production settings: no diagnostics, shared leaves.
    pub fn production() -> Self {
        Self {
            mode: BuildMode::Production,
            leaf_values: LeafValues::Shared,
            ..Self::default()
        }
    }
}

/// Where serialized [`CacheConfig`] documents live.
///
/// Implementations move bytes only; parsing stays in [`ConfigService`].
pub trait ConfigStore {
    /// Bytes saved under `key`, or [`ConfigError::Missing`].
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Overwrite whatever is saved under `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Failure to read or persist configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing saved under the key.
    #[error("[CONFIG_MISSING] no configuration saved under `{0}`")]
    Missing(String),
    /// The backing store failed.
    #[error("[CONFIG_IO] {0}")]
    Io(#[from] std::io::Error),
    /// The saved document is not a valid configuration.
    #[error("[CONFIG_PARSE] {0}")]
    Parse(#[from] serde_json::Error),
    /// The store could not be reached at all.
    #[error("[CONFIG_UNAVAILABLE] {0}")]
    Unavailable(String),
}

/// Reads and writes the [`CacheConfig`] kept under one key of a [`ConfigStore`].
#[derive(Debug)]
pub struct ConfigService<S> {
    store: S,
    key: String,
}

impl<S: ConfigStore> ConfigService<S> {
    /// Service over the document at [`CONFIG_KEY`].
    pub fn new(store: S) -> Self {
        Self::with_key(store, CONFIG_KEY)
    }

    /// Service over the document at `key`.
    pub fn with_key(store: S, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The saved configuration, if any. An empty document counts as unsaved.
    ///
    /// # Errors
    ///
    /// Store failures other than [`ConfigError::Missing`], and documents that
    /// do not parse.
    pub fn saved(&self) -> Result<Option<CacheConfig>, ConfigError> {
        let bytes = match self.store.load_raw(&self.key) {
            Ok(bytes) if bytes.is_empty() => return Ok(None),
            Ok(bytes) => bytes,
            Err(ConfigError::Missing(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// The effective configuration: the saved one, or the defaults.
    ///
    /// # Errors
    ///
    /// As [`saved`](Self::saved).
    pub fn load(&self) -> Result<CacheConfig, ConfigError> {
        let config = self.saved()?;
        if config.is_none() {
            debug!(key = self.key.as_str(), "no saved configuration, using defaults");
        }
        Ok(config.unwrap_or_default())
    }

    /// Persist `config` as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn save(&self, config: &CacheConfig) -> Result<(), ConfigError> {
        let data = serde_json::to_vec_pretty(config)?;
        self.store.save_raw(&self.key, &data)
    }

    /// Save the defaults unless a configuration is already saved, and return
    /// the effective configuration.
    ///
    /// # Errors
    ///
    /// As [`saved`](Self::saved) and [`save`](Self::save).
    pub fn init(&self) -> Result<CacheConfig, ConfigError> {
        if let Some(existing) = self.saved()? {
            return Ok(existing);
        }
        let defaults = CacheConfig::default();
        self.save(&defaults)?;
        debug!(key = self.key.as_str(), "default configuration saved");
        Ok(defaults)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"mode":"production","eviction":{"fallback_delay_ms":50}}"#).unwrap();
        assert!(!config.diagnostics_enabled());
        assert_eq!(config.ttl_field, "maxAge");
        assert_eq!(config.eviction.fallback_delay_ms, 50);
        assert_eq!(config.eviction.tick_interval_ms, EvictionConfig::default().tick_interval_ms);
    }

    #[test]
    fn defaults_are_diagnostic_and_conservative() {
        let config = CacheConfig::default();
        assert!(config.diagnostics_enabled());
        assert!(!config.freshness_short_circuit);
        assert_eq!(config.leaf_values, LeafValues::Copy);
        assert_eq!(CacheConfig::production().leaf_values, LeafValues::Shared);
    }
}
