//! Store configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::PoolSettings;
use crate::error::{Result, StoreError};
use crate::types::ShardId;

/// File name looked up by [`StoreConfig::read_from`].
pub const CONFIG_FILE: &str = "store_config.json";

/// Tunables for one [`DocumentStore`](crate::store::DocumentStore).
///
/// Every field has a default, so a partial JSON file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Client connections kept per endpoint.
    pub pool_size: usize,
    /// Socket timeout for one round trip.
    pub network_timeout_ms: u64,
    /// How long a multi-shard read waits for slow shards.
    pub fanout_timeout_ms: u64,
    /// Memoization window of the recent-documents listing.
    pub recent_ttl_ms: u64,
    /// Size of the recent-documents listing.
    pub recent_limit: usize,
    /// Shard holding documents addressed by old numeric ids.
    pub legacy_shard: ShardId,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pool_size: 20,
            network_timeout_ms: 3000,
            fanout_timeout_ms: 2000,
            recent_ttl_ms: 2000,
            recent_limit: 25,
            legacy_shard: ShardId(1),
        }
    }
}

impl StoreConfig {
    /// Read config from `dir`. Returns None if the file doesn't exist.
    pub fn read_from(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Write config to `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(StoreError::Config("pool_size must be at least 1".to_string()));
        }
        if self.network_timeout_ms == 0 || self.fanout_timeout_ms == 0 {
            return Err(StoreError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            pool_size: self.pool_size,
            network_timeout: Duration::from_millis(self.network_timeout_ms),
        }
    }

    pub fn fanout_timeout(&self) -> Duration {
        Duration::from_millis(self.fanout_timeout_ms)
    }

    pub fn recent_ttl(&self) -> Duration {
        Duration::from_millis(self.recent_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StoreConfig {
            pool_size: 4,
            legacy_shard: ShardId(7),
            ..Default::default()
        };
        config.write_to(dir.path()).unwrap();

        let loaded = StoreConfig::read_from(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_read_nonexistent() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(StoreConfig::read_from(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"fanout_timeout_ms": 500}"#).unwrap();

        let loaded = StoreConfig::read_from(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.fanout_timeout(), Duration::from_millis(500));
        assert_eq!(loaded.pool_size, 20);
        assert_eq!(loaded.legacy_shard, ShardId(1));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"pool_size": 0}"#).unwrap();
        assert!(matches!(StoreConfig::read_from(dir.path()), Err(StoreError::Config(_))));

        std::fs::write(dir.path().join(CONFIG_FILE), "not json").unwrap();
        assert!(matches!(StoreConfig::read_from(dir.path()), Err(StoreError::Json(_))));
    }

    #[test]
    fn test_pool_settings() {
        let settings = StoreConfig::default().pool_settings();
        assert_eq!(settings, PoolSettings::default());
    }
}
