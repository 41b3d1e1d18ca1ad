//! Configuration of the cache manager.

use crate::{
    cache::{CacheIndex, ConfigEntry},
    error::{Error, Result},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Option key a cache entry may set to override the global refresh interval.
pub const REFRESH_INTERVAL_MS: &str = "refresh_interval_ms";

/// Which caches to open and how often to refresh them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether the manager opens any cache at all.
    #[serde(default = "default_open")]
    pub open: bool,
    /// Caches to open, in order.
    #[serde(default = "default_resources")]
    pub resources: Vec<ConfigEntry>,
    /// Interval between background refreshes, in milliseconds on the wire.
    #[serde(default = "default_refresh_interval", with = "duration_ms")]
    pub refresh_interval: Duration,
}

fn default_open() -> bool {
    true
}

fn default_resources() -> Vec<ConfigEntry> {
    CacheIndex::ALL
        .iter()
        .map(|index| ConfigEntry::new(index.as_str()))
        .collect()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            open: default_open(),
            resources: default_resources(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl CacheConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CacheConfig = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfiguration(format!("Failed to parse cache config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_resources(mut self, resources: Vec<ConfigEntry>) -> Self {
        self.resources = resources;
        self
    }

    /// Reject a zero refresh interval and duplicate entries.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval.is_zero() {
            return Err(Error::InvalidConfiguration(
                "refresh_interval must be greater than zero".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &self.resources {
            if !seen.insert(entry.name.as_str()) {
                return Err(Error::InvalidConfiguration(format!(
                    "cache '{}' listed twice",
                    entry.name
                )));
            }
            if entry.option.get_u64(REFRESH_INTERVAL_MS) == Some(0) {
                return Err(Error::InvalidConfiguration(format!(
                    "cache '{}' has a zero refresh interval",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    /// Refresh interval for `entry`, honoring its override.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] when the resolved interval is
    /// zero.
    pub fn interval_for(&self, entry: &ConfigEntry) -> Result<Duration> {
        let period = entry
            .option
            .get_duration_ms(REFRESH_INTERVAL_MS)
            .unwrap_or(self.refresh_interval);
        if period.is_zero() {
            return Err(Error::InvalidConfiguration(format!(
                "cache '{}' has a zero refresh interval",
                entry.name
            )));
        }
        Ok(period)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;

    #[test]
    fn test_default_opens_every_cache() {
        let config = CacheConfig::default();
        assert!(config.open);
        assert_eq!(config.resources.len(), CacheIndex::ALL.len());
        assert_eq!(config.refresh_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let config = CacheConfig::from_json(
            r#"{
                "refresh_interval": 250,
                "resources": [
                    {"name": "strategyRule", "option": {"refresh_interval_ms": 50}},
                    {"name": "roles"}
                ]
            }"#,
        )
        .unwrap();

        assert!(config.open);
        assert_eq!(config.refresh_interval, Duration::from_millis(250));
        assert_eq!(
            config.interval_for(&config.resources[0]).unwrap(),
            Duration::from_millis(50)
        );
        assert_eq!(
            config.interval_for(&config.resources[1]).unwrap(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            CacheConfig::from_json("{ not json"),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(CacheConfig::from_json(r#"{"refresh_interval": 0}"#).is_err());

        let dup = CacheConfig::default()
            .with_resources(vec![ConfigEntry::new("roles"), ConfigEntry::new("roles")]);
        assert!(dup.validate().is_err());

        let zero = CacheConfig::default().with_resources(vec![ConfigEntry::new("roles")
            .with_option(CacheOptions::new().with(REFRESH_INTERVAL_MS, 0))]);
        assert!(zero.validate().is_err());
        assert!(matches!(
            zero.interval_for(&zero.resources[0]),
            Err(Error::InvalidConfiguration(_))
        ));

        let unset = CacheConfig::default().with_refresh_interval(Duration::ZERO);
        assert!(unset.interval_for(&ConfigEntry::new("roles")).is_err());
    }

    #[test]
    fn test_round_trip_uses_millis() {
        let config = CacheConfig::default().with_refresh_interval(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["refresh_interval"], 1500);
    }
}
