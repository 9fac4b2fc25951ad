// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{CourierError, Result};
use crate::rate_limit::RateLimitConfig;
use crate::relay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(s)
    }
}

/// Which optional signer integrations are switched on. The in-memory
/// custodian is always available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureFlags {
    pub extension_signer: bool,
    pub companion_app: bool,
    pub hardware_token: bool,
    pub threshold_signing: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            extension_signer: true,
            companion_app: true,
            hardware_token: false,
            threshold_signing: false,
        }
    }
}

impl FeatureFlags {
    pub fn all() -> Self {
        Self {
            extension_signer: true,
            companion_app: true,
            hardware_token: true,
            threshold_signing: true,
        }
    }
}

/// Network timeouts, in milliseconds in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    #[serde(deserialize_with = "deserialize_millis")]
    pub discovery_ms: u64,
    #[serde(deserialize_with = "deserialize_millis")]
    pub publish_ms: u64,
    #[serde(deserialize_with = "deserialize_millis")]
    pub bridge_request_ms: u64,
    #[serde(deserialize_with = "deserialize_millis")]
    pub guardian_pacing_ms: u64,
    #[serde(deserialize_with = "deserialize_millis")]
    pub threshold_round_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            discovery_ms: 2_500,
            publish_ms: 10_000,
            bridge_request_ms: 45_000,
            guardian_pacing_ms: 100,
            threshold_round_ms: 30_000,
        }
    }
}

impl Timeouts {
    pub fn discovery(&self) -> Duration {
        Duration::from_millis(self.discovery_ms)
    }

    pub fn publish(&self) -> Duration {
        Duration::from_millis(self.publish_ms)
    }

    pub fn bridge_request(&self) -> Duration {
        Duration::from_millis(self.bridge_request_ms)
    }

    pub fn guardian_pacing(&self) -> Duration {
        Duration::from_millis(self.guardian_pacing_ms)
    }

    pub fn threshold_round(&self) -> Duration {
        Duration::from_millis(self.threshold_round_ms)
    }
}

fn deserialize_relays<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let relays: Vec<String> = Vec::deserialize(deserializer)?;
    for url in &relays {
        relay::validate_relay_url(url).map_err(|reason| {
            serde::de::Error::custom(format!("Invalid relay URL '{url}': {reason}"))
        })?;
    }
    Ok(relays)
}

fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u64::deserialize(deserializer)?;
    if value == 0 {
        return Err(serde::de::Error::custom("timeout must be greater than 0"));
    }
    Ok(value)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CourierConfig {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default, deserialize_with = "deserialize_relays")]
    pub relays: Vec<String>,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl CourierConfig {
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        const MAX_CONFIG_SIZE: u64 = 1024 * 1024;
        let metadata = std::fs::metadata(path).map_err(|e| {
            CourierError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_SIZE {
            return Err(CourierError::Config("Config file too large".into()));
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            CourierError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CourierError::Config(format!("Invalid config: {e}")))
    }

    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("courier").join("config.toml"))
            .ok_or(CourierError::ConfigDirNotFound)
    }

    /// Configured relays, or the built-in defaults when none are set.
    pub fn default_relays(&self) -> Vec<String> {
        if self.relays.is_empty() {
            relay::default_relays()
        } else {
            self.relays.clone()
        }
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        self.rate_limit.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let content = r#"
log_level = "debug"
relays = ["wss://relay.damus.io", "wss://nos.lol"]

[features]
hardware_token = true
threshold_signing = true

[timeouts]
discovery_ms = 1000
bridge_request_ms = 60000

[rate_limit]
max_per_minute = 5
max_per_hour = 50
max_per_day = 500
"#;
        let config = CourierConfig::parse(content).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.relays.len(), 2);
        assert!(config.features.hardware_token);
        assert!(config.features.companion_app);
        assert_eq!(config.timeouts.discovery(), Duration::from_secs(1));
        assert_eq!(config.timeouts.publish(), Duration::from_secs(10));
        assert_eq!(config.rate_limit(), RateLimitConfig::strict());
    }

    #[test]
    fn test_parse_empty_config() {
        let config = CourierConfig::parse("").unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.default_relays(), relay::default_relays());
        assert_eq!(config.timeouts, Timeouts::default());
        assert_eq!(config.timeouts.discovery(), Duration::from_millis(2500));
        assert_eq!(config.timeouts.bridge_request(), Duration::from_secs(45));
    }

    #[test]
    fn test_invalid_relay() {
        assert!(CourierConfig::parse(r#"relays = ["https://invalid.com"]"#).is_err());
        assert!(CourierConfig::parse(r#"relays = ["wss://127.0.0.1"]"#).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(CourierConfig::parse(r#"unknown_field = "value""#).is_err());
        assert!(CourierConfig::parse("[features]\nsmoke_signals = true").is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(CourierConfig::parse("[timeouts]\npublish_ms = 0").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "log_level = \"warn\"\n").unwrap();

        let config = CourierConfig::from_file(&path).unwrap();
        assert_eq!(config.log_level, LogLevel::Warn);
        assert!(CourierConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
