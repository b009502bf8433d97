//! Configuration system for valvelink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $VALVELINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/valvelink/config.toml
//!   3. ~/.config/valvelink/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration, handed to the Orchestrator at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValvelinkConfig {
    pub device: DeviceConfig,
    pub ble: BleConfig,
    pub mqtt: MqttConfig,
    pub backoff: BackoffConfig,
    pub recovery: RecoveryDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Name advertised over BLE.
    pub ble_name: String,
    /// Proof-of-possession string, 6..64 bytes, ASCII alnum plus `-_`.
    pub pop_string: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// MTU assumed before negotiation (ATT default).
    pub initial_mtu: u16,
    /// Concurrent reassembly contexts, capped at 8.
    pub max_concurrent_frames: u8,
    pub reassembly_timeout_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_uri: String,
    pub client_id: String,
    pub topic_prefix: String,
    /// 0..2.
    pub qos: u8,
    pub keepalive_secs: u16,
}

/// Shared min/max backoff bounds. Each transport scales these per its own
/// constants (BLE advertising backoff, BLE send back-pressure, MQTT
/// reconnect) rather than each owning a separate config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min_ms: u32,
    pub max_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryDefaults {
    pub max_consecutive_errors: u32,
    pub recovery_cooldown_ms: u32,
    pub retry_delay_ms: u32,
    pub auto_recovery_enabled: bool,
    pub escalate_on_failure: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ValvelinkConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            ble: BleConfig::default(),
            mqtt: MqttConfig::default(),
            backoff: BackoffConfig::default(),
            recovery: RecoveryDefaults::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ble_name: "valvelink".to_string(),
            pop_string: "change_me_pop".to_string(),
        }
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            initial_mtu: 23,
            max_concurrent_frames: 8,
            reassembly_timeout_ms: 10_000,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_uri: "mqtt://localhost:1883".to_string(),
            client_id: "valvelink".to_string(),
            topic_prefix: "valvelink".to_string(),
            qos: 1,
            keepalive_secs: 60,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_ms: 1_000,
            max_ms: 32_000,
        }
    }
}

impl Default for RecoveryDefaults {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 5,
            recovery_cooldown_ms: 10_000,
            retry_delay_ms: 1_000,
            auto_recovery_enabled: true,
            escalate_on_failure: true,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("valvelink")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ValvelinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ValvelinkConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("VALVELINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ValvelinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply VALVELINK_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VALVELINK_DEVICE__BLE_NAME") {
            self.device.ble_name = v;
        }
        if let Ok(v) = std::env::var("VALVELINK_DEVICE__POP_STRING") {
            self.device.pop_string = v;
        }
        if let Ok(v) = std::env::var("VALVELINK_BLE__INITIAL_MTU") {
            if let Ok(p) = v.parse() {
                self.ble.initial_mtu = p;
            }
        }
        if let Ok(v) = std::env::var("VALVELINK_MQTT__BROKER_URI") {
            self.mqtt.broker_uri = v;
        }
        if let Ok(v) = std::env::var("VALVELINK_MQTT__CLIENT_ID") {
            self.mqtt.client_id = v;
        }
        if let Ok(v) = std::env::var("VALVELINK_MQTT__TOPIC_PREFIX") {
            self.mqtt.topic_prefix = v;
        }
        if let Ok(v) = std::env::var("VALVELINK_MQTT__QOS") {
            if let Ok(p) = v.parse() {
                self.mqtt.qos = p;
            }
        }
        if let Ok(v) = std::env::var("VALVELINK_BACKOFF__MIN_MS") {
            if let Ok(p) = v.parse() {
                self.backoff.min_ms = p;
            }
        }
        if let Ok(v) = std::env::var("VALVELINK_BACKOFF__MAX_MS") {
            if let Ok(p) = v.parse() {
                self.backoff.max_ms = p;
            }
        }
        if let Ok(v) = std::env::var("VALVELINK_RECOVERY__AUTO_RECOVERY_ENABLED") {
            self.recovery.auto_recovery_enabled = v == "true" || v == "1";
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_ble_mtu() {
        let config = ValvelinkConfig::default();
        assert_eq!(config.ble.initial_mtu, 23);
        assert_eq!(config.ble.max_concurrent_frames, 8);
    }

    #[test]
    fn default_recovery_matches_reference_defaults() {
        let config = ValvelinkConfig::default();
        assert_eq!(config.recovery.max_consecutive_errors, 5);
        assert_eq!(config.recovery.recovery_cooldown_ms, 10_000);
        assert_eq!(config.recovery.retry_delay_ms, 1_000);
        assert!(config.recovery.auto_recovery_enabled);
        assert!(config.recovery.escalate_on_failure);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp =
            std::env::temp_dir().join(format!("valvelink-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("VALVELINK_CONFIG", config_path.to_str().unwrap());
        }

        let path =
            ValvelinkConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = ValvelinkConfig::load().expect("load should succeed");
        assert_eq!(config.ble.initial_mtu, 23);

        unsafe {
            std::env::remove_var("VALVELINK_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
