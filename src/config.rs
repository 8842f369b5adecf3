//! Persisted client configuration
//!
//! A single YAML file carries the broker connection settings, the device
//! identity (hex-encoded key material), and the addresses of the
//! registration authority and key-management platform. Provisioning rewrites
//! the `user` section in place, so the file stays human-inspectable.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yml";

/// Accepted range for `auth.nonce_len`.
pub const MIN_NONCE_LEN: usize = 1;
pub const MAX_NONCE_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Broker connection settings. Consumed by the transport adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker URL, e.g. `mqtt://broker:1883`
    pub server_addr: String,
    pub client_id: String,
    /// Human-readable device name, sent as `deviceName` and registered as `username`
    pub client_name: String,
    pub topic: String,
    pub qos: u8,
    /// Seconds between keepalive packets
    pub keepalive: u16,
    /// Milliseconds between connection attempts
    pub connect_retry_delay: u16,
    pub write_to_stdout: bool,
    pub write_to_disk: bool,
    pub output_filename: String,
    pub debug: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            client_id: String::new(),
            client_name: String::new(),
            topic: String::new(),
            qos: 0,
            keepalive: 30,
            connect_retry_delay: 10_000,
            write_to_stdout: true,
            write_to_disk: false,
            output_filename: String::new(),
            debug: false,
        }
    }
}

/// Device identity as stored on disk. Key fields are hex of the
/// DER encoding; an empty string means "absent".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub uid: String,
    pub hid: u8,
    pub eid: String,
    pub device_type: String,
    pub encrypt_private_key: String,
    pub sign_private_key: String,
    pub encrypt_master_public_key: String,
    pub sign_master_public_key: String,
}

impl UserConfig {
    /// Copy of this record with both private-key fields cleared.
    pub fn without_private_keys(&self) -> Self {
        Self {
            encrypt_private_key: String::new(),
            sign_private_key: String::new(),
            ..self.clone()
        }
    }
}

/// Registration authority and key-management platform endpoints.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddrConfig {
    /// `host:port` (or full URL) of the registration authority
    pub ra: String,
    /// `host:port` (or full URL) of the key-management platform
    pub platform: String,
}

fn base_url(addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

impl AddrConfig {
    pub fn register_url(&self) -> String {
        format!("{}/register", base_url(&self.ra))
    }

    /// Key query URL without the `id` query parameter.
    pub fn keys_url(&self) -> String {
        format!(
            "{}/identificationinfo/identificationinfo/keys",
            base_url(&self.platform)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub poll_interval_secs: u64,
    /// Upper bound on key-platform polls. `None` polls until keys are issued.
    pub max_polls: Option<u32>,
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
    /// Identity the provisioning seed is encrypted to
    pub seed_label: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
            max_polls: None,
            request_timeout_secs: 5,
            seed_label: "pkg".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// MQTT v5 authentication method name
    pub method: String,
    /// Length in bytes of the client challenge nonce
    pub nonce_len: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: "sm9".to_string(),
            nonce_len: 8,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    pub level: String,
    /// Write log output to this file instead of stderr
    pub path: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            path: None,
        }
    }
}

/// Top-level configuration record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    pub user: UserConfig,
    pub addr: AddrConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the rest of the crate cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_NONCE_LEN..=MAX_NONCE_LEN).contains(&self.auth.nonce_len) {
            return Err(ConfigError::InvalidValue(format!(
                "auth.nonce_len must be {}..={}, got {}",
                MIN_NONCE_LEN, MAX_NONCE_LEN, self.auth.nonce_len
            )));
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::SerializationError(e.to_string()))
    }

    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&data)
    }

    /// Persist to a YAML file, creating the parent directory if needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::IoError(e.to_string()))?;
            }
        }

        let yaml = self.to_yaml()?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }
}
