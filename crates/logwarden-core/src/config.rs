//! TOML configuration for the daemon.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{self, InstanceConfig};

/// Default control-channel port; on bind failure one retry is attempted
/// on port + 1.
pub const DEFAULT_CONTROL_PORT: u16 = 17653;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level daemon configuration.
///
/// ```toml
/// control_port = 17653
/// key_to_send = "G"
///
/// [[instance]]
/// name = "Nebula Main"
/// log_path = "/home/dom/instances/nebula-main/logs/latest.log"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Key the local action sends to the instance window.
    #[serde(default = "default_key_to_send")]
    pub key_to_send: String,
    #[serde(default, rename = "instance")]
    pub instances: Vec<InstanceConfig>,
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_key_to_send() -> String {
    "G".to_owned()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            control_port: default_control_port(),
            key_to_send: default_key_to_send(),
            instances: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file, deriving missing instance ids from names.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&text)?;
        for instance in &mut config.instances {
            if instance.instance_id.is_empty() {
                instance.instance_id = types::instance_id_for(&instance.name);
            }
        }
        Ok(config)
    }
}
