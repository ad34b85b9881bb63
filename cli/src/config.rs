// Configuration management for the blelink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blelink/config.json
// - Linux: ~/.config/blelink/config.json
// - Windows: %APPDATA%\blelink\config.json

use anyhow::{Context, Result};
use blelink_core::DriverConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local peer id served on the identity characteristic (hex)
    pub peer_id: String,

    /// GATT driver settings
    pub driver: DriverConfig,

    /// Loopback simulation settings
    pub loopback: LoopbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// MTU the simulated central negotiates
    pub mtu: u16,

    /// Delay before the simulated host answers, in milliseconds
    pub delay_ms: u64,

    /// PSM advertised for L2CAP; 0 means the host has no L2CAP support
    pub l2cap_psm: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: hex::encode(b"blelink-node"),
            driver: DriverConfig::default(),
            loopback: LoopbackConfig::default(),
        }
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            mtu: 23,
            delay_ms: 5,
            l2cap_psm: 0,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blelink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, or create a default one there
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .driver
                .validate()
                .context("Invalid driver settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Local peer id as bytes
    pub fn peer_id_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(&self.peer_id).context("peer_id is not valid hex")
    }

    /// Set a config value. The caller saves.
    ///
    /// Leaves the config untouched if the value is rejected.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        next.apply(key, value)?;
        next.driver.validate().context("Rejected setting")?;
        *self = next;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "peer_id" => {
                hex::decode(value).context("Invalid hex value")?;
                self.peer_id = value.to_lowercase();
            }
            "registration_timeout_ms" => {
                self.driver.registration_timeout_ms =
                    value.parse().context("Invalid number")?;
            }
            "ack_timeout_ms" => {
                self.driver.ack_timeout_ms = value.parse().context("Invalid number")?;
            }
            "enable_l2cap" => {
                self.driver.enable_l2cap = value.parse().context("Invalid boolean value")?;
            }
            "loopback.mtu" => {
                self.loopback.mtu = value.parse().context("Invalid MTU")?;
            }
            "loopback.delay_ms" => {
                self.loopback.delay_ms = value.parse().context("Invalid number")?;
            }
            "loopback.l2cap_psm" => {
                self.loopback.l2cap_psm = value.parse().context("Invalid PSM")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("peer_id".to_string(), self.peer_id.clone()),
            (
                "registration_timeout_ms".to_string(),
                self.driver.registration_timeout_ms.to_string(),
            ),
            (
                "ack_timeout_ms".to_string(),
                self.driver.ack_timeout_ms.to_string(),
            ),
            (
                "enable_l2cap".to_string(),
                self.driver.enable_l2cap.to_string(),
            ),
            ("loopback.mtu".to_string(), self.loopback.mtu.to_string()),
            (
                "loopback.delay_ms".to_string(),
                self.loopback.delay_ms.to_string(),
            ),
            (
                "loopback.l2cap_psm".to_string(),
                self.loopback.l2cap_psm.to_string(),
            ),
        ]
    }
}
