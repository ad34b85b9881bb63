/// Driver configuration
///
/// All timeouts are stored in milliseconds and only become a `Duration` at the
/// point where a gate is waited on.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default bound on the service registration wait in `start()`
pub const DEFAULT_REGISTRATION_TIMEOUT_MS: u64 = 10_000;

/// Default bound on each chunk's acknowledgement wait
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 10_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid timeout for {0}: must be > 0 ms")]
    InvalidTimeout(&'static str),
}

/// GATT driver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Registration wait bound in milliseconds (default 10000)
    pub registration_timeout_ms: u64,
    /// Per-chunk acknowledgement wait bound in milliseconds (default 10000)
    pub ack_timeout_ms: u64,
    /// Ask the host for a connection-oriented listener on start
    pub enable_l2cap: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            registration_timeout_ms: DEFAULT_REGISTRATION_TIMEOUT_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            enable_l2cap: true,
        }
    }
}

impl DriverConfig {
    /// Set the registration timeout in milliseconds
    pub fn with_registration_timeout_ms(mut self, ms: u64) -> Self {
        self.registration_timeout_ms = ms;
        self
    }

    /// Set the per-chunk acknowledgement timeout in milliseconds
    pub fn with_ack_timeout_ms(mut self, ms: u64) -> Self {
        self.ack_timeout_ms = ms;
        self
    }

    /// Enable or disable the L2CAP listener
    pub fn with_l2cap(mut self, enabled: bool) -> Self {
        self.enable_l2cap = enabled;
        self
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registration_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("registration_timeout_ms"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("ack_timeout_ms"));
        }
        Ok(())
    }
}
