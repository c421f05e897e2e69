//! Session manager configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_millis;
use super::SessionConfig;
use crate::error::ConfigError;

/// Configuration for a session manager and the sessions it creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Settings applied to every session
    pub session: SessionConfig,

    /// Bound on the graceful phase of a full shutdown
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Interval between update passes when driven by a message channel
    #[serde(with = "duration_millis")]
    pub update_interval: Duration,

    /// Tries before session id allocation gives up
    pub max_id_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            shutdown_timeout: Duration::from_millis(5000),
            update_interval: Duration::from_millis(10),
            max_id_attempts: 4096,
        }
    }
}

impl ManagerConfig {
    /// Check the values a manager cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_id_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_id_attempts must be at least 1".to_string(),
            ));
        }
        if self.update_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "update_interval must be non-zero".to_string(),
            ));
        }
        self.session.validate()
    }
}
