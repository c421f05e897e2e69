//! Per-session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_millis;
use crate::error::ConfigError;

/// Largest window depth; the advertised window must fit the header's u16
const MAX_WINDOW_DEPTH: usize = u16::MAX as usize;

/// Configuration for a single session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Slots in each sliding window
    pub window_depth: usize,

    /// Received-but-unacknowledged frames that force an early Ack
    pub ack_threshold: u64,

    /// Upper bound on waits for control messages and disconnection events
    #[serde(with = "duration_millis")]
    pub control_timeout: Duration,

    /// Answer a frame that overruns the receive window with a Rst
    pub reset_on_window_violation: bool,

    /// Retransmission tuning
    pub retransmit: RetransmitConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_depth: 128,
            ack_threshold: 5,
            control_timeout: Duration::from_millis(1000),
            reset_on_window_violation: false,
            retransmit: RetransmitConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Check the values a session cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_depth < 2 || self.window_depth > MAX_WINDOW_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "window_depth must be between 2 and {}, got {}",
                MAX_WINDOW_DEPTH, self.window_depth
            )));
        }
        if self.ack_threshold == 0 {
            return Err(ConfigError::Invalid(
                "ack_threshold must be at least 1".to_string(),
            ));
        }
        self.retransmit.validate()
    }

    /// Receive availability advertised to a peer before any data arrives
    pub fn initial_advertised_window(&self) -> u16 {
        (self.window_depth / 2).clamp(1, MAX_WINDOW_DEPTH) as u16
    }
}

/// Retransmission and round-trip estimation settings
///
/// The retransmit deadline for the oldest unacknowledged frame after `n`
/// rounds without progress is `min(max(rtt, min_delay) * 2^(n+1), max_delay)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetransmitConfig {
    /// RTT estimate before the first sample
    #[serde(with = "duration_millis")]
    pub initial_rtt: Duration,

    /// Floor applied to the RTT estimate
    #[serde(with = "duration_millis")]
    pub min_delay: Duration,

    /// Ceiling on any single retransmit deadline
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Rounds without progress before the session is closed
    pub max_retransmits: u32,

    /// Duplicate Acks that trigger an immediate retransmit
    pub fast_retransmit_threshold: u32,

    /// Samples in the RTT moving average (alpha = 2 / (n + 1))
    pub rtt_smoothing_window: u32,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            initial_rtt: Duration::from_millis(50),
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2000),
            max_retransmits: 5,
            fast_retransmit_threshold: 3,
            rtt_smoothing_window: 2,
        }
    }
}

impl RetransmitConfig {
    /// Check the values retransmission cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_delay > self.max_delay {
            return Err(ConfigError::Invalid(format!(
                "retransmit min_delay ({:?}) exceeds max_delay ({:?})",
                self.min_delay, self.max_delay
            )));
        }
        if self.max_retransmits == 0 {
            return Err(ConfigError::Invalid(
                "max_retransmits must be at least 1".to_string(),
            ));
        }
        if self.fast_retransmit_threshold == 0 {
            return Err(ConfigError::Invalid(
                "fast_retransmit_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Weight given to a new RTT sample
    pub fn smoothing_factor(&self) -> f64 {
        2.0 / (f64::from(self.rtt_smoothing_window) + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.window_depth, 128);
        assert_eq!(config.initial_advertised_window(), 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_smoothing_factor() {
        let config = RetransmitConfig::default();
        assert!((config.smoothing_factor() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejects_tiny_window() {
        let config = SessionConfig {
            window_depth: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_inverted_delays() {
        let config = RetransmitConfig {
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            window_depth = 16

            [retransmit]
            max_delay = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.window_depth, 16);
        assert_eq!(config.ack_threshold, 5);
        assert_eq!(config.retransmit.max_delay, Duration::from_millis(500));
        assert_eq!(config.retransmit.min_delay, Duration::from_millis(100));
    }
}
