//! Round-trip estimation and retransmission backoff

use std::time::Duration;

use devbus_core::config::RetransmitConfig;

/// Exponentially weighted moving average of acknowledgement round trips
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    /// Current estimate in milliseconds
    estimate_ms: f64,
    /// Weight of a new sample
    alpha: f64,
}

impl RttEstimator {
    /// Create an estimator seeded with `initial`
    pub fn new(initial: Duration, alpha: f64) -> Self {
        Self {
            estimate_ms: initial.as_secs_f64() * 1000.0,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    /// Create an estimator from configuration
    pub fn from_config(config: &RetransmitConfig) -> Self {
        Self::new(config.initial_rtt, config.smoothing_factor())
    }

    /// Fold one round-trip sample into the estimate
    pub fn sample(&mut self, elapsed: Duration) {
        let sample_ms = elapsed.as_secs_f64() * 1000.0;
        self.estimate_ms = self.alpha * sample_ms + (1.0 - self.alpha) * self.estimate_ms;
    }

    /// Current estimate
    pub fn estimate(&self) -> Duration {
        Duration::from_secs_f64(self.estimate_ms.max(0.0) / 1000.0)
    }
}

/// Capped exponential retransmission deadline
///
/// After `rounds` retransmissions without progress, the oldest
/// unacknowledged frame is resent once
/// `min(max(rtt, min_delay) * 2^(rounds + 1), max_delay)` has passed since
/// its last transmission.
#[derive(Debug, Clone, Copy)]
pub struct RetransmitBackoff {
    min_delay: Duration,
    max_delay: Duration,
    max_retransmits: u32,
}

impl RetransmitBackoff {
    /// Create a backoff from configuration
    pub fn from_config(config: &RetransmitConfig) -> Self {
        Self::new(config.min_delay, config.max_delay, config.max_retransmits)
    }

    /// Create a backoff with custom parameters
    pub fn new(min_delay: Duration, max_delay: Duration, max_retransmits: u32) -> Self {
        Self {
            min_delay,
            max_delay,
            max_retransmits,
        }
    }

    /// Deadline for the next retransmission round
    pub fn timeout(&self, rtt: Duration, rounds: u32) -> Duration {
        let base = rtt.max(self.min_delay);
        let multiplier = 2u32.saturating_pow(rounds.saturating_add(1));
        base.saturating_mul(multiplier).min(self.max_delay)
    }

    /// Whether `rounds` retransmissions without progress is the limit
    pub fn exhausted(&self, rounds: u32) -> bool {
        rounds >= self.max_retransmits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> RetransmitBackoff {
        RetransmitBackoff::from_config(&RetransmitConfig::default())
    }

    #[test]
    fn test_backoff_doubles_from_floor() {
        let backoff = backoff();
        let rtt = Duration::from_millis(20);

        assert_eq!(backoff.timeout(rtt, 0), Duration::from_millis(200));
        assert_eq!(backoff.timeout(rtt, 1), Duration::from_millis(400));
        assert_eq!(backoff.timeout(rtt, 2), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_max() {
        let backoff = backoff();
        let rtt = Duration::from_millis(300);

        assert_eq!(backoff.timeout(rtt, 1), Duration::from_millis(1200));
        assert_eq!(backoff.timeout(rtt, 2), Duration::from_millis(2000)); // Capped at max
        assert_eq!(backoff.timeout(rtt, 31), Duration::from_millis(2000)); // Still capped
    }

    #[test]
    fn test_exhaustion() {
        let backoff = backoff();
        assert!(!backoff.exhausted(4));
        assert!(backoff.exhausted(5));
    }

    #[test]
    fn test_rtt_moves_two_thirds_toward_sample() {
        let mut rtt = RttEstimator::from_config(&RetransmitConfig::default());
        assert_eq!(rtt.estimate(), Duration::from_millis(50));

        rtt.sample(Duration::from_millis(110));
        let estimate = rtt.estimate().as_secs_f64() * 1000.0;
        assert!((estimate - 90.0).abs() < 0.001);
    }
}
