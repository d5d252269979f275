//! Redelivery backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{PipelineError, Result};

/// Retry limits and exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delivery attempt at which a message is dead-lettered unprocessed.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PipelineError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(PipelineError::Config(
                "multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(PipelineError::Config(
                "initial_backoff must not exceed max_backoff".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before redelivering after `attempt`.
    ///
    /// Attempt 0 gets the initial backoff. Otherwise the initial backoff is
    /// multiplied `attempt` times, stopping at `max_backoff` as soon as the
    /// running product reaches it. No jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_backoff;
        }
        if self.multiplier <= 1.0 {
            return self.initial_backoff.min(self.max_backoff);
        }

        let max = self.max_backoff.as_secs_f64();
        let mut current = self.initial_backoff.as_secs_f64();
        for _ in 0..attempt {
            current *= self.multiplier;
            if current >= max {
                return self.max_backoff;
            }
        }
        Duration::from_secs_f64(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(8));
        assert_eq!(config.backoff(5), Duration::from_secs(32));
        assert_eq!(config.backoff(6), Duration::from_secs(60));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn backoff_is_non_decreasing_and_bounded() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(150),
            max_backoff: Duration::from_secs(5),
            multiplier: 1.7,
        };
        let mut previous = config.backoff(0);
        for attempt in 1..40 {
            let next = config.backoff(attempt);
            assert!(next >= previous);
            assert!(next <= config.max_backoff);
            previous = next;
        }
    }

    #[test]
    fn validate_rejects_bad_settings() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(
            RetryConfig {
                max_attempts: 0,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            RetryConfig {
                multiplier: 0.5,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            RetryConfig {
                initial_backoff: Duration::from_secs(120),
                ..Default::default()
            }
            .validate()
            .is_err()
        );
    }
}
