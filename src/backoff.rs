//! Reconnect backoff strategies.

use std::time::Duration;

use rand::Rng;

use crate::error::{ClientError, ClientResult};

/// Policy deciding how long to wait before a reconnect attempt.
///
/// `attempt` is the number of attempts already made this outage (0 for the
/// first retry). Returning an error stops the reconnect loop for good; the
/// error is surfaced through the `on_error` handler.
pub trait BackoffStrategy: Send + Sync {
    fn next_delay(&self, attempt: u32) -> ClientResult<Duration>;
}

/// Exponential backoff with jitter and an optional attempt limit.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Random jitter factor (0.0-1.0) blended into each delay.
    pub jitter: f64,
    /// Maximum number of attempts (None = retry forever).
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
            factor: 2.0,
            jitter: 0.1,
            max_attempts: None,
        }
    }
}

impl ExponentialBackoff {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("Initial reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("Max reconnect delay must be >= initial reconnect delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> ClientResult<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return Err(ClientError::transport(format!(
                    "reconnect attempts exhausted after {max} tries"
                )));
            }
        }

        let initial = self.initial_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exponent = self.factor.powf(f64::from(attempt));
        let base = (initial * exponent).min(max);

        if self.jitter == 0.0 {
            return Ok(Duration::from_secs_f64(base));
        }

        let mut rng = rand::rng();
        let randomized = rng.random_range(0.0..=base);
        let blended = base * (1.0 - self.jitter) + randomized * self.jitter;
        Ok(Duration::from_secs_f64(blended))
    }
}
