use std::time::Duration;

use baton_core::config::HandoffConfig;

/// Attempt count and backoff schedule for handoff transfers.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub exponential: bool,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &HandoffConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_delay_ms),
            exponential: config.exponential_backoff,
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }

    /// Delay before retry number `retry` (0 = first retry), without jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        if !self.exponential {
            return self.base_delay;
        }
        let factor = 2u64.saturating_pow(retry);
        let ms = (self.base_delay.as_millis() as u64)
            .saturating_mul(factor)
            .min(self.max_delay.as_millis() as u64);
        Duration::from_millis(ms)
    }

    /// Nominal delay with 0.8x to 1.2x jitter, still capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry).as_millis() as f64;
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        let ms = (nominal * jitter) as u64;
        let cap = if self.exponential {
            self.max_delay
        } else {
            self.base_delay.mul_f64(1.2)
        };
        Duration::from_millis(ms).min(cap)
    }
}
