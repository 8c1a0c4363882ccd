use std::time::Duration;

use rand::Rng;

use runloop_providers::ProviderErrorKind;

use crate::config::ModelRetryConfig;

/// Upper bound of the random spread added to rate-limit waits.
const RATE_LIMIT_SPREAD_MS: u64 = 5_000;

/// Error-aware backoff for model turns.
#[derive(Debug, Clone)]
pub struct ModelRetryPolicy {
    config: ModelRetryConfig,
}

impl ModelRetryPolicy {
    pub fn new(config: ModelRetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// `attempts_made` counts attempts already run, including the failed one.
    pub fn should_retry(&self, kind: ProviderErrorKind, attempts_made: u32) -> bool {
        kind != ProviderErrorKind::Authentication && attempts_made < self.max_attempts()
    }

    /// Wait before retry number `retry` (0 for the first retry).
    pub fn delay_for(&self, kind: ProviderErrorKind, retry: u32) -> Duration {
        let mut rng = rand::thread_rng();
        match kind {
            ProviderErrorKind::RateLimit => {
                let spread = rng.gen_range(0..=RATE_LIMIT_SPREAD_MS);
                Duration::from_millis(self.config.rate_limit_delay_ms + spread)
            }
            ProviderErrorKind::Timeout => Duration::from_millis(self.exponential_ms(retry) as u64),
            _ => {
                let base = self.exponential_ms(retry);
                let jitter = base * self.config.jitter_factor * rng.gen_range(-1.0..=1.0);
                let ms = (base + jitter).clamp(0.0, self.config.max_delay_ms as f64);
                Duration::from_millis(ms as u64)
            }
        }
    }

    fn exponential_ms(&self, retry: u32) -> f64 {
        let exp = self.config.exponential_base.powi(retry.min(32) as i32);
        (self.config.base_delay_ms as f64 * exp).min(self.config.max_delay_ms as f64)
    }
}
