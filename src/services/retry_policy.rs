//! services/retry_policy.rs
//! Backoff exponencial con tope y jitter para reintentos por destinatario.

use std::time::Duration;

use rand::Rng;

use crate::config::dispatch_config::DispatchConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &DispatchConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms.max(cfg.retry_base_delay_ms)),
            jitter_factor: cfg.retry_jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Espera antes del siguiente intento: `min(base * 2^(n-1), max) * (1 ± jitter)`,
    /// con `n` = intentos ya realizados.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let jitter_range = delay.as_secs_f64() * self.jitter_factor;
        if jitter_range <= 0.0 {
            return delay;
        }
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
    }
}
