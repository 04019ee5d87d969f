//! config/dispatch_config.rs
//! Parámetros del dispatcher y de los rate limits por número emisor.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

mod defaults {
    pub const fn poll_interval_ms() -> u64 {
        1_000
    }
    pub const fn worker_pool_size() -> usize {
        10
    }
    pub const fn max_attempts() -> u32 {
        3
    }
    pub const fn retry_base_delay_ms() -> u64 {
        1_000
    }
    pub const fn retry_max_delay_ms() -> u64 {
        60_000
    }
    pub const fn retry_jitter_factor() -> f64 {
        0.1
    }
    pub const fn send_timeout_ms() -> u64 {
        10_000
    }
    pub const fn db_timeout_ms() -> u64 {
        5_000
    }
    pub const fn lease_secs() -> u64 {
        60
    }
    /// Throughput por defecto de WhatsApp Cloud API por número.
    pub const fn messages_per_second() -> f64 {
        80.0
    }
}

pub const MAX_WORKER_POOL_SIZE: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "defaults::worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "defaults::retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "defaults::retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "defaults::retry_jitter_factor")]
    pub retry_jitter_factor: f64,
    #[serde(default = "defaults::send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "defaults::db_timeout_ms")]
    pub db_timeout_ms: u64,
    #[serde(default = "defaults::lease_secs")]
    pub lease_secs: u64,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::poll_interval_ms(),
            worker_pool_size: defaults::worker_pool_size(),
            max_attempts: defaults::max_attempts(),
            retry_base_delay_ms: defaults::retry_base_delay_ms(),
            retry_max_delay_ms: defaults::retry_max_delay_ms(),
            retry_jitter_factor: defaults::retry_jitter_factor(),
            send_timeout_ms: defaults::send_timeout_ms(),
            db_timeout_ms: defaults::db_timeout_ms(),
            lease_secs: defaults::lease_secs(),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn pool_size(&self) -> usize {
        self.worker_pool_size.clamp(1, MAX_WORKER_POOL_SIZE)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_millis(self.db_timeout_ms.max(1))
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumberLimit {
    pub messages_per_second: f64,
    #[serde(default)]
    pub burst_size: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "defaults::messages_per_second")]
    pub messages_per_second: f64,
    /// Por defecto igual a `messages_per_second` (un segundo de ráfaga).
    #[serde(default)]
    pub burst_size: Option<f64>,
    /// 0 = sin cooldown por destinatario.
    #[serde(default)]
    pub recipient_cooldown_ms: u64,
    #[serde(default)]
    pub number_limits: HashMap<String, NumberLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_second: defaults::messages_per_second(),
            burst_size: None,
            recipient_cooldown_ms: 0,
            number_limits: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// (rate, capacity) efectivos para un número emisor.
    pub fn limits_for(&self, sending_number_id: &str) -> (f64, f64) {
        let (rate, burst) = match self.number_limits.get(sending_number_id) {
            Some(limit) => (limit.messages_per_second, limit.burst_size),
            None => (self.messages_per_second, self.burst_size),
        };
        let rate = rate.max(0.01);
        (rate, burst.unwrap_or(rate).max(1.0))
    }

    pub fn recipient_cooldown(&self) -> Option<Duration> {
        (self.recipient_cooldown_ms > 0).then(|| Duration::from_millis(self.recipient_cooldown_ms))
    }
}
