//! services/rate_limiter.rs
//! Rate limit por número emisor (token bucket), compartido por todas las campañas.
//!
//! - Cada número emisor tiene su propio bucket (cuotas independientes en WhatsApp).
//! - El bucket arranca vacío y se rellena a `messages_per_second` hasta `burst_size`.
//! - Los que esperan un mismo número hacen fila en un `tokio::sync::Mutex`
//!   (FIFO). El estado del bucket vive aparte, así `throttle` y `stats` nunca
//!   esperan detrás de alguien dormido en la fila.
//! - Cooldown opcional por destinatario: separación mínima entre dos envíos
//!   al mismo teléfono desde el mismo número.

use std::{sync::Arc, time::Duration};

use dashmap::{mapref::one::RefMut, DashMap};
use serde::Serialize;
use tokio::{sync::Mutex, time::Instant};

use crate::config::dispatch_config::RateLimitConfig;

const COOLDOWN_PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
    /// Pausa impuesta por el proveedor (429 / Retry-After).
    blocked_until: Option<Instant>,
}

impl TokenBucket {
    fn new(refill_rate: f64, capacity: f64) -> Self {
        Self {
            tokens: 0.0,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
            blocked_until: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Consume un token o devuelve cuánto falta para que haya uno.
    fn try_consume(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(until) = self.blocked_until {
            if now < until {
                return Err(until - now);
            }
            self.blocked_until = None;
            self.last_refill = until;
        }
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub available_tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    pub throttled_for_ms: u64,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
    /// Fila de espera por número emisor.
    queues: DashMap<String, Arc<Mutex<()>>>,
    /// (número, teléfono) -> primer instante permitido para el siguiente envío.
    cooldowns: DashMap<(String, String), Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            queues: DashMap::new(),
            cooldowns: DashMap::new(),
        }
    }

    /// El guard no debe cruzar un `.await`.
    fn bucket(&self, sending_number_id: &str) -> RefMut<'_, String, TokenBucket> {
        self.buckets
            .entry(sending_number_id.to_string())
            .or_insert_with(|| {
                let (rate, capacity) = self.config.limits_for(sending_number_id);
                log::debug!(
                    "(rate_limiter) bucket para {} rate={}/s capacity={}",
                    sending_number_id,
                    rate,
                    capacity
                );
                TokenBucket::new(rate, capacity)
            })
    }

    fn queue(&self, sending_number_id: &str) -> Arc<Mutex<()>> {
        self.queues
            .entry(sending_number_id.to_string())
            .or_default()
            .clone()
    }

    /// Intento sin espera: `Ok(())` si se consumió un token, si no el tiempo
    /// que falta para el siguiente.
    pub fn try_acquire(&self, sending_number_id: &str) -> Result<(), Duration> {
        self.bucket(sending_number_id).try_consume(Instant::now())
    }

    /// Espera en fila hasta conseguir un token del número emisor. Cada vuelta
    /// relee el bucket, así un `throttle` llegado durante la espera la alarga.
    pub async fn acquire(&self, sending_number_id: &str) {
        let queue = self.queue(sending_number_id);
        let _turn = queue.lock().await;
        loop {
            match self.try_acquire(sending_number_id) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Cooldown por destinatario + token del número emisor.
    pub async fn acquire_for(&self, sending_number_id: &str, phone: &str) {
        if let Some(cooldown) = self.config.recipient_cooldown() {
            let slot = self.reserve_cooldown_slot(sending_number_id, phone, cooldown);
            tokio::time::sleep_until(slot).await;
        }
        self.acquire(sending_number_id).await;
    }

    fn reserve_cooldown_slot(&self, sending_number_id: &str, phone: &str, cooldown: Duration) -> Instant {
        let now = Instant::now();
        if self.cooldowns.len() > COOLDOWN_PRUNE_THRESHOLD {
            self.cooldowns.retain(|_, next| *next > now);
        }
        let mut entry = self
            .cooldowns
            .entry((sending_number_id.to_string(), phone.to_string()))
            .or_insert(now);
        let slot = (*entry).max(now);
        *entry = slot + cooldown;
        slot
    }

    /// El proveedor pidió frenar: vacía el bucket y lo bloquea `pause`.
    pub fn throttle(&self, sending_number_id: &str, pause: Duration) {
        let mut bucket = self.bucket(sending_number_id);
        let until = Instant::now() + pause;
        bucket.tokens = 0.0;
        bucket.blocked_until = Some(bucket.blocked_until.map_or(until, |b| b.max(until)));
        log::warn!(
            "(rate_limiter) número {} frenado por {}ms",
            sending_number_id,
            pause.as_millis()
        );
    }

    /// Periodo de relleno de un token, usado cuando el proveedor no manda Retry-After.
    pub fn refill_period(&self, sending_number_id: &str) -> Duration {
        let (rate, _) = self.config.limits_for(sending_number_id);
        Duration::from_secs_f64(1.0 / rate)
    }

    pub fn stats(&self, sending_number_id: &str) -> Option<RateLimitStats> {
        let mut bucket = self.buckets.get_mut(sending_number_id)?;
        let now = Instant::now();
        bucket.refill(now);
        Some(RateLimitStats {
            available_tokens: bucket.tokens,
            capacity: bucket.capacity,
            refill_rate: bucket.refill_rate,
            throttled_for_ms: bucket
                .blocked_until
                .map_or(0, |until| until.saturating_duration_since(now).as_millis() as u64),
        })
    }
}
