//! services/cache_service.rs
//! Caché de apoyo (snapshots de contadores, totales resueltos).
//! Nunca es la fuente de verdad: cualquier error se registra y se ignora.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Caché en proceso con expiración por entrada.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (Instant, String)>,
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if entry.0 > now => Some(entry.1.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, (expires, _)| *expires <= now);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (Instant::now() + ttl, value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(feature = "redis-cache")]
pub struct RedisCache {
    connection: tokio::sync::Mutex<redis::aio::ConnectionManager>,
}

#[cfg(feature = "redis-cache")]
impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            connection: tokio::sync::Mutex::new(manager),
        })
    }
}

#[cfg(feature = "redis-cache")]
#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.connection.lock().await;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.connection.lock().await;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.connection.lock().await;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn CacheStore>,
    namespace: String,
}

impl CacheService {
    pub fn new(store: Arc<dyn CacheStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryCache::default()), "dispatch")
    }

    /// Redis si hay URL y el feature está activo; si no, memoria.
    pub async fn from_url(redis_url: Option<&str>) -> Self {
        #[cfg(feature = "redis-cache")]
        if let Some(url) = redis_url {
            match RedisCache::connect(url).await {
                Ok(cache) => {
                    log::info!("(cache) usando Redis en {}", url);
                    return Self::new(Arc::new(cache), "dispatch");
                }
                Err(e) => log::warn!("(cache) Redis no disponible ({:?}), usando memoria", e),
            }
        }
        #[cfg(not(feature = "redis-cache"))]
        if redis_url.is_some() {
            log::warn!("(cache) REDIS_URL definido pero el binario no tiene el feature redis-cache");
        }
        Self::memory()
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(&self.key(key)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::debug!("(cache) valor corrupto en {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("(cache) get {} falló: {:?}", key, e);
                None
            }
        }
    }

    pub async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("(cache) no se pudo serializar {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.store.set(&self.key(key), raw, ttl).await {
            log::warn!("(cache) set {} falló: {:?}", key, e);
        }
    }

    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.store.delete(&self.key(key)).await {
            log::warn!("(cache) delete {} falló: {:?}", key, e);
        }
    }
}

pub fn counters_key(campaign_id: &str) -> String {
    format!("campaign:{campaign_id}:counters")
}

pub fn target_total_key(campaign_id: &str) -> String {
    format!("campaign:{campaign_id}:target_total")
}
