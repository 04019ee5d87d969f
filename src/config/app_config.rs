//! config/app_config.rs
//! Configuración de la aplicación: archivo TOML opcional + variables de entorno.

use std::{collections::HashMap, path::Path, str::FromStr};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::dispatch_config::{DispatchConfig, NumberLimit};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

fn default_bind_addr() -> String {
    "0.0.0.0:5022".to_string()
}

fn default_database_url() -> String {
    "sqlite:data/campaigns.db?mode=rwc".to_string()
}

fn default_api_base() -> String {
    "https://graph.facebook.com/v19.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub access_token: String,
    /// Token del handshake `hub.verify_token`.
    #[serde(default)]
    pub verify_token: String,
    /// Secreto de la app para `X-Hub-Signature-256`; vacío = sin verificación.
    #[serde(default)]
    pub app_secret: String,
    /// WABA id para consultar el estado de las plantillas; vacío = no se valida.
    #[serde(default)]
    pub business_account_id: String,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            access_token: String::new(),
            verify_token: String::new(),
            app_secret: String::new(),
            business_account_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: default_database_url(),
            redis_url: None,
            debug: false,
            whatsapp: WhatsAppConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl AppConfig {
    /// Lee `CONFIG_PATH` (o `config.toml`) si existe y luego aplica el entorno.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("No se pudo leer el archivo de configuración {path}"))?;
            Self::from_toml(&raw).with_context(|| format!("Configuración inválida en {path}"))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Sobrescribe claves individuales con lo que devuelva `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, slot: &mut String| {
            if let Some(value) = lookup(key) {
                *slot = value;
            }
        };
        string("BIND_ADDR", &mut self.bind_addr);
        string("DATABASE_URL", &mut self.database_url);
        string("WHATSAPP_API_BASE", &mut self.whatsapp.api_base);
        string("WHATSAPP_ACCESS_TOKEN", &mut self.whatsapp.access_token);
        string("WHATSAPP_VERIFY_TOKEN", &mut self.whatsapp.verify_token);
        string("WHATSAPP_APP_SECRET", &mut self.whatsapp.app_secret);
        string("WHATSAPP_BUSINESS_ACCOUNT_ID", &mut self.whatsapp.business_account_id);
        if let Some(url) = lookup("REDIS_URL").filter(|url| !url.is_empty()) {
            self.redis_url = Some(url);
        }

        let dispatch = &mut self.dispatch;
        parse_into(&lookup, "DEBUG", &mut self.debug);
        parse_into(&lookup, "DISPATCH_POLL_INTERVAL_MS", &mut dispatch.poll_interval_ms);
        parse_into(&lookup, "DISPATCH_WORKER_POOL_SIZE", &mut dispatch.worker_pool_size);
        parse_into(&lookup, "DISPATCH_MAX_ATTEMPTS", &mut dispatch.max_attempts);
        parse_into(&lookup, "DISPATCH_RETRY_BASE_MS", &mut dispatch.retry_base_delay_ms);
        parse_into(&lookup, "DISPATCH_RETRY_MAX_MS", &mut dispatch.retry_max_delay_ms);
        parse_into(&lookup, "DISPATCH_SEND_TIMEOUT_MS", &mut dispatch.send_timeout_ms);
        parse_into(&lookup, "DISPATCH_LEASE_SECS", &mut dispatch.lease_secs);
        parse_into(&lookup, "RATE_LIMIT_MPS", &mut dispatch.rate_limits.messages_per_second);

        if let Some(raw) = lookup("RATE_LIMIT_BURST") {
            match raw.parse::<f64>() {
                Ok(burst) => dispatch.rate_limits.burst_size = Some(burst),
                Err(_) => log::warn!("(config) RATE_LIMIT_BURST inválido: {raw}"),
            }
        }
        if let Some(raw) = lookup("RATE_LIMIT_NUMBERS") {
            match serde_json::from_str::<HashMap<String, NumberLimit>>(&raw) {
                Ok(limits) => dispatch.rate_limits.number_limits.extend(limits),
                Err(e) => log::warn!("(config) RATE_LIMIT_NUMBERS inválido: {e}"),
            }
        }
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => log::warn!("(config) valor inválido para {key}: {raw}, se mantiene el anterior"),
        }
    }
}
