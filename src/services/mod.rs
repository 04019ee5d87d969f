//! services/mod.rs
//! Capas de negocio del motor de campañas.

pub mod cache_service;
pub mod campaign_dispatch;
pub mod campaign_manager;
pub mod campaign_service;
pub mod delivery_tracker;
pub mod message_sender;
pub mod progress_publisher;
pub mod rate_limiter;
pub mod recipient_resolver;
pub mod retry_policy;
pub mod whatsapp_provider;
