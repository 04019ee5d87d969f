//! models/mod.rs
//! Módulo raíz para modelos/estructuras compartidas.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::errors::DispatchResult;

pub mod campaign_model;
pub mod contact_model;
pub mod progress_model;
pub mod recipient_job_model;
pub mod webhook_model;

/// Formato fijo RFC 3339 (milisegundos, sufijo `Z`): el orden lexicográfico
/// en SQLite coincide con el orden temporal.
pub fn db_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    db_timestamp(Utc::now())
}

pub fn parse_db_timestamp(raw: &str) -> DispatchResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}
