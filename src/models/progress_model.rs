//! models/progress_model.rs
//! Eventos efímeros de progreso (no se persisten).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::campaign_model::CampaignStatus;

/// Contadores agregados de una campaña. `sent` incluye delivered/read y
/// `delivered` incluye read, así los contadores sólo crecen con los recibos.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounters {
    pub total: i64,
    pub pending: i64,
    pub sent: i64,
    pub delivered: i64,
    pub read: i64,
    pub failed: i64,
    pub skipped: i64,
    pub attempts: i64,
}

impl ProgressCounters {
    pub const fn finished(&self) -> bool {
        self.pending == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub campaign_id: String,
    pub owner_id: String,
    pub counters: ProgressCounters,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub campaign_id: String,
    pub owner_id: String,
    pub status: CampaignStatus,
    pub reason: Option<String>,
    pub counters: ProgressCounters,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    Progress(ProgressEvent),
    Status(StatusEvent),
}

impl DispatchEvent {
    pub fn campaign_id(&self) -> &str {
        match self {
            Self::Progress(ev) => &ev.campaign_id,
            Self::Status(ev) => &ev.campaign_id,
        }
    }

    pub fn owner_id(&self) -> &str {
        match self {
            Self::Progress(ev) => &ev.owner_id,
            Self::Status(ev) => &ev.owner_id,
        }
    }

    /// Nombre del evento SSE.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Status(_) => "status",
        }
    }
}
