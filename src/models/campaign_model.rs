//! models/campaign_model.rs
use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DispatchError, DispatchResult};
use crate::models::parse_db_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Transiciones permitidas de la máquina de estados de campaña.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Cancelled)
                | (Scheduled, Running)
                | (Scheduled, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "draft" => Self::Draft,
            "scheduled" => Self::Scheduled,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => return Err(DispatchError::Decode(format!("campaign status '{other}'"))),
        })
    }
}

/// Definición del público objetivo: listas de contactos + filtro por tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDefinition {
    #[serde(default)]
    pub list_ids: Vec<String>,
    /// El contacto debe tener todos estos tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Campaign {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub target: TargetDefinition,
    pub template: TemplateRef,
    pub template_params: Vec<String>,
    pub sending_number_id: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub lease_owner: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fila cruda de `campaigns`.
#[derive(Debug, sqlx::FromRow)]
pub struct CampaignRow {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub status: String,
    pub target_json: String,
    pub template_name: String,
    pub template_language: String,
    pub template_params_json: String,
    pub sending_number_id: String,
    pub scheduled_at: Option<String>,
    pub lease_owner: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = DispatchError;

    fn try_from(row: CampaignRow) -> DispatchResult<Self> {
        Ok(Campaign {
            status: row.status.parse()?,
            target: serde_json::from_str(&row.target_json)?,
            template: TemplateRef {
                name: row.template_name,
                language: row.template_language,
            },
            template_params: serde_json::from_str(&row.template_params_json)?,
            scheduled_at: row
                .scheduled_at
                .as_deref()
                .map(parse_db_timestamp)
                .transpose()?,
            created_at: parse_db_timestamp(&row.created_at)?,
            updated_at: parse_db_timestamp(&row.updated_at)?,
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            sending_number_id: row.sending_number_id,
            lease_owner: row.lease_owner,
            failure_reason: row.failure_reason,
        })
    }
}

/// Comandos de control emitidos por el usuario (pausa/reanudar/cancelar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

impl ControlAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        }
    }

    /// Estados desde los que aplica la acción y estado resultante.
    pub fn transition(self) -> (&'static [CampaignStatus], CampaignStatus) {
        use CampaignStatus::*;
        match self {
            Self::Pause => (&[Running], Paused),
            Self::Resume => (&[Paused], Running),
            Self::Cancel => (&[Draft, Scheduled, Running, Paused], Cancelled),
        }
    }
}
