//! models/recipient_job_model.rs
use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DispatchError, DispatchResult, ErrorKind, SendError};
use crate::models::parse_db_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
    SkippedDuplicate,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
            Self::SkippedDuplicate => "skipped_duplicate",
        }
    }

    /// Estados finales por destinatario: ya no se vuelve a enviar.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Sending)
    }

    /// Posición en el lattice `Sent < Delivered < Read`.
    const fn delivery_rank(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Sending => Some(1),
            Self::Sent => Some(2),
            Self::Delivered => Some(3),
            Self::Read => Some(4),
            Self::Failed | Self::SkippedDuplicate => None,
        }
    }

    /// Estado resultante de aplicar un recibo del proveedor, o `None` si el
    /// recibo llegaría a retroceder el job (duplicado o fuera de orden).
    pub fn apply_receipt(self, receipt: ReceiptStatus) -> Option<JobStatus> {
        let current = self.delivery_rank()?;
        match receipt {
            ReceiptStatus::Failed => (current <= 2).then_some(JobStatus::Failed),
            other => {
                let next = other.as_job_status();
                let target = next.delivery_rank()?;
                (target > current).then_some(next)
            }
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "sending" => Self::Sending,
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "read" => Self::Read,
            "failed" => Self::Failed,
            "skipped_duplicate" => Self::SkippedDuplicate,
            other => return Err(DispatchError::Decode(format!("job status '{other}'"))),
        })
    }
}

/// Estados que llegan por webhook de WhatsApp (`statuses[].status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl ReceiptStatus {
    pub const fn as_job_status(self) -> JobStatus {
        match self {
            Self::Sent => JobStatus::Sent,
            Self::Delivered => JobStatus::Delivered,
            Self::Read => JobStatus::Read,
            Self::Failed => JobStatus::Failed,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipientJob {
    pub campaign_id: String,
    pub contact_id: String,
    pub phone: String,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct RecipientJobRow {
    pub campaign_id: String,
    pub contact_id: String,
    pub phone: String,
    pub status: String,
    pub attempt_count: i64,
    pub last_error_kind: Option<String>,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub last_attempted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<RecipientJobRow> for RecipientJob {
    type Error = DispatchError;

    fn try_from(row: RecipientJobRow) -> DispatchResult<Self> {
        Ok(RecipientJob {
            status: row.status.parse()?,
            attempt_count: u32::try_from(row.attempt_count)
                .map_err(|e| DispatchError::Decode(e.to_string()))?,
            last_error_kind: row
                .last_error_kind
                .as_deref()
                .map(str::parse::<ErrorKind>)
                .transpose()?,
            last_attempted_at: row
                .last_attempted_at
                .as_deref()
                .map(parse_db_timestamp)
                .transpose()?,
            created_at: parse_db_timestamp(&row.created_at)?,
            updated_at: parse_db_timestamp(&row.updated_at)?,
            campaign_id: row.campaign_id,
            contact_id: row.contact_id,
            phone: row.phone,
            last_error: row.last_error,
            provider_message_id: row.provider_message_id,
        })
    }
}

/// Destinatario que produce el resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResolvedRecipient {
    pub contact_id: String,
    pub phone: String,
    /// Otro contacto de la misma resolución ya usa este teléfono.
    pub duplicate_of: Option<String>,
}

/// Resultado de un intento de envío, tal como lo registra el tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success { provider_message_id: String },
    RetryableTransient { kind: ErrorKind, message: String },
    NonRetryablePermanent { kind: ErrorKind, message: String },
}

impl From<Result<String, SendError>> for SendOutcome {
    fn from(result: Result<String, SendError>) -> Self {
        match result {
            Ok(provider_message_id) => Self::Success {
                provider_message_id,
            },
            Err(SendError::Retryable { kind, message, .. }) => {
                Self::RetryableTransient { kind, message }
            }
            Err(SendError::Permanent { kind, message }) => {
                Self::NonRetryablePermanent { kind, message }
            }
        }
    }
}
