//! errors.rs
//! Taxonomía de errores del motor de envío de campañas.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tipo de error persistido por destinatario (`recipient_jobs.last_error_kind`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    ServerError,
    RateLimited,
    Network,
    InvalidRecipient,
    TemplateRejected,
    OptedOut,
    Unauthorized,
    Internal,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::InvalidRecipient => "invalid_recipient",
            Self::TemplateRejected => "template_rejected",
            Self::OptedOut => "opted_out",
            Self::Unauthorized => "unauthorized",
            Self::Internal => "internal",
        }
    }

    /// Timeouts, 5xx, rate limit y fallos de red se reintentan.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ServerError | Self::RateLimited | Self::Network
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "timeout" => Self::Timeout,
            "server_error" => Self::ServerError,
            "rate_limited" => Self::RateLimited,
            "network" => Self::Network,
            "invalid_recipient" => Self::InvalidRecipient,
            "template_rejected" => Self::TemplateRejected,
            "opted_out" => Self::OptedOut,
            "unauthorized" => Self::Unauthorized,
            "internal" => Self::Internal,
            other => return Err(DispatchError::Decode(format!("error kind '{other}'"))),
        })
    }
}

/// Resultado fallido de una llamada al proveedor, ya clasificado.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("retryable provider failure ({kind}): {message}")]
    Retryable {
        kind: ErrorKind,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("permanent provider failure ({kind}): {message}")]
    Permanent { kind: ErrorKind, message: String },
}

impl SendError {
    /// Clasifica según el kind: si es reintentable va a `Retryable`.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        if kind.is_retryable() {
            Self::Retryable {
                kind,
                message,
                retry_after: None,
            }
        } else {
            Self::Permanent { kind, message }
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Retryable {
            kind: ErrorKind::Timeout,
            message: format!("provider call exceeded {}ms", after.as_millis()),
            retry_after: None,
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Retryable { kind, .. } | Self::Permanent { kind, .. } => *kind,
        }
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable { message, .. } | Self::Permanent { message, .. } => message,
        }
    }
}

/// Errores del dispatcher y de los stores.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Otro proceso (o tarea) ganó la carrera por la campaña. Benigno.
    #[error("campaign {0} is already claimed")]
    ClaimConflict(String),

    /// El objetivo de la campaña no produce destinatarios.
    #[error("recipient resolution failed: {0}")]
    ResolverFailure(String),

    /// Error de configuración de la campaña (p.ej. plantilla rechazada).
    #[error("campaign setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("persistence timeout during {0}")]
    PersistenceTimeout(&'static str),

    #[error("invalid campaign transition from {from} on {action}")]
    InvalidTransition { from: String, action: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("could not decode stored value: {0}")]
    Decode(String),

    #[error("dispatcher is not running")]
    DispatcherGone,
}

impl DispatchError {
    /// Fallos de infraestructura: se reintentan con backoff.
    pub const fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::PersistenceTimeout(_))
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<chrono::ParseError> for DispatchError {
    fn from(err: chrono::ParseError) -> Self {
        Self::Decode(err.to_string())
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
