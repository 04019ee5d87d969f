//! services/message_sender.rs
//! Envío de plantillas con timeout por llamada y errores ya clasificados.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::errors::{DispatchError, SendError};
use crate::models::campaign_model::TemplateRef;

/// Estado de una plantilla según el proveedor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateState {
    Approved,
    Pending,
    Rejected(String),
    NotFound,
}

/// Capacidad del proveedor. La implementación real es `WhatsAppCloudProvider`;
/// los tests usan un proveedor determinista sin red.
#[async_trait]
pub trait MessageProvider: Send + Sync {
    /// Devuelve el id de mensaje del proveedor.
    async fn send_template(
        &self,
        sending_number_id: &str,
        to_phone: &str,
        template: &TemplateRef,
        params: &[String],
    ) -> Result<String, SendError>;

    async fn template_state(
        &self,
        sending_number_id: &str,
        template: &TemplateRef,
    ) -> Result<TemplateState, SendError>;
}

#[derive(Clone)]
pub struct MessageSender {
    provider: Arc<dyn MessageProvider>,
    timeout: Duration,
}

impl MessageSender {
    pub fn new(provider: Arc<dyn MessageProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// `Send(recipient, template, params) -> (providerMessageId, error)`.
    /// Un timeout se clasifica como reintentable.
    pub async fn send(
        &self,
        sending_number_id: &str,
        to_phone: &str,
        template: &TemplateRef,
        params: &[String],
    ) -> Result<String, SendError> {
        let call = self
            .provider
            .send_template(sending_number_id, to_phone, template, params);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "(send) timeout de {}ms enviando a {}",
                    self.timeout.as_millis(),
                    to_phone
                );
                Err(SendError::timeout(self.timeout))
            }
        }
    }

    /// Validación previa al envío. Plantilla no aprobada = error de setup;
    /// un fallo reintentable del proveedor se devuelve tal cual.
    pub async fn validate_template(
        &self,
        sending_number_id: &str,
        template: &TemplateRef,
    ) -> Result<(), DispatchError> {
        let call = self.provider.template_state(sending_number_id, template);
        let state = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result?,
            Err(_) => return Err(SendError::timeout(self.timeout).into()),
        };
        match state {
            TemplateState::Approved => Ok(()),
            TemplateState::Pending => Err(DispatchError::Setup(format!(
                "template '{}' is still pending review",
                template.name
            ))),
            TemplateState::NotFound => Err(DispatchError::Setup(format!(
                "template '{}' ({}) does not exist",
                template.name, template.language
            ))),
            TemplateState::Rejected(reason) => Err(DispatchError::Setup(format!(
                "template '{}' rejected: {}",
                template.name, reason
            ))),
        }
    }
}
