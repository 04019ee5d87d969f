//! models/webhook_model.rs
//! Payload de webhooks de WhatsApp Cloud API (sólo lo que usa el tracker).

use serde::Deserialize;

use crate::models::recipient_job_model::ReceiptStatus;

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: String,
    pub value: WebhookValue,
}

#[derive(Debug, Deserialize)]
pub struct WebhookValue {
    #[serde(default)]
    pub statuses: Vec<StatusUpdate>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<StatusError>,
}

#[derive(Debug, Deserialize)]
pub struct StatusError {
    pub code: i64,
    #[serde(default)]
    pub title: Option<String>,
}

/// Recibo ya normalizado para `ReconcileReceipt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptUpdate {
    pub provider_message_id: String,
    pub status: ReceiptStatus,
    pub error_code: Option<i64>,
    pub error_title: Option<String>,
}

impl WebhookPayload {
    /// Extrae los recibos de estado; ignora mensajes entrantes y estados desconocidos.
    pub fn receipts(&self) -> Vec<ReceiptUpdate> {
        self.entry
            .iter()
            .flat_map(|entry| entry.changes.iter())
            .filter(|change| change.field.is_empty() || change.field == "messages")
            .flat_map(|change| change.value.statuses.iter())
            .filter_map(|update| {
                let status = ReceiptStatus::parse(&update.status)?;
                let first_error = update.errors.first();
                Some(ReceiptUpdate {
                    provider_message_id: update.id.clone(),
                    status,
                    error_code: first_error.map(|e| e.code),
                    error_title: first_error.and_then(|e| e.title.clone()),
                })
            })
            .collect()
    }
}
