//! handlers/webhook_handler.rs
//! Webhook de WhatsApp Cloud API: handshake de verificación y recibos de estado
//! (sent/delivered/read/failed) hacia `ReconcileReceipt`.

use actix_web::{web, HttpRequest, HttpResponse};
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

use crate::config::app_config::WhatsAppConfig;
use crate::errors::ErrorKind;
use crate::handlers::error_response;
use crate::models::recipient_job_model::ReceiptStatus;
use crate::models::webhook_model::{ReceiptUpdate, WebhookPayload};
use crate::services::campaign_manager::DispatchServices;
use crate::services::whatsapp_provider::classify_failure;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

#[derive(Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// GET /api/webhooks/whatsapp
pub async fn verify_webhook_endpoint(
    config: web::Data<WhatsAppConfig>,
    query: web::Query<VerifyQuery>,
) -> HttpResponse {
    let query = query.into_inner();
    let token_ok = !config.verify_token.is_empty()
        && query.verify_token.as_deref() == Some(config.verify_token.as_str());

    match (query.mode.as_deref(), query.challenge) {
        (Some("subscribe"), Some(challenge)) if token_ok => {
            log::info!("(webhook) suscripción verificada");
            HttpResponse::Ok().content_type("text/plain").body(challenge)
        }
        _ => {
            log::warn!("(webhook) handshake rechazado");
            HttpResponse::Forbidden().finish()
        }
    }
}

/// `sha256=<hex>` sobre el cuerpo crudo con el app secret.
pub fn signature_matches(app_secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(provided) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Tipo y mensaje de error para un recibo `failed`.
fn receipt_error(receipt: &ReceiptUpdate) -> Option<(ErrorKind, String)> {
    if receipt.status != ReceiptStatus::Failed {
        return None;
    }
    let title = receipt
        .error_title
        .clone()
        .unwrap_or_else(|| "delivery failed".to_string());
    let err = classify_failure(StatusCode::BAD_REQUEST, receipt.error_code, title, None);
    Some((err.kind(), err.message().to_string()))
}

/// POST /api/webhooks/whatsapp
/// Responde 5xx si la base falla para que Meta reintente la entrega; aplicar
/// el mismo recibo dos veces no cambia nada.
pub async fn receive_webhook_endpoint(
    config: web::Data<WhatsAppConfig>,
    services: web::Data<DispatchServices>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    if !config.app_secret.is_empty() {
        let header = req
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if !signature_matches(&config.app_secret, &body, header) {
            log::warn!("(webhook) firma inválida");
            return HttpResponse::Unauthorized().json(json!({
                "success": false,
                "error": "invalid signature"
            }));
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            log::warn!("(webhook) payload inválido: {}", e);
            return HttpResponse::BadRequest().json(json!({
                "success": false,
                "error": e.to_string()
            }));
        }
    };

    let receipts = payload.receipts();
    let mut applied = 0usize;
    for receipt in &receipts {
        let result = services
            .tracker
            .reconcile_receipt(
                &receipt.provider_message_id,
                receipt.status,
                receipt_error(receipt),
            )
            .await;
        match result {
            Ok(Some(tracked)) if tracked.applied => applied += 1,
            Ok(Some(_)) => log::debug!(
                "(webhook) recibo {:?} de {} no cambia el estado",
                receipt.status,
                receipt.provider_message_id
            ),
            Ok(None) => log::warn!(
                "(webhook) recibo para mensaje desconocido {}",
                receipt.provider_message_id
            ),
            Err(e) => return error_response(&e),
        }
    }

    HttpResponse::Ok().json(json!({
        "success": true,
        "received": receipts.len(),
        "applied": applied
    }))
}
