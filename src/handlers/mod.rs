//! handlers/mod.rs
//! Adaptadores HTTP sobre el motor: control, webhook y stream de progreso.
pub mod campaign_handler;
pub mod progress_handler;
pub mod webhook_handler;

use actix_web::HttpResponse;
use serde_json::json;

use crate::errors::DispatchError;

/// Traduce errores del motor a respuestas HTTP.
pub fn error_response(err: &DispatchError) -> HttpResponse {
    let body = json!({
        "success": false,
        "error": err.to_string()
    });
    match err {
        DispatchError::NotFound(_) => HttpResponse::NotFound().json(body),
        DispatchError::InvalidTransition { .. } | DispatchError::ClaimConflict(_) => {
            HttpResponse::Conflict().json(body)
        }
        DispatchError::DispatcherGone
        | DispatchError::Persistence(_)
        | DispatchError::PersistenceTimeout(_) => {
            log::error!("(http) servicio no disponible: {}", err);
            HttpResponse::ServiceUnavailable().json(body)
        }
        _ => {
            log::error!("(http) error interno: {}", err);
            HttpResponse::InternalServerError().json(body)
        }
    }
}
