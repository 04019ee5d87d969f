//! services/whatsapp_provider.rs
//! Proveedor real: WhatsApp Cloud API (Graph API de Meta) vía reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::app_config::WhatsAppConfig;
use crate::errors::{ErrorKind, SendError};
use crate::models::campaign_model::TemplateRef;
use crate::services::message_sender::{MessageProvider, TemplateState};

#[derive(Clone)]
pub struct WhatsAppCloudProvider {
    http_client: Client,
    api_base: String,
    access_token: String,
    business_account_id: String,
}

#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

impl WhatsAppCloudProvider {
    pub fn new(http_client: Client, cfg: &WhatsAppConfig) -> Self {
        Self {
            http_client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            access_token: cfg.access_token.clone(),
            business_account_id: cfg.business_account_id.clone(),
        }
    }

    fn is_mock(&self) -> bool {
        self.api_base.starts_with("mock://")
    }

    fn template_payload(to_phone: &str, template: &TemplateRef, params: &[String]) -> Value {
        let mut body = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to_phone,
            "type": "template",
            "template": {
                "name": template.name,
                "language": { "code": template.language },
            }
        });
        if !params.is_empty() {
            let parameters: Vec<Value> = params
                .iter()
                .map(|text| json!({ "type": "text", "text": text }))
                .collect();
            body["template"]["components"] = json!([{ "type": "body", "parameters": parameters }]);
        }
        body
    }

    async fn failure(response: reqwest::Response) -> SendError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body_txt = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<GraphErrorEnvelope>(&body_txt) {
            Ok(env) => (env.error.code, env.error.message),
            Err(_) => (None, body_txt),
        };
        classify_failure(status, code, message, retry_after)
    }
}

fn transport_error(err: reqwest::Error) -> SendError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Network
    };
    SendError::Retryable {
        kind,
        message: err.to_string(),
        retry_after: None,
    }
}

/// `messages[0].id` de una respuesta aceptada. Un cuerpo que no decodifica
/// se registra tal cual y queda como fallo permanente.
fn accepted_message_id(body: &str) -> Result<String, SendError> {
    let raw: Value = serde_json::from_str(body).map_err(|e| {
        log::error!("(send_template) respuesta 2xx no es JSON ({}): {}", e, body);
        SendError::Permanent {
            kind: ErrorKind::Internal,
            message: format!("respuesta aceptada no decodificable: {e}"),
        }
    })?;
    raw.get("messages")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| SendError::Permanent {
            kind: ErrorKind::Internal,
            message: format!("respuesta sin messages[0].id: {raw}"),
        })
}

/// Clasifica una respuesta fallida de Graph API. El código de error de Meta
/// manda sobre el status HTTP cuando está presente.
pub fn classify_failure(
    status: StatusCode,
    code: Option<i64>,
    message: String,
    retry_after: Option<Duration>,
) -> SendError {
    let by_code = code.and_then(|code| match code {
        4 | 80007 | 130429 | 131048 | 131056 => Some(ErrorKind::RateLimited),
        1 | 2 | 131000 | 131016 | 133004 => Some(ErrorKind::ServerError),
        0 | 10 | 190 | 131005 | 131031 => Some(ErrorKind::Unauthorized),
        100 | 131021 | 131026 | 131030 => Some(ErrorKind::InvalidRecipient),
        131050 => Some(ErrorKind::OptedOut),
        368 | 132000..=132016 | 135000 => Some(ErrorKind::TemplateRejected),
        _ => None,
    });

    let kind = by_code.unwrap_or_else(|| {
        if status == StatusCode::TOO_MANY_REQUESTS {
            ErrorKind::RateLimited
        } else if status.is_server_error() {
            ErrorKind::ServerError
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            ErrorKind::Unauthorized
        } else if status == StatusCode::REQUEST_TIMEOUT {
            ErrorKind::Timeout
        } else {
            ErrorKind::InvalidRecipient
        }
    });

    let message = match code {
        Some(code) => format!("status={} code={} {}", status.as_u16(), code, message),
        None => format!("status={} {}", status.as_u16(), message),
    };
    match SendError::from_kind(kind, message) {
        SendError::Retryable { kind, message, .. } => SendError::Retryable {
            kind,
            message,
            retry_after,
        },
        permanent => permanent,
    }
}

#[async_trait]
impl MessageProvider for WhatsAppCloudProvider {
    async fn send_template(
        &self,
        sending_number_id: &str,
        to_phone: &str,
        template: &TemplateRef,
        params: &[String],
    ) -> Result<String, SendError> {
        let payload = Self::template_payload(to_phone, template, params);
        if self.is_mock() {
            return Ok(format!("mock:{}", Uuid::new_v4()));
        }

        let url = format!("{}/{}/messages", self.api_base, sending_number_id);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }

        // con 2xx Meta ya aceptó el mensaje: nada de aquí en adelante es reintentable
        match response.text().await {
            Ok(body) => accepted_message_id(&body),
            Err(e) => {
                log::error!("(send_template) cuerpo 2xx ilegible para {}: {}", to_phone, e);
                Err(SendError::Permanent {
                    kind: ErrorKind::Internal,
                    message: format!("respuesta aceptada ilegible: {e}"),
                })
            }
        }
    }

    async fn template_state(
        &self,
        _sending_number_id: &str,
        template: &TemplateRef,
    ) -> Result<TemplateState, SendError> {
        if self.is_mock() || self.business_account_id.is_empty() {
            return Ok(TemplateState::Approved);
        }

        let url = format!("{}/{}/message_templates", self.api_base, self.business_account_id);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[("name", template.name.as_str()), ("fields", "name,language,status")])
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }

        let raw: Value = response.json().await.map_err(transport_error)?;
        let found = raw
            .get("data")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|t| {
                t.get("name").and_then(Value::as_str) == Some(template.name.as_str())
                    && t.get("language").and_then(Value::as_str) == Some(template.language.as_str())
            });

        Ok(match found.and_then(|t| t.get("status")).and_then(Value::as_str) {
            None => TemplateState::NotFound,
            Some("APPROVED") => TemplateState::Approved,
            Some("PENDING") | Some("IN_APPEAL") => TemplateState::Pending,
            Some(other) => TemplateState::Rejected(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(status: u16, code: Option<i64>) -> SendError {
        classify_failure(
            StatusCode::from_u16(status).unwrap(),
            code,
            "boom".to_string(),
            None,
        )
    }

    #[test]
    fn meta_codes_drive_classification() {
        assert_eq!(classify(400, Some(131026)).kind(), ErrorKind::InvalidRecipient);
        assert_eq!(classify(400, Some(131050)).kind(), ErrorKind::OptedOut);
        assert_eq!(classify(400, Some(132001)).kind(), ErrorKind::TemplateRejected);
        assert_eq!(classify(401, Some(190)).kind(), ErrorKind::Unauthorized);

        let throttled = classify(400, Some(130429));
        assert!(throttled.is_retryable());
        assert_eq!(throttled.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn http_status_is_the_fallback() {
        assert!(classify(503, None).is_retryable());
        assert_eq!(classify(429, None).kind(), ErrorKind::RateLimited);
        assert_eq!(classify(403, None).kind(), ErrorKind::Unauthorized);
        assert!(!classify(404, None).is_retryable());
    }

    #[test]
    fn retry_after_is_kept_for_retryable_errors() {
        let err = classify_failure(
            StatusCode::TOO_MANY_REQUESTS,
            None,
            String::new(),
            Some(Duration::from_secs(3)),
        );
        assert!(matches!(
            err,
            SendError::Retryable { retry_after: Some(d), .. } if d == Duration::from_secs(3)
        ));
    }

    #[test]
    fn accepted_replies_are_never_retried() {
        let id = accepted_message_id(r#"{"messaging_product":"whatsapp","messages":[{"id":"wamid.HBg1"}]}"#);
        assert_eq!(id.unwrap(), "wamid.HBg1");

        for body in ["<html>gateway</html>", "", r#"{"messages":[]}"#] {
            let err = accepted_message_id(body).unwrap_err();
            assert!(!err.is_retryable(), "{body}");
            assert_eq!(err.kind(), ErrorKind::Internal);
        }
    }

    #[test]
    fn payload_carries_body_parameters() {
        let template = TemplateRef {
            name: "promo".to_string(),
            language: "es".to_string(),
        };
        let body = WhatsAppCloudProvider::template_payload(
            "15550001",
            &template,
            &["Ana".to_string(), "20%".to_string()],
        );
        assert_eq!(body["type"], "template");
        assert_eq!(body["template"]["language"]["code"], "es");
        assert_eq!(body["template"]["components"][0]["parameters"][1]["text"], "20%");

        let bare = WhatsAppCloudProvider::template_payload("15550001", &template, &[]);
        assert!(bare["template"].get("components").is_none());
    }

    #[tokio::test]
    async fn mock_base_skips_network() {
        let cfg = WhatsAppConfig {
            api_base: "mock://local".to_string(),
            ..WhatsAppConfig::default()
        };
        let provider = WhatsAppCloudProvider::new(Client::new(), &cfg);
        let template = TemplateRef {
            name: "promo".to_string(),
            language: "en_US".to_string(),
        };
        let id = provider
            .send_template("n1", "15550001", &template, &[])
            .await
            .unwrap();
        assert!(id.starts_with("mock:"));
        assert_eq!(
            provider.template_state("n1", &template).await.unwrap(),
            TemplateState::Approved
        );
    }
}
