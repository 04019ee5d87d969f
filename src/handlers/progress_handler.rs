//! handlers/progress_handler.rs
//! Stream SSE de eventos de progreso, filtrado por campaña o por dueño.

use actix_web::{web, HttpResponse};
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::handlers::error_response;
use crate::models::progress_model::{DispatchEvent, ProgressEvent};
use crate::services::campaign_manager::DispatchServices;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    Campaign(String),
    Owner(String),
}

impl EventFilter {
    pub fn matches(&self, event: &DispatchEvent) -> bool {
        match self {
            Self::Campaign(id) => event.campaign_id() == id.as_str(),
            Self::Owner(id) => event.owner_id() == id.as_str(),
        }
    }
}

fn sse_frame(event: &DispatchEvent) -> Option<Bytes> {
    match serde_json::to_string(event) {
        Ok(data) => Some(Bytes::from(format!("event: {}\ndata: {}\n\n", event.name(), data))),
        Err(e) => {
            log::warn!("(events) evento no serializable: {}", e);
            None
        }
    }
}

fn event_stream(
    rx: broadcast::Receiver<DispatchEvent>,
    filter: EventFilter,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    stream::unfold((rx, filter), |(mut rx, filter)| async move {
        loop {
            match rx.recv().await {
                Ok(event) if filter.matches(&event) => {
                    if let Some(frame) = sse_frame(&event) {
                        return Some((Ok(frame), (rx, filter)));
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("(events) suscriptor {:?} perdió {} eventos", filter, skipped);
                    let note = Bytes::from(format!(": lagged {skipped}\n\n"));
                    return Some((Ok(note), (rx, filter)));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

fn sse_response(initial: Option<Bytes>, rx: broadcast::Receiver<DispatchEvent>, filter: EventFilter) -> HttpResponse {
    let body = stream::iter(initial.into_iter().map(Ok)).chain(event_stream(rx, filter));
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(body)
}

/// GET /api/campaigns/{id}/events
/// Empieza con una foto de los contadores actuales y sigue con los eventos.
pub async fn campaign_events_endpoint(
    services: web::Data<DispatchServices>,
    path: web::Path<String>,
) -> HttpResponse {
    let campaign_id = path.into_inner();
    // suscribirse antes de leer la foto: ningún evento cae en el hueco
    let rx = services.publisher.subscribe();

    let snapshot = match services.tracker.counters(&campaign_id).await {
        Ok((owner_id, counters)) => DispatchEvent::Progress(ProgressEvent {
            campaign_id: campaign_id.clone(),
            owner_id,
            counters,
            timestamp: Utc::now(),
        }),
        Err(e) => return error_response(&e),
    };

    sse_response(sse_frame(&snapshot), rx, EventFilter::Campaign(campaign_id))
}

/// GET /api/owners/{owner_id}/events
pub async fn owner_events_endpoint(
    services: web::Data<DispatchServices>,
    path: web::Path<String>,
) -> HttpResponse {
    let owner_id = path.into_inner();
    let rx = services.publisher.subscribe();
    sse_response(None, rx, EventFilter::Owner(owner_id))
}
