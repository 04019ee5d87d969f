//! handlers/campaign_handler.rs
use std::{str::FromStr, time::Duration};

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::handlers::error_response;
use crate::models::campaign_model::ControlAction;
use crate::models::progress_model::ProgressCounters;
use crate::models::recipient_job_model::JobStatus;
use crate::services::cache_service::{counters_key, target_total_key};
use crate::services::campaign_manager::{ControlHandle, DispatchServices};

const COUNTERS_TTL: Duration = Duration::from_secs(5);
const TARGET_TOTAL_TTL: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
pub struct RecipientsQuery {
    page: Option<u64>,
    page_size: Option<u64>,
    status: Option<String>,
}

async fn control(
    control: web::Data<ControlHandle>,
    path: web::Path<String>,
    action: ControlAction,
) -> HttpResponse {
    let campaign_id = path.into_inner();
    match control.send(&campaign_id, action).await {
        Ok(campaign) => HttpResponse::Ok().json(json!({
            "success": true,
            "campaign_id": campaign.id,
            "status": campaign.status
        })),
        Err(e) => error_response(&e),
    }
}

/// POST /api/campaigns/{id}/pause
pub async fn pause_campaign_endpoint(
    handle: web::Data<ControlHandle>,
    path: web::Path<String>,
) -> HttpResponse {
    control(handle, path, ControlAction::Pause).await
}

/// POST /api/campaigns/{id}/resume
pub async fn resume_campaign_endpoint(
    handle: web::Data<ControlHandle>,
    path: web::Path<String>,
) -> HttpResponse {
    control(handle, path, ControlAction::Resume).await
}

/// POST /api/campaigns/{id}/cancel
pub async fn cancel_campaign_endpoint(
    handle: web::Data<ControlHandle>,
    path: web::Path<String>,
) -> HttpResponse {
    control(handle, path, ControlAction::Cancel).await
}

/// GET /api/campaigns/{id}
/// Contadores y total del objetivo salen de la caché si están; si no, de la base.
pub async fn get_campaign_endpoint(
    services: web::Data<DispatchServices>,
    path: web::Path<String>,
) -> HttpResponse {
    let campaign_id = path.into_inner();

    let campaign = match services.campaigns.get_campaign(&campaign_id).await {
        Ok(c) => c,
        Err(e) => return error_response(&e),
    };

    let counters = match services
        .cache
        .get_json::<ProgressCounters>(&counters_key(&campaign_id))
        .await
    {
        Some(counters) => counters,
        None => match services.tracker.counters(&campaign_id).await {
            Ok((_, counters)) => {
                services
                    .cache
                    .set_json(&counters_key(&campaign_id), &counters, COUNTERS_TTL)
                    .await;
                counters
            }
            Err(e) => return error_response(&e),
        },
    };

    let target_total = match services
        .cache
        .get_json::<i64>(&target_total_key(&campaign_id))
        .await
    {
        Some(total) => Some(total),
        None => match services.resolver.count_targets(&campaign).await {
            Ok(total) => {
                services
                    .cache
                    .set_json(&target_total_key(&campaign_id), &total, TARGET_TOTAL_TTL)
                    .await;
                Some(total)
            }
            Err(e) => {
                log::warn!("(get_campaign) total del objetivo de {} no disponible: {}", campaign_id, e);
                None
            }
        },
    };

    HttpResponse::Ok().json(json!({
        "campaign": campaign,
        "counters": counters,
        "target_total": target_total
    }))
}

/// GET /api/campaigns/{id}/recipients
pub async fn list_recipients_endpoint(
    services: web::Data<DispatchServices>,
    path: web::Path<String>,
    query: web::Query<RecipientsQuery>,
) -> HttpResponse {
    let campaign_id = path.into_inner();
    let page = query.page.unwrap_or(1);
    let page_size = query.page_size.unwrap_or(50);

    let status = match query.status.as_deref().map(JobStatus::from_str).transpose() {
        Ok(status) => status,
        Err(e) => {
            return HttpResponse::BadRequest().json(json!({
                "success": false,
                "error": e.to_string()
            }))
        }
    };

    match services
        .tracker
        .list_jobs(&campaign_id, status, page, page_size)
        .await
    {
        Ok(list) => HttpResponse::Ok().json(list),
        Err(e) => error_response(&e),
    }
}

/// GET /api/rate-limits/{sending_number_id}
pub async fn rate_limit_stats_endpoint(
    services: web::Data<DispatchServices>,
    path: web::Path<String>,
) -> HttpResponse {
    let number = path.into_inner();
    match services.limiter.stats(&number) {
        Some(stats) => HttpResponse::Ok().json(stats),
        None => HttpResponse::NotFound().json(json!({
            "success": false,
            "error": format!("no sends recorded for number {number}")
        })),
    }
}

/// GET /api/health
pub async fn health_endpoint(services: web::Data<DispatchServices>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "instance_id": services.instance_id,
        "event_subscribers": services.publisher.subscriber_count()
    }))
}
