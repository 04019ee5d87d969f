//! app.rs
use crate::handlers::{campaign_handler, progress_handler, webhook_handler};
use actix_web::web;

pub fn init_app(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(campaign_handler::health_endpoint))
            .service(
                web::scope("/campaigns")
                    .route(
                        "/{id}",
                        web::get().to(campaign_handler::get_campaign_endpoint),
                    )
                    .route(
                        "/{id}/pause",
                        web::post().to(campaign_handler::pause_campaign_endpoint),
                    )
                    .route(
                        "/{id}/resume",
                        web::post().to(campaign_handler::resume_campaign_endpoint),
                    )
                    .route(
                        "/{id}/cancel",
                        web::post().to(campaign_handler::cancel_campaign_endpoint),
                    )
                    .route(
                        "/{id}/recipients",
                        web::get().to(campaign_handler::list_recipients_endpoint),
                    )
                    .route(
                        "/{id}/events",
                        web::get().to(progress_handler::campaign_events_endpoint),
                    ),
            )
            .route(
                "/owners/{owner_id}/events",
                web::get().to(progress_handler::owner_events_endpoint),
            )
            .route(
                "/rate-limits/{sending_number_id}",
                web::get().to(campaign_handler::rate_limit_stats_endpoint),
            )
            .service(
                web::scope("/webhooks/whatsapp")
                    .route("", web::get().to(webhook_handler::verify_webhook_endpoint))
                    .route("", web::post().to(webhook_handler::receive_webhook_endpoint)),
            ),
    );
}
