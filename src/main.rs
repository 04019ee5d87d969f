use std::{str::FromStr, sync::Arc};

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tokio::sync::watch;

use crate::config::app_config::AppConfig;
use crate::logger::init_logger;
use crate::services::cache_service::CacheService;
use crate::services::campaign_manager::{CampaignManager, DispatchServices};
use crate::services::whatsapp_provider::WhatsAppCloudProvider;

mod app;
mod config;
mod errors;
mod handlers;
mod logger;
mod models;
mod services;

#[cfg(test)]
mod tests;

async fn setup_database(database_url: &str) -> anyhow::Result<Pool<Sqlite>> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("DATABASE_URL inválido: {database_url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    // Crear carpeta de la base si hace falta
    let filename = options.clone().get_filename();
    if let Some(dir) = filename
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
    {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("No se pudo crear el directorio {}", dir.display()))?;
    }

    log::info!("Conectando a SQLite en {}", database_url);
    let db_pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .context("No se pudo conectar a la base de datos SQLite")?;
    Ok(db_pool)
}

async fn build_services(config: &AppConfig) -> anyhow::Result<Arc<DispatchServices>> {
    let db_pool = setup_database(&config.database_url).await?;

    let services = DispatchServices::new(
        db_pool,
        Arc::new(WhatsAppCloudProvider::new(
            reqwest::Client::builder()
                .timeout(config.dispatch.send_timeout())
                .build()
                .context("No se pudo crear el cliente HTTP")?,
            &config.whatsapp,
        )),
        CacheService::from_url(config.redis_url.as_deref()).await,
        config.dispatch.clone(),
    );
    services
        .campaigns
        .run_migrations()
        .await
        .context("Fallo en migraciones")?;
    Ok(Arc::new(services))
}

fn startup_error(err: anyhow::Error) -> std::io::Error {
    log::error!("Error de arranque: {:?}", err);
    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok(); // Cargar .env al inicio
    let config = AppConfig::load().map_err(|e| {
        eprintln!("Configuración inválida: {e:?}");
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;
    init_logger(config.debug);

    let services = build_services(&config).await.map_err(startup_error)?;

    // Dispatcher en su propia tarea, con señal de apagado
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (manager, control) = CampaignManager::new(Arc::clone(&services));
    let dispatcher = tokio::spawn(manager.run(shutdown_rx));

    let services_data = web::Data::from(Arc::clone(&services));
    let control_data = web::Data::new(control);
    let whatsapp_data = web::Data::new(config.whatsapp.clone());

    log::info!("Levantando servidor en {}", config.bind_addr);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(services_data.clone())
            .app_data(control_data.clone())
            .app_data(whatsapp_data.clone())
            .configure(app::init_app)
    })
    .workers(1)
    .bind(&config.bind_addr)?
    .run()
    .await;

    log::info!("Servidor detenido, apagando dispatcher");
    let _ = shutdown_tx.send(true);
    if let Err(e) = dispatcher.await {
        log::error!("El dispatcher terminó con error: {}", e);
    }
    server
}
