//! tests/support.rs
//! Utilidades compartidas: pools SQLite de prueba, fixtures de contactos y un
//! proveedor determinista sin red.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::Instant,
};
use uuid::Uuid;

use crate::config::dispatch_config::{DispatchConfig, RateLimitConfig};
use crate::errors::{ErrorKind, SendError};
use crate::models::campaign_model::{Campaign, CampaignStatus, TargetDefinition, TemplateRef};
use crate::models::contact_model::ContactStatus;
use crate::models::now_timestamp;
use crate::models::progress_model::{DispatchEvent, ProgressEvent, StatusEvent};
use crate::services::cache_service::CacheService;
use crate::services::campaign_manager::{CampaignManager, ControlHandle, DispatchServices};
use crate::services::campaign_service::{CampaignService, NewCampaign};
use crate::services::message_sender::{MessageProvider, TemplateState};

pub const OWNER: &str = "owner-1";
pub const NUMBER: &str = "num-1";

/// Una sola conexión que nunca expira: la base en memoria vive lo que el pool.
pub async fn memory_pool() -> Pool<Sqlite> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("sqlite en memoria");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migraciones");
    pool
}

/// Base en archivo con varias conexiones reales (para carreras de claim).
pub async fn file_pool(dir: &tempfile::TempDir) -> Pool<Sqlite> {
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("dispatch.db"))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .expect("sqlite en archivo");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migraciones");
    pool
}

pub async fn add_list(pool: &Pool<Sqlite>, owner_id: &str, list_id: &str) {
    sqlx::query("INSERT INTO contact_lists (id, owner_id, name, created_at) VALUES (?1, ?2, ?1, ?3)")
        .bind(list_id)
        .bind(owner_id)
        .bind(now_timestamp())
        .execute(pool)
        .await
        .expect("insert list");
}

pub async fn add_contact(pool: &Pool<Sqlite>, list_id: &str, contact_id: &str, phone: &str) {
    add_contact_with_status(pool, list_id, contact_id, phone, ContactStatus::Active).await;
}

pub async fn add_contact_with_status(
    pool: &Pool<Sqlite>,
    list_id: &str,
    contact_id: &str,
    phone: &str,
    status: ContactStatus,
) {
    sqlx::query(
        r#"
        INSERT INTO contacts (id, owner_id, phone, name, status, created_at)
        VALUES (?1, (SELECT owner_id FROM contact_lists WHERE id = ?2), ?3, ?1, ?4, ?5)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(contact_id)
    .bind(list_id)
    .bind(phone)
    .bind(status.as_str())
    .bind(now_timestamp())
    .execute(pool)
    .await
    .expect("insert contact");

    sqlx::query("INSERT INTO contact_list_members (list_id, contact_id) VALUES (?1, ?2)")
        .bind(list_id)
        .bind(contact_id)
        .execute(pool)
        .await
        .expect("insert member");
}

pub async fn tag_contact(pool: &Pool<Sqlite>, contact_id: &str, tag: &str) {
    sqlx::query("INSERT INTO contact_tags (contact_id, tag) VALUES (?1, ?2)")
        .bind(contact_id)
        .bind(tag)
        .execute(pool)
        .await
        .expect("insert tag");
}

pub fn new_campaign(list_ids: &[&str], status: CampaignStatus) -> NewCampaign {
    NewCampaign {
        owner_id: OWNER.to_string(),
        name: "promo de prueba".to_string(),
        status,
        target: TargetDefinition {
            list_ids: list_ids.iter().map(|s| s.to_string()).collect(),
            tags: Vec::new(),
        },
        template: TemplateRef {
            name: "promo".to_string(),
            language: "es".to_string(),
        },
        template_params: vec!["20%".to_string()],
        sending_number_id: NUMBER.to_string(),
        scheduled_at: None,
    }
}

pub async fn create_campaign(pool: &Pool<Sqlite>, new: NewCampaign) -> Campaign {
    CampaignService::new(pool.clone())
        .create_campaign(new)
        .await
        .expect("create campaign")
}

/// Configuración rápida para tests: poll corto, backoff de milisegundos sin jitter.
pub fn test_config(messages_per_second: f64) -> DispatchConfig {
    DispatchConfig {
        poll_interval_ms: 50,
        worker_pool_size: 4,
        max_attempts: 3,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        retry_jitter_factor: 0.0,
        send_timeout_ms: 1_000,
        db_timeout_ms: 5_000,
        lease_secs: 30,
        rate_limits: RateLimitConfig {
            messages_per_second,
            burst_size: None,
            recipient_cooldown_ms: 0,
            number_limits: HashMap::new(),
        },
    }
}

/// Error guionado; reintentable o permanente según el kind.
pub fn scripted(kind: ErrorKind) -> SendError {
    SendError::from_kind(kind, format!("scripted {kind}"))
}

/// Proveedor determinista: por teléfono, una cola de fallos guionados;
/// agotada la cola, cada envío tiene éxito. Los teléfonos marcados con
/// `panic_for` hacen entrar en pánico al envío.
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<SendError>>>,
    panics: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    template_state: Mutex<TemplateState>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            panics: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            template_state: Mutex::new(TemplateState::Approved),
        }
    }
}

impl ScriptedProvider {
    pub fn fail_with(&self, phone: &str, failures: Vec<SendError>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(phone.to_string(), failures.into());
    }

    pub fn panic_for(&self, phone: &str) {
        self.panics.lock().unwrap().insert(phone.to_string());
    }

    pub fn set_template_state(&self, state: TemplateState) {
        *self.template_state.lock().unwrap() = state;
    }

    pub fn calls_for(&self, phone: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_str() == phone)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageProvider for ScriptedProvider {
    async fn send_template(
        &self,
        _sending_number_id: &str,
        to_phone: &str,
        _template: &TemplateRef,
        _params: &[String],
    ) -> Result<String, SendError> {
        self.calls.lock().unwrap().push(to_phone.to_string());
        let panics = self.panics.lock().unwrap().contains(to_phone);
        if panics {
            panic!("envío guionado en pánico para {to_phone}");
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(to_phone)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(err) => Err(err),
            None => Ok(format!("wamid.{}", Uuid::new_v4())),
        }
    }

    async fn template_state(
        &self,
        _sending_number_id: &str,
        _template: &TemplateRef,
    ) -> Result<TemplateState, SendError> {
        Ok(self.template_state.lock().unwrap().clone())
    }
}

/// Motor completo corriendo en segundo plano, con un suscriptor de eventos
/// creado antes de arrancar.
pub struct Harness {
    pub services: Arc<DispatchServices>,
    pub provider: Arc<ScriptedProvider>,
    pub control: ControlHandle,
    pub events: broadcast::Receiver<DispatchEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Harness {
    pub fn start(pool: Pool<Sqlite>, provider: Arc<ScriptedProvider>, config: DispatchConfig) -> Self {
        let services = Arc::new(DispatchServices::new(
            pool,
            provider.clone(),
            CacheService::memory(),
            config,
        ));
        let events = services.publisher.subscribe();
        let (manager, control) = CampaignManager::new(Arc::clone(&services));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(shutdown_rx));
        Self {
            services,
            provider,
            control,
            events,
            shutdown,
            task,
        }
    }

    pub async fn wait_for_status(&self, campaign_id: &str, status: CampaignStatus, within: Duration) -> Campaign {
        let deadline = Instant::now() + within;
        loop {
            let campaign = self
                .services
                .campaigns
                .get_campaign(campaign_id)
                .await
                .expect("get campaign");
            if campaign.status == status {
                return campaign;
            }
            assert!(
                Instant::now() < deadline,
                "campaña {} sigue en {} (esperado {})",
                campaign_id,
                campaign.status,
                status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Apaga el dispatcher y devuelve los eventos publicados, separados por
    /// tipo. Con las rutinas ya terminadas no queda ningún evento por llegar.
    pub async fn stop(mut self) -> (Vec<ProgressEvent>, Vec<StatusEvent>) {
        let _ = self.shutdown.send(true);
        self.task.await.expect("dispatcher task");

        let mut progress = Vec::new();
        let mut status = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            match event {
                DispatchEvent::Progress(ev) => progress.push(ev),
                DispatchEvent::Status(ev) => status.push(ev),
            }
        }
        (progress, status)
    }
}
