//! services/campaign_manager.rs
//! Loop de control del dispatcher. Cada `poll_interval` busca campañas listas
//! (programadas vencidas o `running` sin lease), las reclama con un lease y
//! lanza una rutina de despacho por campaña. También consume los comandos de
//! control (pausa/reanudación/cancelación) y apaga todo de forma ordenada.

use std::{collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::FutureExt;
use sqlx::{Pool, Sqlite};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinError, JoinSet},
    time::MissedTickBehavior,
};
use uuid::Uuid;

use crate::config::dispatch_config::DispatchConfig;
use crate::errors::{DispatchError, DispatchResult};
use crate::models::campaign_model::{Campaign, CampaignStatus, ControlAction};
use crate::models::progress_model::{DispatchEvent, StatusEvent};
use crate::services::cache_service::CacheService;
use crate::services::campaign_dispatch::{dispatch_campaign, panic_message, StopReason};
use crate::services::campaign_service::CampaignService;
use crate::services::delivery_tracker::DeliveryTracker;
use crate::services::message_sender::{MessageProvider, MessageSender};
use crate::services::progress_publisher::ProgressPublisher;
use crate::services::rate_limiter::RateLimiter;
use crate::services::recipient_resolver::RecipientResolver;
use crate::services::retry_policy::RetryPolicy;

const CONTROL_CHANNEL_CAPACITY: usize = 64;
/// Campañas consideradas por pasada.
const POLL_BATCH: i64 = 32;

/// Colaboradores del motor. Se comparten (vía `Arc`) entre el loop de control,
/// las rutinas de despacho y los handlers HTTP.
pub struct DispatchServices {
    pub campaigns: CampaignService,
    pub resolver: RecipientResolver,
    pub limiter: RateLimiter,
    pub sender: MessageSender,
    pub tracker: DeliveryTracker,
    pub publisher: ProgressPublisher,
    pub cache: CacheService,
    pub retry: RetryPolicy,
    pub config: DispatchConfig,
    /// Prefijo de los tokens de lease de este proceso.
    pub instance_id: String,
}

impl DispatchServices {
    pub fn new(
        db_pool: Pool<Sqlite>,
        provider: Arc<dyn MessageProvider>,
        cache: CacheService,
        config: DispatchConfig,
    ) -> Self {
        let publisher = ProgressPublisher::default();
        let retry = RetryPolicy::from_config(&config);
        Self {
            campaigns: CampaignService::new(db_pool.clone()),
            resolver: RecipientResolver::new(db_pool.clone()),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            sender: MessageSender::new(provider, config.send_timeout()),
            tracker: DeliveryTracker::new(db_pool, publisher.clone(), cache.clone(), retry.max_attempts),
            publisher,
            cache,
            retry,
            config,
            instance_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Acota una llamada a la base: vencer el plazo es un fallo de persistencia.
pub(crate) async fn bounded<T>(
    limit: Duration,
    op: &'static str,
    fut: impl Future<Output = DispatchResult<T>>,
) -> DispatchResult<T> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(DispatchError::PersistenceTimeout(op)))
}

/// Publica un cambio de estado de campaña con los contadores del momento.
pub(crate) async fn publish_status(
    services: &DispatchServices,
    campaign_id: &str,
    status: CampaignStatus,
    reason: Option<String>,
) {
    let counters = bounded(
        services.config.db_timeout(),
        "counters",
        services.tracker.counters(campaign_id),
    )
    .await;
    match counters {
        Ok((owner_id, counters)) => services.publisher.publish(DispatchEvent::Status(StatusEvent {
            campaign_id: campaign_id.to_string(),
            owner_id,
            status,
            reason,
            counters,
            timestamp: Utc::now(),
        })),
        Err(e) => log::warn!("(publish_status) {} -> {} sin evento: {}", campaign_id, status, e),
    }
}

#[derive(Debug)]
pub struct ControlCommand {
    pub campaign_id: String,
    pub action: ControlAction,
    pub reply: oneshot::Sender<DispatchResult<Campaign>>,
}

/// Lado emisor del canal de control; lo usan los handlers HTTP.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    pub async fn send(&self, campaign_id: &str, action: ControlAction) -> DispatchResult<Campaign> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ControlCommand {
                campaign_id: campaign_id.to_string(),
                action,
                reply,
            })
            .await
            .map_err(|_| DispatchError::DispatcherGone)?;
        response.await.map_err(|_| DispatchError::DispatcherGone)?
    }

    pub async fn pause(&self, campaign_id: &str) -> DispatchResult<Campaign> {
        self.send(campaign_id, ControlAction::Pause).await
    }

    pub async fn resume(&self, campaign_id: &str) -> DispatchResult<Campaign> {
        self.send(campaign_id, ControlAction::Resume).await
    }

    pub async fn cancel(&self, campaign_id: &str) -> DispatchResult<Campaign> {
        self.send(campaign_id, ControlAction::Cancel).await
    }
}

struct ActiveDispatch {
    stop: watch::Sender<Option<StopReason>>,
    lease_token: String,
}

pub struct CampaignManager {
    services: Arc<DispatchServices>,
    control_rx: mpsc::Receiver<ControlCommand>,
    /// Registro de rutinas en este proceso; sólo lo toca el loop de control.
    active: HashMap<String, ActiveDispatch>,
    routines: JoinSet<(String, bool)>,
}

impl CampaignManager {
    pub fn new(services: Arc<DispatchServices>) -> (Self, ControlHandle) {
        let (tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let manager = Self {
            services,
            control_rx,
            active: HashMap::new(),
            routines: JoinSet::new(),
        };
        (manager, ControlHandle { tx })
    }

    /// Loop indefinido. Termina cuando `shutdown` pasa a `true` (o se pierde
    /// su emisor), después de drenar las rutinas y soltar sus leases.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "(campaign_manager) dispatcher iniciado (instancia {}, poll {}ms, pool {})",
            self.services.instance_id,
            self.services.config.poll_interval().as_millis(),
            self.services.config.pool_size()
        );
        let mut ticker = tokio::time::interval(self.services.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => self.poll().await,
                Some(command) = self.control_rx.recv() => self.handle_control(command).await,
                Some(joined) = self.routines.join_next() => self.reap(joined).await,
            }
        }

        self.shutdown().await;
    }

    async fn poll(&mut self) {
        let services = Arc::clone(&self.services);
        let db_timeout = services.config.db_timeout();

        let due = bounded(
            db_timeout,
            "find_dispatchable",
            services.campaigns.find_dispatchable(Utc::now(), POLL_BATCH),
        )
        .await;
        let due = match due {
            Ok(due) => due,
            Err(e) => {
                log::warn!("(campaign_manager) no se pudieron consultar campañas: {}", e);
                return;
            }
        };

        for campaign in due {
            if self.active.contains_key(&campaign.id) {
                continue;
            }
            let lease_token = format!("{}:{}", services.instance_id, Uuid::new_v4());
            let claimed = bounded(
                db_timeout,
                "claim",
                services.campaigns.claim(&campaign.id, &lease_token, services.config.lease()),
            )
            .await;
            match claimed {
                Ok(claimed) => self.start(claimed, lease_token),
                Err(DispatchError::ClaimConflict(id)) => {
                    log::debug!("(campaign_manager) campaña {} reclamada por otro", id);
                }
                Err(e) => log::warn!("(campaign_manager) claim de {} falló: {}", campaign.id, e),
            }
        }
    }

    fn start(&mut self, campaign: Campaign, lease_token: String) {
        let (stop, stop_rx) = watch::channel(None);
        let campaign_id = campaign.id.clone();
        let services = Arc::clone(&self.services);
        let token = lease_token.clone();
        let id = campaign_id.clone();

        self.routines.spawn(async move {
            let run = AssertUnwindSafe(dispatch_campaign(services, campaign, token, stop_rx))
                .catch_unwind()
                .await;
            if let Err(panic) = &run {
                log::error!(
                    "(campaign_manager) rutina de {} en pánico: {}",
                    id,
                    panic_message(panic.as_ref())
                );
            }
            (id, run.is_err())
        });
        self.active.insert(campaign_id, ActiveDispatch { stop, lease_token });
    }

    async fn handle_control(&mut self, command: ControlCommand) {
        let ControlCommand {
            campaign_id,
            action,
            reply,
        } = command;

        let result = bounded(
            self.services.config.db_timeout(),
            "apply_control",
            self.services.campaigns.apply_control(&campaign_id, action),
        )
        .await;

        match &result {
            Ok(campaign) => {
                log::info!(
                    "(campaign_manager) {} aplicado a {} -> {}",
                    action.as_str(),
                    campaign_id,
                    campaign.status
                );
                let reason = match action {
                    ControlAction::Pause => Some(StopReason::Paused),
                    ControlAction::Cancel => Some(StopReason::Cancelled),
                    ControlAction::Resume => None,
                };
                if let (Some(reason), Some(active)) = (reason, self.active.get(&campaign_id)) {
                    let _ = active.stop.send(Some(reason));
                }
                publish_status(&self.services, &campaign_id, campaign.status, None).await;
            }
            Err(e) => log::info!(
                "(campaign_manager) {} rechazado para {}: {}",
                action.as_str(),
                campaign_id,
                e
            ),
        }

        if reply.send(result).is_err() {
            log::debug!("(campaign_manager) el emisor de {} ya no espera respuesta", campaign_id);
        }
    }

    async fn reap(&mut self, joined: Result<(String, bool), JoinError>) {
        match joined {
            Ok((campaign_id, panicked)) => {
                let entry = self.active.remove(&campaign_id);
                self.services.tracker.forget_campaign(&campaign_id);
                if let (true, Some(entry)) = (panicked, entry) {
                    let released = bounded(
                        self.services.config.db_timeout(),
                        "release_lease",
                        self.services
                            .campaigns
                            .release_lease(&campaign_id, &entry.lease_token),
                    )
                    .await;
                    if let Err(e) = released {
                        log::warn!("(campaign_manager) lease de {} queda hasta vencer: {}", campaign_id, e);
                    }
                }
            }
            Err(e) => log::error!("(campaign_manager) rutina abortada: {}", e),
        }
    }

    async fn shutdown(mut self) {
        log::info!(
            "(campaign_manager) apagando; {} campañas activas",
            self.active.len()
        );
        for active in self.active.values() {
            let _ = active.stop.send(Some(StopReason::Shutdown));
        }
        while let Some(joined) = self.routines.join_next().await {
            self.reap(joined).await;
        }
        log::info!("(campaign_manager) dispatcher detenido");
    }
}
