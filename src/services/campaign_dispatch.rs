//! services/campaign_dispatch.rs
//! Rutina de despacho de una campaña ya reclamada.
//!
//! resolver -> pool acotado de workers -> rate limiter -> sender -> tracker.
//! Corre hasta drenar el objetivo o hasta recibir una señal de parada
//! (pausa, cancelación, apagado o pérdida del lease). La señal es cooperativa:
//! los envíos en vuelo terminan y se registran, pero no arrancan nuevos.

use std::{collections::HashSet, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::{FutureExt, StreamExt};
use tokio::{
    sync::watch,
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};

use crate::errors::{DispatchError, DispatchResult, ErrorKind, SendError};
use crate::models::campaign_model::{Campaign, CampaignStatus};
use crate::models::recipient_job_model::{JobStatus, ResolvedRecipient, SendOutcome};
use crate::services::cache_service::target_total_key;
use crate::services::campaign_manager::{bounded, publish_status, DispatchServices};

/// Reintentos de persistencia permitidos después de una señal de parada.
const PERSIST_RETRIES_AFTER_STOP: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Paused,
    Cancelled,
    Shutdown,
    LeaseLost,
}

pub type StopSignal = watch::Receiver<Option<StopReason>>;

#[derive(Debug)]
enum WorkerOutcome {
    /// El job quedó terminal (o lo movió otro).
    Done,
    /// Falló con error reintentable y le quedan intentos.
    Retry { after: Duration },
    /// Parado antes de enviar: el job sigue pendiente.
    Interrupted,
    /// La base no respondió; el job queda no terminal y se re-resuelve al reanudar.
    Abandoned,
}

enum DriveEnd {
    Drained,
    Stopped(StopReason),
}

/// Punto de entrada de la rutina. Nunca entra en pánico hacia el manager por
/// errores de un destinatario: esos se absorben en el límite del worker.
pub async fn dispatch_campaign(
    services: Arc<DispatchServices>,
    campaign: Campaign,
    lease_token: String,
    mut stop: StopSignal,
) {
    let campaign = Arc::new(campaign);
    log::info!(
        "(dispatch) campaña {} en marcha (número {}, plantilla {})",
        campaign.id,
        campaign.sending_number_id,
        campaign.template.name
    );
    publish_status(&services, &campaign.id, CampaignStatus::Running, None).await;

    let db_timeout = services.config.db_timeout();
    match bounded(db_timeout, "validate_target", services.resolver.validate(&campaign)).await {
        Ok(()) => {}
        Err(e) if e.is_persistence() => {
            log::warn!("(dispatch) no se pudo validar el objetivo de {}: {}", campaign.id, e);
            release(&services, &campaign, &lease_token).await;
            return;
        }
        Err(e) => {
            fail_campaign(&services, &campaign, &lease_token, &e.to_string()).await;
            return;
        }
    }

    match services
        .sender
        .validate_template(&campaign.sending_number_id, &campaign.template)
        .await
    {
        Ok(()) => {}
        Err(DispatchError::Send(err)) if err.is_retryable() => {
            log::warn!(
                "(dispatch) validación de plantilla de {} falló ({}), se reintenta en la próxima pasada",
                campaign.id,
                err
            );
            release(&services, &campaign, &lease_token).await;
            return;
        }
        Err(e) => {
            fail_campaign(&services, &campaign, &lease_token, &e.to_string()).await;
            return;
        }
    }

    let end = drive(&services, &campaign, &lease_token, &mut stop).await;
    finalize(&services, &campaign, &lease_token, end).await;
    services.tracker.forget_campaign(&campaign.id);
}

async fn drive(
    services: &Arc<DispatchServices>,
    campaign: &Arc<Campaign>,
    lease_token: &str,
    stop: &mut StopSignal,
) -> DriveEnd {
    let pool_size = services.config.pool_size();
    let db_timeout = services.config.db_timeout();
    let renew_period = services.config.poll_interval();

    let mut workers: JoinSet<(ResolvedRecipient, WorkerOutcome)> = JoinSet::new();
    let mut stream = services.resolver.resolve(campaign);
    let mut stream_done = false;
    let mut stream_retry_at: Option<Instant> = None;
    let mut stream_failures = 0u32;
    // contactos en vuelo o esperando reintento en esta rutina
    let mut scheduled: HashSet<String> = HashSet::new();
    let mut retries: Vec<(Instant, ResolvedRecipient)> = Vec::new();
    let mut stopped: Option<StopReason> = None;

    let mut renew = tokio::time::interval_at(Instant::now() + renew_period, renew_period);
    renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if stopped.is_none() {
            stopped = *stop.borrow();
        }

        if stopped.is_none() {
            if stream_retry_at.is_some_and(|at| at <= Instant::now()) {
                stream = services.resolver.resolve(campaign);
                stream_done = false;
                stream_retry_at = None;
            }

            while workers.len() < pool_size {
                let now = Instant::now();
                if let Some(pos) = retries.iter().position(|(due, _)| *due <= now) {
                    let (_, recipient) = retries.swap_remove(pos);
                    spawn_worker(&mut workers, services, campaign, recipient, stop.clone());
                    continue;
                }
                if stream_done || stream_retry_at.is_some() {
                    break;
                }

                match tokio::time::timeout(db_timeout, stream.next()).await {
                    Ok(Some(Ok(recipient))) => {
                        stream_failures = 0;
                        if scheduled.insert(recipient.contact_id.clone()) {
                            spawn_worker(&mut workers, services, campaign, recipient, stop.clone());
                        }
                    }
                    Ok(None) => stream_done = true,
                    Ok(Some(Err(e))) => {
                        stream_failures += 1;
                        let wait = services.retry.backoff(stream_failures);
                        log::warn!(
                            "(dispatch) resolución de {} falló ({}), se reanuda en {}ms",
                            campaign.id,
                            e,
                            wait.as_millis()
                        );
                        stream_retry_at = Some(Instant::now() + wait);
                    }
                    Err(_) => {
                        stream_failures += 1;
                        let wait = services.retry.backoff(stream_failures);
                        log::warn!(
                            "(dispatch) resolución de {} excedió {}ms, se reanuda en {}ms",
                            campaign.id,
                            db_timeout.as_millis(),
                            wait.as_millis()
                        );
                        stream_retry_at = Some(Instant::now() + wait);
                    }
                }
            }
        }

        if workers.is_empty() {
            if let Some(reason) = stopped {
                return DriveEnd::Stopped(reason);
            }
            if stream_done && retries.is_empty() && stream_retry_at.is_none() {
                return DriveEnd::Drained;
            }
        }

        let wake_at = retries
            .iter()
            .map(|(due, _)| *due)
            .chain(stream_retry_at)
            .min();

        tokio::select! {
            Some(joined) = workers.join_next() => match joined {
                Ok((recipient, WorkerOutcome::Retry { after })) => {
                    log::debug!(
                        "(dispatch) {}/{} reintento en {}ms",
                        campaign.id,
                        recipient.contact_id,
                        after.as_millis()
                    );
                    retries.push((Instant::now() + after, recipient));
                }
                Ok((recipient, outcome)) => {
                    if !matches!(outcome, WorkerOutcome::Done) {
                        log::debug!("(dispatch) {}/{} quedó {:?}", campaign.id, recipient.contact_id, outcome);
                    }
                    scheduled.remove(&recipient.contact_id);
                }
                Err(e) => log::error!("(dispatch) worker de {} abortado: {}", campaign.id, e),
            },
            _ = tokio::time::sleep_until(wake_at.unwrap_or_else(Instant::now)),
                if wake_at.is_some() && stopped.is_none() => {}
            changed = stop.changed(), if stopped.is_none() => {
                stopped = match changed {
                    Ok(()) => *stop.borrow_and_update(),
                    Err(_) => Some(StopReason::Shutdown),
                };
                if let Some(reason) = stopped {
                    log::info!(
                        "(dispatch) campaña {} parando ({:?}), {} envíos en vuelo",
                        campaign.id,
                        reason,
                        workers.len()
                    );
                }
            }
            _ = renew.tick(), if stopped.is_none() => {
                let lease = services.config.lease();
                let renewed = bounded(
                    db_timeout,
                    "renew_lease",
                    services.campaigns.renew_lease(&campaign.id, lease_token, lease),
                )
                .await;
                match renewed {
                    Ok(true) => {}
                    Ok(false) => {
                        log::warn!("(dispatch) campaña {} perdió el lease o dejó de correr", campaign.id);
                        stopped = Some(StopReason::LeaseLost);
                    }
                    // el lease aún no vence: se intenta en el próximo tick
                    Err(e) => log::warn!("(dispatch) renovación de lease de {} falló: {}", campaign.id, e),
                }
            }
        }
    }
}

fn spawn_worker(
    workers: &mut JoinSet<(ResolvedRecipient, WorkerOutcome)>,
    services: &Arc<DispatchServices>,
    campaign: &Arc<Campaign>,
    recipient: ResolvedRecipient,
    stop: StopSignal,
) {
    let services = Arc::clone(services);
    let campaign = Arc::clone(campaign);
    workers.spawn(async move {
        let run = AssertUnwindSafe(process_recipient(&services, &campaign, &recipient, stop.clone()))
            .catch_unwind()
            .await;
        let outcome = match run {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                log::error!(
                    "(dispatch) pánico procesando {}/{}: {}",
                    campaign.id,
                    recipient.contact_id,
                    message
                );
                let failed = persist(&services, &stop, "fail_job", || {
                    services
                        .tracker
                        .fail_job(&campaign.id, &recipient, ErrorKind::Internal, &message)
                })
                .await;
                match failed {
                    Some(_) => WorkerOutcome::Done,
                    None => WorkerOutcome::Abandoned,
                }
            }
        };
        (recipient, outcome)
    });
}

/// Un intento sobre un destinatario: slot del rate limiter, envío y registro.
async fn process_recipient(
    services: &DispatchServices,
    campaign: &Campaign,
    recipient: &ResolvedRecipient,
    mut stop: StopSignal,
) -> WorkerOutcome {
    let tracker = &services.tracker;

    let Some(job) = persist(services, &stop, "ensure_job", || {
        tracker.ensure_job(&campaign.id, recipient)
    })
    .await
    else {
        return WorkerOutcome::Abandoned;
    };
    if job.status.is_terminal() {
        return WorkerOutcome::Done;
    }

    if recipient.duplicate_of.is_some() {
        let skipped = persist(services, &stop, "record_skipped_duplicate", || {
            tracker.record_skipped_duplicate(&campaign.id, recipient)
        })
        .await;
        return match skipped {
            Some(_) => WorkerOutcome::Done,
            None => WorkerOutcome::Abandoned,
        };
    }

    tokio::select! {
        _ = services.limiter.acquire_for(&campaign.sending_number_id, &job.phone) => {}
        _ = wait_for_stop(&mut stop) => return WorkerOutcome::Interrupted,
    }

    let marked = persist(services, &stop, "mark_sending", || tracker.mark_sending(&job)).await;
    let job = match marked {
        Some(Some(job)) => job,
        Some(None) => return WorkerOutcome::Done,
        None => return WorkerOutcome::Abandoned,
    };

    let result = services
        .sender
        .send(
            &campaign.sending_number_id,
            &job.phone,
            &campaign.template,
            &campaign.template_params,
        )
        .await;

    if let Err(err) = &result {
        log::warn!(
            "(dispatch) {}/{} intento {} falló: {}",
            job.campaign_id,
            job.contact_id,
            job.attempt_count + 1,
            err
        );
        if let SendError::Retryable {
            kind: ErrorKind::RateLimited,
            retry_after,
            ..
        } = err
        {
            let pause = retry_after.unwrap_or_else(|| services.limiter.refill_period(&campaign.sending_number_id));
            services.limiter.throttle(&campaign.sending_number_id, pause);
        }
    }

    let outcome = SendOutcome::from(result);
    let Some(tracked) = persist(services, &stop, "record_attempt", || {
        tracker.record_attempt(&job, outcome.clone())
    })
    .await
    else {
        return WorkerOutcome::Abandoned;
    };

    match tracked.job.status {
        JobStatus::Pending => WorkerOutcome::Retry {
            after: services.retry.backoff(tracked.job.attempt_count),
        },
        _ => WorkerOutcome::Done,
    }
}

/// Reintenta una escritura con backoff mientras falle la persistencia.
/// Tras una señal de parada sólo quedan unos pocos intentos; después se abandona.
async fn persist<T, F, Fut>(
    services: &DispatchServices,
    stop: &StopSignal,
    op: &'static str,
    mut call: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DispatchResult<T>>,
{
    let db_timeout = services.config.db_timeout();
    let mut failures = 0u32;
    let mut after_stop = 0u32;
    loop {
        match bounded(db_timeout, op, call()).await {
            Ok(value) => return Some(value),
            Err(e) if e.is_persistence() => {
                failures += 1;
                if stop.borrow().is_some() {
                    after_stop += 1;
                    if after_stop > PERSIST_RETRIES_AFTER_STOP {
                        log::error!("({}) se abandona tras {} fallos: {}", op, failures, e);
                        return None;
                    }
                }
                let wait = services.retry.backoff(failures);
                log::warn!(
                    "({}) fallo de persistencia #{} ({}), reintento en {}ms",
                    op,
                    failures,
                    e,
                    wait.as_millis()
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                log::error!("({}) error no recuperable: {}", op, e);
                return None;
            }
        }
    }
}

async fn wait_for_stop(stop: &mut StopSignal) {
    loop {
        if stop.borrow_and_update().is_some() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn finalize(services: &DispatchServices, campaign: &Campaign, lease_token: &str, end: DriveEnd) {
    match end {
        // el control sólo cambia el estado; el lease lo suelta siempre su dueño
        DriveEnd::Stopped(reason) => {
            log::info!("(dispatch) campaña {} detenida ({:?})", campaign.id, reason);
            release(services, campaign, lease_token).await;
        }
        DriveEnd::Drained => {
            let counters = bounded(
                services.config.db_timeout(),
                "counters",
                services.tracker.counters(&campaign.id),
            )
            .await;
            match counters {
                Ok((_, counters)) if counters.total == 0 => {
                    fail_campaign(services, campaign, lease_token, "target produced no recipients").await;
                }
                Ok((_, counters)) if counters.finished() => {
                    let finished = bounded(
                        services.config.db_timeout(),
                        "finish",
                        services
                            .campaigns
                            .finish(&campaign.id, lease_token, CampaignStatus::Completed, None),
                    )
                    .await;
                    match finished {
                        Ok(true) => {
                            log::info!(
                                "(dispatch) campaña {} completada: sent={} failed={} skipped={}",
                                campaign.id,
                                counters.sent,
                                counters.failed,
                                counters.skipped
                            );
                            services.cache.invalidate(&target_total_key(&campaign.id)).await;
                            publish_status(services, &campaign.id, CampaignStatus::Completed, None).await;
                        }
                        Ok(false) => {
                            log::warn!("(dispatch) campaña {} ya no corría al completar", campaign.id);
                            release(services, campaign, lease_token).await;
                        }
                        Err(e) => {
                            log::warn!("(dispatch) no se pudo completar {}: {}", campaign.id, e);
                            release(services, campaign, lease_token).await;
                        }
                    }
                }
                Ok((_, counters)) => {
                    log::warn!(
                        "(dispatch) campaña {} drenada con {} jobs pendientes, se retoma en la próxima pasada",
                        campaign.id,
                        counters.pending
                    );
                    release(services, campaign, lease_token).await;
                }
                Err(e) => {
                    log::warn!("(dispatch) contadores de {} no disponibles: {}", campaign.id, e);
                    release(services, campaign, lease_token).await;
                }
            }
        }
    }
}

async fn fail_campaign(services: &DispatchServices, campaign: &Campaign, lease_token: &str, reason: &str) {
    log::error!("(dispatch) campaña {} falló: {}", campaign.id, reason);
    let finished = bounded(
        services.config.db_timeout(),
        "finish",
        services
            .campaigns
            .finish(&campaign.id, lease_token, CampaignStatus::Failed, Some(reason)),
    )
    .await;
    match finished {
        Ok(true) => {
            services.cache.invalidate(&target_total_key(&campaign.id)).await;
            publish_status(
                services,
                &campaign.id,
                CampaignStatus::Failed,
                Some(reason.to_string()),
            )
            .await;
        }
        Ok(false) => {
            log::warn!("(dispatch) campaña {} ya no corría al fallar", campaign.id);
            release(services, campaign, lease_token).await;
        }
        Err(e) => {
            log::warn!("(dispatch) no se pudo marcar {} como fallida: {}", campaign.id, e);
            release(services, campaign, lease_token).await;
        }
    }
}

async fn release(services: &DispatchServices, campaign: &Campaign, lease_token: &str) {
    let released = bounded(
        services.config.db_timeout(),
        "release_lease",
        services.campaigns.release_lease(&campaign.id, lease_token),
    )
    .await;
    match released {
        Ok(true) => log::info!("(dispatch) lease de {} liberado", campaign.id),
        Ok(false) => log::debug!("(dispatch) lease de {} ya no era nuestro", campaign.id),
        // vence solo tras lease_secs
        Err(e) => log::warn!("(dispatch) no se pudo liberar el lease de {}: {}", campaign.id, e),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "worker panicked".to_string()
    }
}
