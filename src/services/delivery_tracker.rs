//! services/delivery_tracker.rs
//! Estado por destinatario (`recipient_jobs`): intentos, recibos del proveedor
//! y contadores agregados. Cada transición publica un evento de progreso.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use tokio::sync::Mutex;

use crate::errors::{DispatchError, DispatchResult, ErrorKind};
use crate::models::now_timestamp;
use crate::models::progress_model::{DispatchEvent, ProgressCounters, ProgressEvent};
use crate::models::recipient_job_model::{
    JobStatus, ReceiptStatus, RecipientJob, RecipientJobRow, ResolvedRecipient, SendOutcome,
};
use crate::services::cache_service::{counters_key, CacheService};
use crate::services::progress_publisher::ProgressPublisher;

const JOB_COLUMNS: &str = r#"
    campaign_id, contact_id, phone, status, attempt_count, last_error_kind,
    last_error, provider_message_id, last_attempted_at, created_at, updated_at
"#;

const COUNTERS_TTL: Duration = Duration::from_secs(30);
const RECEIPT_CAS_RETRIES: usize = 3;

/// Resultado de una escritura del tracker. `applied = false` cuando la
/// llamada era un duplicado o llegó tarde: no hubo transición ni evento.
#[derive(Debug, Clone)]
pub struct TrackedJob {
    pub job: RecipientJob,
    pub applied: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct CountersRow {
    owner_id: String,
    total: i64,
    pending: i64,
    sent: i64,
    delivered: i64,
    read: i64,
    failed: i64,
    skipped: i64,
    attempts: i64,
}

#[derive(Debug, Serialize)]
pub struct ListRecipientJobsResponse {
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub items: Vec<RecipientJob>,
}

#[derive(Clone)]
pub struct DeliveryTracker {
    db_pool: Pool<Sqlite>,
    publisher: ProgressPublisher,
    cache: CacheService,
    max_attempts: u32,
    /// Serializa escritura + conteo + publicación por campaña.
    campaign_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl DeliveryTracker {
    pub fn new(
        db_pool: Pool<Sqlite>,
        publisher: ProgressPublisher,
        cache: CacheService,
        max_attempts: u32,
    ) -> Self {
        Self {
            db_pool,
            publisher,
            cache,
            max_attempts: max_attempts.max(1),
            campaign_locks: Arc::new(DashMap::new()),
        }
    }

    fn campaign_lock(&self, campaign_id: &str) -> Arc<Mutex<()>> {
        self.campaign_locks
            .entry(campaign_id.to_string())
            .or_default()
            .clone()
    }

    /// Libera el lock de una campaña que ya no se está despachando.
    pub fn forget_campaign(&self, campaign_id: &str) {
        self.campaign_locks
            .remove_if(campaign_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub async fn get_job(&self, campaign_id: &str, contact_id: &str) -> DispatchResult<RecipientJob> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM recipient_jobs WHERE campaign_id = ?1 AND contact_id = ?2"
        );
        let row = sqlx::query_as::<_, RecipientJobRow>(&sql)
            .bind(campaign_id)
            .bind(contact_id)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| {
                DispatchError::NotFound(format!("recipient job {campaign_id}/{contact_id}"))
            })?;
        row.try_into()
    }

    /// Crea el job en `pending` si no existe y devuelve el estado actual.
    pub async fn ensure_job(
        &self,
        campaign_id: &str,
        recipient: &ResolvedRecipient,
    ) -> DispatchResult<RecipientJob> {
        let now = now_timestamp();
        sqlx::query(
            r#"
            INSERT INTO recipient_jobs (campaign_id, contact_id, phone, status, attempt_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)
            ON CONFLICT (campaign_id, contact_id) DO NOTHING
            "#,
        )
        .bind(campaign_id)
        .bind(&recipient.contact_id)
        .bind(&recipient.phone)
        .bind(&now)
        .execute(&self.db_pool)
        .await?;

        self.get_job(campaign_id, &recipient.contact_id).await
    }

    /// Marca el job en vuelo. Devuelve `None` si otro ya lo movió.
    pub async fn mark_sending(&self, job: &RecipientJob) -> DispatchResult<Option<RecipientJob>> {
        let now = now_timestamp();
        let result = sqlx::query(
            r#"
            UPDATE recipient_jobs
            SET status = 'sending', last_attempted_at = ?1, updated_at = ?1
            WHERE campaign_id = ?2 AND contact_id = ?3
              AND attempt_count = ?4 AND status IN ('pending', 'sending')
            "#,
        )
        .bind(&now)
        .bind(&job.campaign_id)
        .bind(&job.contact_id)
        .bind(i64::from(job.attempt_count))
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job(&job.campaign_id, &job.contact_id).await.map(Some)
    }

    /// `RecordAttempt(job, outcome)`: upsert idempotente por (campaña, destinatario).
    /// El UPDATE es condicional al `attempt_count` que traía el job, así que
    /// repetir la llamada con el mismo job no vuelve a incrementar.
    pub async fn record_attempt(
        &self,
        job: &RecipientJob,
        outcome: SendOutcome,
    ) -> DispatchResult<TrackedJob> {
        let next_attempts = job.attempt_count + 1;
        let (status, error_kind, error_message, provider_id) = match outcome {
            SendOutcome::Success {
                provider_message_id,
            } => (JobStatus::Sent, None, None, Some(provider_message_id)),
            SendOutcome::RetryableTransient { kind, message } => {
                let status = if next_attempts >= self.max_attempts {
                    JobStatus::Failed
                } else {
                    JobStatus::Pending
                };
                (status, Some(kind), Some(message), None)
            }
            SendOutcome::NonRetryablePermanent { kind, message } => {
                (JobStatus::Failed, Some(kind), Some(message), None)
            }
        };

        let lock = self.campaign_lock(&job.campaign_id);
        let _guard = lock.lock().await;

        let now = now_timestamp();
        let result = sqlx::query(
            r#"
            UPDATE recipient_jobs
            SET status = ?1,
                attempt_count = ?2,
                last_error_kind = ?3,
                last_error = ?4,
                provider_message_id = COALESCE(?5, provider_message_id),
                last_attempted_at = COALESCE(last_attempted_at, ?6),
                updated_at = ?6
            WHERE campaign_id = ?7 AND contact_id = ?8
              AND attempt_count = ?9 AND status IN ('pending', 'sending')
            "#,
        )
        .bind(status.as_str())
        .bind(i64::from(next_attempts))
        .bind(error_kind.map(ErrorKind::as_str))
        .bind(error_message)
        .bind(provider_id)
        .bind(&now)
        .bind(&job.campaign_id)
        .bind(&job.contact_id)
        .bind(i64::from(job.attempt_count))
        .execute(&self.db_pool)
        .await?;

        let current = self.get_job(&job.campaign_id, &job.contact_id).await?;
        let applied = result.rows_affected() == 1;
        if applied {
            log::debug!(
                "(record_attempt) {}/{} intento {} -> {}",
                current.campaign_id,
                current.contact_id,
                current.attempt_count,
                current.status
            );
            self.publish_progress(&job.campaign_id).await;
        } else {
            log::debug!(
                "(record_attempt) {}/{} duplicado ignorado (estado {}, intentos {})",
                current.campaign_id,
                current.contact_id,
                current.status,
                current.attempt_count
            );
        }
        Ok(TrackedJob {
            job: current,
            applied,
        })
    }

    /// Destinatario cuyo teléfono ya usa otro contacto de la campaña.
    pub async fn record_skipped_duplicate(
        &self,
        campaign_id: &str,
        recipient: &ResolvedRecipient,
    ) -> DispatchResult<TrackedJob> {
        let reason = format!(
            "duplicate of contact {}",
            recipient.duplicate_of.as_deref().unwrap_or("?")
        );
        self.force_terminal(campaign_id, recipient, JobStatus::SkippedDuplicate, None, &reason)
            .await
    }

    /// Falla el job sin registrar resultado del proveedor (p.ej. pánico en el
    /// worker). Un job que ya estaba en `sending` cuenta ese envío como intento.
    pub async fn fail_job(
        &self,
        campaign_id: &str,
        recipient: &ResolvedRecipient,
        kind: ErrorKind,
        message: &str,
    ) -> DispatchResult<TrackedJob> {
        self.force_terminal(campaign_id, recipient, JobStatus::Failed, Some(kind), message)
            .await
    }

    async fn force_terminal(
        &self,
        campaign_id: &str,
        recipient: &ResolvedRecipient,
        status: JobStatus,
        kind: Option<ErrorKind>,
        message: &str,
    ) -> DispatchResult<TrackedJob> {
        let lock = self.campaign_lock(campaign_id);
        let _guard = lock.lock().await;

        let now = now_timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO recipient_jobs (
                campaign_id, contact_id, phone, status, attempt_count,
                last_error_kind, last_error, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?7)
            ON CONFLICT (campaign_id, contact_id) DO UPDATE
            SET status = excluded.status,
                attempt_count = recipient_jobs.attempt_count
                    + (CASE WHEN recipient_jobs.status = 'sending' THEN 1 ELSE 0 END),
                last_error_kind = excluded.last_error_kind,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            WHERE recipient_jobs.status IN ('pending', 'sending')
            "#,
        )
        .bind(campaign_id)
        .bind(&recipient.contact_id)
        .bind(&recipient.phone)
        .bind(status.as_str())
        .bind(kind.map(ErrorKind::as_str))
        .bind(message)
        .bind(&now)
        .execute(&self.db_pool)
        .await?;

        let current = self.get_job(campaign_id, &recipient.contact_id).await?;
        let applied = result.rows_affected() == 1;
        if applied {
            self.publish_progress(campaign_id).await;
        }
        Ok(TrackedJob {
            job: current,
            applied,
        })
    }

    /// `ReconcileReceipt(providerMessageId, newStatus)`: aplica recibos del
    /// webhook respetando el lattice `Sent < Delivered < Read`; `Failed` absorbe.
    /// Recibos duplicados o fuera de orden no hacen retroceder el job.
    pub async fn reconcile_receipt(
        &self,
        provider_message_id: &str,
        receipt: ReceiptStatus,
        error: Option<(ErrorKind, String)>,
    ) -> DispatchResult<Option<TrackedJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM recipient_jobs WHERE provider_message_id = ?1");

        for _ in 0..RECEIPT_CAS_RETRIES {
            let row = sqlx::query_as::<_, RecipientJobRow>(&sql)
                .bind(provider_message_id)
                .fetch_optional(&self.db_pool)
                .await?;
            let Some(row) = row else {
                log::debug!("(reconcile_receipt) mensaje {} desconocido", provider_message_id);
                return Ok(None);
            };
            let job = RecipientJob::try_from(row)?;

            let Some(next) = job.status.apply_receipt(receipt) else {
                return Ok(Some(TrackedJob {
                    job,
                    applied: false,
                }));
            };

            let (kind, message) = match (&error, next) {
                (Some((kind, message)), JobStatus::Failed) => (Some(*kind), Some(message.clone())),
                (None, JobStatus::Failed) => (
                    Some(ErrorKind::InvalidRecipient),
                    Some("provider reported delivery failure".to_string()),
                ),
                _ => (job.last_error_kind, job.last_error.clone()),
            };

            let lock = self.campaign_lock(&job.campaign_id);
            let _guard = lock.lock().await;
            let result = sqlx::query(
                r#"
                UPDATE recipient_jobs
                SET status = ?1, last_error_kind = ?2, last_error = ?3, updated_at = ?4
                WHERE campaign_id = ?5 AND contact_id = ?6 AND status = ?7
                "#,
            )
            .bind(next.as_str())
            .bind(kind.map(ErrorKind::as_str))
            .bind(message)
            .bind(now_timestamp())
            .bind(&job.campaign_id)
            .bind(&job.contact_id)
            .bind(job.status.as_str())
            .execute(&self.db_pool)
            .await?;

            if result.rows_affected() == 1 {
                self.publish_progress(&job.campaign_id).await;
                let job = self.get_job(&job.campaign_id, &job.contact_id).await?;
                return Ok(Some(TrackedJob { job, applied: true }));
            }
            // otro recibo ganó la carrera: releer y recalcular
        }
        log::warn!(
            "(reconcile_receipt) no se pudo aplicar {:?} a {} tras {} intentos",
            receipt,
            provider_message_id,
            RECEIPT_CAS_RETRIES
        );
        Ok(None)
    }

    /// Contadores agregados + dueño de la campaña, desde la base.
    pub async fn counters(&self, campaign_id: &str) -> DispatchResult<(String, ProgressCounters)> {
        let row = sqlx::query_as::<_, CountersRow>(
            r#"
            SELECT c.owner_id AS owner_id,
                   COUNT(j.contact_id) AS total,
                   COALESCE(SUM(CASE WHEN j.status IN ('pending', 'sending') THEN 1 ELSE 0 END), 0) AS pending,
                   COALESCE(SUM(CASE WHEN j.status IN ('sent', 'delivered', 'read') THEN 1 ELSE 0 END), 0) AS sent,
                   COALESCE(SUM(CASE WHEN j.status IN ('delivered', 'read') THEN 1 ELSE 0 END), 0) AS delivered,
                   COALESCE(SUM(CASE WHEN j.status = 'read' THEN 1 ELSE 0 END), 0) AS read,
                   COALESCE(SUM(CASE WHEN j.status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                   COALESCE(SUM(CASE WHEN j.status = 'skipped_duplicate' THEN 1 ELSE 0 END), 0) AS skipped,
                   COALESCE(SUM(j.attempt_count), 0) AS attempts
            FROM campaigns c
            LEFT JOIN recipient_jobs j ON j.campaign_id = c.id
            WHERE c.id = ?1
            GROUP BY c.id
            "#,
        )
        .bind(campaign_id)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| DispatchError::NotFound(format!("campaign {campaign_id}")))?;

        let counters = ProgressCounters {
            total: row.total,
            pending: row.pending,
            sent: row.sent,
            delivered: row.delivered,
            read: row.read,
            failed: row.failed,
            skipped: row.skipped,
            attempts: row.attempts,
        };
        Ok((row.owner_id, counters))
    }

    /// Se llama con el lock de la campaña tomado: el orden de publicación
    /// coincide con el orden de las escrituras.
    async fn publish_progress(&self, campaign_id: &str) {
        match self.counters(campaign_id).await {
            Ok((owner_id, counters)) => {
                self.cache
                    .set_json(&counters_key(campaign_id), &counters, COUNTERS_TTL)
                    .await;
                self.publisher.publish(DispatchEvent::Progress(ProgressEvent {
                    campaign_id: campaign_id.to_string(),
                    owner_id,
                    counters,
                    timestamp: Utc::now(),
                }));
            }
            // el estado ya está persistido; el evento es best-effort
            Err(e) => log::warn!("(publish_progress) contadores de {} no disponibles: {}", campaign_id, e),
        }
    }

    pub async fn list_jobs(
        &self,
        campaign_id: &str,
        status: Option<JobStatus>,
        page: u64,
        page_size: u64,
    ) -> DispatchResult<ListRecipientJobsResponse> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 500);
        let offset = i64::try_from((page - 1).saturating_mul(page_size)).unwrap_or(i64::MAX);
        let status_filter = status.map(JobStatus::as_str);

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM recipient_jobs WHERE campaign_id = ?1 AND (?2 IS NULL OR status = ?2)",
        )
        .bind(campaign_id)
        .bind(status_filter)
        .fetch_one(&self.db_pool)
        .await?;

        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM recipient_jobs
            WHERE campaign_id = ?1 AND (?2 IS NULL OR status = ?2)
            ORDER BY contact_id
            LIMIT ?3 OFFSET ?4
            "#
        );
        let rows = sqlx::query_as::<_, RecipientJobRow>(&sql)
            .bind(campaign_id)
            .bind(status_filter)
            .bind(page_size as i64)
            .bind(offset)
            .fetch_all(&self.db_pool)
            .await?;

        let items = rows
            .into_iter()
            .map(RecipientJob::try_from)
            .collect::<DispatchResult<Vec<_>>>()?;

        Ok(ListRecipientJobsResponse {
            total: total.max(0) as u64,
            page,
            page_size,
            items,
        })
    }
}
