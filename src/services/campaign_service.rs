//! services/campaign_service.rs
//! Store de campañas: consultas del dispatcher, claim con lease y transiciones de estado.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::errors::{DispatchError, DispatchResult};
use crate::models::campaign_model::{
    Campaign, CampaignRow, CampaignStatus, ControlAction, TargetDefinition, TemplateRef,
};
use crate::models::{db_timestamp, now_timestamp};

const CAMPAIGN_COLUMNS: &str = r#"
    id, owner_id, name, status, target_json, template_name, template_language,
    template_params_json, sending_number_id, scheduled_at, lease_owner,
    failure_reason, created_at, updated_at
"#;

/// Datos para crear una campaña (la API de creación vive fuera del motor).
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub owner_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub target: TargetDefinition,
    pub template: TemplateRef,
    pub template_params: Vec<String>,
    pub sending_number_id: String,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct CampaignService {
    db_pool: Pool<Sqlite>,
}

impl CampaignService {
    pub fn new(db_pool: Pool<Sqlite>) -> Self {
        CampaignService { db_pool }
    }

    /// Corre migraciones con sqlx
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.db_pool).await?;
        Ok(())
    }

    pub async fn create_campaign(&self, new: NewCampaign) -> DispatchResult<Campaign> {
        let id = Uuid::new_v4().to_string();
        let now = now_timestamp();

        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, owner_id, name, status, target_json, template_name,
                template_language, template_params_json, sending_number_id,
                scheduled_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            "#,
        )
        .bind(&id)
        .bind(&new.owner_id)
        .bind(&new.name)
        .bind(new.status.as_str())
        .bind(serde_json::to_string(&new.target)?)
        .bind(&new.template.name)
        .bind(&new.template.language)
        .bind(serde_json::to_string(&new.template_params)?)
        .bind(&new.sending_number_id)
        .bind(new.scheduled_at.map(db_timestamp))
        .bind(&now)
        .execute(&self.db_pool)
        .await?;

        self.get_campaign(&id).await
    }

    pub async fn get_campaign(&self, campaign_id: &str) -> DispatchResult<Campaign> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1");
        let row = sqlx::query_as::<_, CampaignRow>(&sql)
            .bind(campaign_id)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("campaign {campaign_id}")))?;
        row.try_into()
    }

    /// Campañas listas para correr: `scheduled` con inicio vencido, o `running`
    /// sin lease vigente (reanudación tras caída o tras `resume`).
    pub async fn find_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DispatchResult<Vec<Campaign>> {
        let sql = format!(
            r#"
            SELECT {CAMPAIGN_COLUMNS}
            FROM campaigns
            WHERE (status = 'scheduled' AND (scheduled_at IS NULL OR scheduled_at <= ?1))
               OR (status = 'running'
                   AND (lease_owner IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= ?1))
            ORDER BY COALESCE(scheduled_at, created_at)
            LIMIT ?2
            "#
        );
        let rows = sqlx::query_as::<_, CampaignRow>(&sql)
            .bind(db_timestamp(now))
            .bind(limit)
            .fetch_all(&self.db_pool)
            .await?;

        let mut campaigns = Vec::with_capacity(rows.len());
        for row in rows {
            match Campaign::try_from(row) {
                Ok(campaign) => campaigns.push(campaign),
                Err(e) => log::error!("(find_dispatchable) campaña ilegible: {}", e),
            }
        }
        Ok(campaigns)
    }

    /// Claim exclusivo: un único UPDATE condicional hace la transición
    /// `scheduled -> running` (o toma un `running` sin lease) y graba el lease.
    /// Si no afecta filas, otro ganó la carrera: `ClaimConflict`.
    pub async fn claim(
        &self,
        campaign_id: &str,
        lease_token: &str,
        lease: Duration,
    ) -> DispatchResult<Campaign> {
        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));

        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'running',
                lease_owner = ?1,
                lease_expires_at = ?2,
                updated_at = ?3
            WHERE id = ?4
              AND (
                    (status = 'scheduled' AND (scheduled_at IS NULL OR scheduled_at <= ?3))
                 OR (status = 'running'
                     AND (lease_owner IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= ?3))
              )
            "#,
        )
        .bind(lease_token)
        .bind(db_timestamp(expires))
        .bind(db_timestamp(now))
        .bind(campaign_id)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(DispatchError::ClaimConflict(campaign_id.to_string()));
        }
        self.get_campaign(campaign_id).await
    }

    /// Renueva el lease. `false` = ya no somos dueños o la campaña dejó de correr.
    pub async fn renew_lease(
        &self,
        campaign_id: &str,
        lease_token: &str,
        lease: Duration,
    ) -> DispatchResult<bool> {
        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET lease_expires_at = ?1, updated_at = ?2
            WHERE id = ?3 AND lease_owner = ?4 AND status = 'running'
            "#,
        )
        .bind(db_timestamp(expires))
        .bind(db_timestamp(now))
        .bind(campaign_id)
        .bind(lease_token)
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Suelta el lease sin cambiar el estado: la próxima pasada la retoma.
    pub async fn release_lease(&self, campaign_id: &str, lease_token: &str) -> DispatchResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET lease_owner = NULL, lease_expires_at = NULL, updated_at = ?1
            WHERE id = ?2 AND lease_owner = ?3
            "#,
        )
        .bind(now_timestamp())
        .bind(campaign_id)
        .bind(lease_token)
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `running -> completed|failed`, sólo si seguimos siendo dueños del lease.
    pub async fn finish(
        &self,
        campaign_id: &str,
        lease_token: &str,
        status: CampaignStatus,
        reason: Option<&str>,
    ) -> DispatchResult<bool> {
        if !CampaignStatus::Running.can_transition_to(status) {
            return Err(DispatchError::InvalidTransition {
                from: CampaignStatus::Running.to_string(),
                action: status.to_string(),
            });
        }
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = ?1,
                failure_reason = ?2,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = ?3
            WHERE id = ?4 AND status = 'running' AND lease_owner = ?5
            "#,
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(now_timestamp())
        .bind(campaign_id)
        .bind(lease_token)
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Aplica pausa/reanudación/cancelación. Sólo cambia el estado: el lease
    /// sigue siendo de la rutina que la conducía hasta que ésta lo suelte o
    /// venza, así una campaña reanudada no se puede reclamar antes.
    pub async fn apply_control(
        &self,
        campaign_id: &str,
        action: ControlAction,
    ) -> DispatchResult<Campaign> {
        let (from, to) = action.transition();
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE campaigns
            SET status = ?, updated_at = ?
            WHERE id = ? AND status IN ({placeholders})
            "#
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(now_timestamp())
            .bind(campaign_id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.db_pool).await?;

        let campaign = self.get_campaign(campaign_id).await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::InvalidTransition {
                from: campaign.status.to_string(),
                action: action.as_str().to_string(),
            });
        }
        Ok(campaign)
    }
}
