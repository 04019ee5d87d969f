//! services/recipient_resolver.rs
//! Expande el objetivo de una campaña en una secuencia ordenada y deduplicada
//! de destinatarios. La secuencia es perezosa (páginas por keyset) y
//! reiniciable: reiniciar = volver a resolver contra `recipient_jobs`, así una
//! campaña reanudada salta a los que ya terminaron.

use std::collections::{HashMap, VecDeque};

use futures_util::stream::{self, BoxStream, StreamExt};
use sqlx::{Pool, Sqlite};

use crate::errors::{DispatchError, DispatchResult};
use crate::models::campaign_model::{Campaign, TargetDefinition};
use crate::models::contact_model::{normalize_phone, ContactCandidateRow, ContactStatus};
use crate::models::recipient_job_model::ResolvedRecipient;

pub const DEFAULT_PAGE_SIZE: i64 = 500;

#[derive(Clone, Debug)]
pub struct RecipientResolver {
    db_pool: Pool<Sqlite>,
    page_size: i64,
}

struct ResolveState {
    resolver: RecipientResolver,
    campaign_id: String,
    owner_id: String,
    target: TargetDefinition,
    after: String,
    buffer: VecDeque<ResolvedRecipient>,
    /// teléfono normalizado -> contacto que lo usa en esta campaña
    seen: Option<HashMap<String, String>>,
    exhausted: bool,
}

impl RecipientResolver {
    pub fn new(db_pool: Pool<Sqlite>) -> Self {
        Self {
            db_pool,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Error de setup si el objetivo no puede producir destinatarios.
    pub async fn validate(&self, campaign: &Campaign) -> DispatchResult<()> {
        let target = &campaign.target;
        if target.list_ids.is_empty() {
            return Err(DispatchError::ResolverFailure(
                "target has no contact lists".to_string(),
            ));
        }

        let sql = format!(
            "SELECT id FROM contact_lists WHERE owner_id = ? AND id IN ({})",
            placeholders(target.list_ids.len())
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(&campaign.owner_id);
        for list_id in &target.list_ids {
            query = query.bind(list_id);
        }
        let found = query.fetch_all(&self.db_pool).await?;

        if let Some(missing) = target
            .list_ids
            .iter()
            .find(|id| !found.iter().any(|f| f == *id))
        {
            return Err(DispatchError::ResolverFailure(format!(
                "contact list {missing} does not exist"
            )));
        }
        Ok(())
    }

    /// `Resolve(campaign)`: stream perezoso de destinatarios pendientes.
    pub fn resolve(&self, campaign: &Campaign) -> BoxStream<'static, DispatchResult<ResolvedRecipient>> {
        let state = ResolveState {
            resolver: self.clone(),
            campaign_id: campaign.id.clone(),
            owner_id: campaign.owner_id.clone(),
            target: campaign.target.clone(),
            after: String::new(),
            buffer: VecDeque::new(),
            seen: None,
            exhausted: false,
        };

        stream::unfold(state, |mut st| async move {
            loop {
                if let Some(next) = st.buffer.pop_front() {
                    return Some((Ok(next), st));
                }
                if st.exhausted {
                    return None;
                }
                if st.seen.is_none() {
                    match st.resolver.claimed_phones(&st.campaign_id).await {
                        Ok(seen) => st.seen = Some(seen),
                        Err(e) => {
                            st.exhausted = true;
                            return Some((Err(e), st));
                        }
                    }
                }
                let page = st
                    .resolver
                    .fetch_page(&st.campaign_id, &st.owner_id, &st.target, &st.after)
                    .await;
                match page {
                    Ok(rows) => st.absorb(rows),
                    Err(e) => {
                        st.exhausted = true;
                        return Some((Err(e), st));
                    }
                }
            }
        })
        .boxed()
    }

    /// Total de contactos elegibles del objetivo (para la API y la caché).
    pub async fn count_targets(&self, campaign: &Campaign) -> DispatchResult<i64> {
        let (filter, binds) = target_filter(&campaign.owner_id, &campaign.target);
        let sql = format!("SELECT COUNT(*) FROM contacts c WHERE {filter}");
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for value in binds {
            query = query.bind(value);
        }
        Ok(query.fetch_one(&self.db_pool).await?)
    }

    async fn fetch_page(
        &self,
        campaign_id: &str,
        owner_id: &str,
        target: &TargetDefinition,
        after: &str,
    ) -> DispatchResult<Vec<ContactCandidateRow>> {
        if target.list_ids.is_empty() {
            return Ok(Vec::new());
        }
        let (filter, binds) = target_filter(owner_id, target);
        let sql = format!(
            r#"
            SELECT c.id, c.phone
            FROM contacts c
            WHERE {filter}
              AND c.id > ?
              AND NOT EXISTS (
                    SELECT 1 FROM recipient_jobs j
                    WHERE j.campaign_id = ? AND j.contact_id = c.id
                      AND j.status NOT IN ('pending', 'sending'))
            ORDER BY c.id
            LIMIT ?
            "#
        );

        let mut query = sqlx::query_as::<_, ContactCandidateRow>(&sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query
            .bind(after)
            .bind(campaign_id)
            .bind(self.page_size)
            .fetch_all(&self.db_pool)
            .await?;
        Ok(rows)
    }

    /// Teléfonos ya asignados a algún contacto en esta campaña.
    async fn claimed_phones(&self, campaign_id: &str) -> DispatchResult<HashMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT contact_id, phone FROM recipient_jobs
            WHERE campaign_id = ?1 AND status != 'skipped_duplicate'
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(contact_id, phone)| (normalize_phone(&phone), contact_id))
            .filter(|(phone, _)| !phone.is_empty())
            .collect())
    }
}

impl ResolveState {
    fn absorb(&mut self, rows: Vec<ContactCandidateRow>) {
        if (rows.len() as i64) < self.resolver.page_size {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.after = last.id.clone();
        }
        let seen = self.seen.get_or_insert_with(HashMap::new);
        for row in rows {
            let phone = normalize_phone(&row.phone);
            let duplicate_of = match seen.get(&phone) {
                Some(owner) if !phone.is_empty() && *owner != row.id => Some(owner.clone()),
                _ => None,
            };
            if duplicate_of.is_none() && !phone.is_empty() {
                seen.entry(phone.clone()).or_insert_with(|| row.id.clone());
            }
            self.buffer.push_back(ResolvedRecipient {
                contact_id: row.id,
                phone: if phone.is_empty() { row.phone } else { phone },
                duplicate_of,
            });
        }
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Filtro SQL del objetivo (alias `c` para contacts) y sus valores en orden.
fn target_filter(owner_id: &str, target: &TargetDefinition) -> (String, Vec<String>) {
    let mut binds = vec![owner_id.to_string()];
    binds.extend(target.list_ids.iter().cloned());

    let mut filter = format!(
        r#"c.owner_id = ? AND c.status = '{}'
           AND EXISTS (SELECT 1 FROM contact_list_members m
                       WHERE m.contact_id = c.id AND m.list_id IN ({}))"#,
        ContactStatus::Active.as_str(),
        placeholders(target.list_ids.len().max(1))
    );
    if target.list_ids.is_empty() {
        binds.push(String::new());
    }

    let mut tags = target.tags.clone();
    tags.sort();
    tags.dedup();
    if !tags.is_empty() {
        filter.push_str(&format!(
            r#"
           AND (SELECT COUNT(DISTINCT t.tag) FROM contact_tags t
                WHERE t.contact_id = c.id AND t.tag IN ({})) = {}"#,
            placeholders(tags.len()),
            tags.len()
        ));
        binds.extend(tags);
    }
    (filter, binds)
}
