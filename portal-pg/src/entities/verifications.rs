//! Email verification and password reset records.

use crate::engine::{PgEngine, QueryOptions};
use crate::model::Entity;
use crate::sql::Criteria;
use ::async_trait::async_trait;
use portal_core::{create_random_id, now_utc_secs, DaoError, DaoResult, Verification, VerificationsDao};
use tracing::{debug, info};

/// Ids of verifications created more than `expiry_secs` before `now`.
fn expired_ids(verifications: &[Verification], now: i64, expiry_secs: i64) -> Vec<String> {
    verifications
        .iter()
        .filter(|v| now - v.utc > expiry_secs)
        .map(|v| v.id.clone())
        .collect()
}

/// Relational verifications.
#[derive(Debug, Clone)]
pub struct PgVerifications {
    engine: PgEngine,
}

impl PgVerifications {
    pub fn new(engine: PgEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl VerificationsDao for PgVerifications {
    async fn get_all(&self) -> DaoResult<Vec<Verification>> {
        debug!("verifications.get_all");
        Ok(self
            .engine
            .get_page::<Verification>(Entity::Verifications, &Criteria::new(), &QueryOptions::new())
            .await?
            .rows)
    }

    async fn get_by_id(&self, verification_id: &str) -> DaoResult<Option<Verification>> {
        debug!(verification_id, "verifications.get_by_id");
        self.engine
            .get_single(Entity::Verifications, &Criteria::by("id", verification_id), None)
            .await
    }

    async fn create(&self, mut verification: Verification) -> DaoResult<Verification> {
        debug!(kind = %verification.kind, "verifications.create");
        if verification.id.is_empty() {
            verification.id = create_random_id();
        } else if self
            .engine
            .get_by_id(Entity::Verifications, &verification.id, None)
            .await?
            .is_some()
        {
            return Err(DaoError::conflict(format!(
                "Verification ID \"{}\" already exists.",
                verification.id
            )));
        }
        if verification.utc == 0 {
            verification.utc = now_utc_secs();
        }
        self.engine
            .upsert_entity(Entity::Verifications, &verification, None, None)
            .await?;
        Ok(verification)
    }

    async fn delete(&self, verification_id: &str) -> DaoResult<()> {
        debug!(verification_id, "verifications.delete");
        let deleted = self
            .engine
            .delete_by_id(Entity::Verifications, verification_id, None)
            .await?;
        if deleted == 0 {
            return Err(DaoError::not_found("Not found. Verification ID not found."));
        }
        Ok(())
    }

    async fn reconcile(&self, expiry_secs: i64) -> DaoResult<()> {
        info!("Running verification record reconciliation.");
        let verifications = self.get_all().await?;
        debug!(count = verifications.len(), "found verifications");
        let expired = expired_ids(&verifications, now_utc_secs(), expiry_secs);
        if expired.is_empty() {
            return Ok(());
        }
        info!(
            count = expired.len(),
            expiry_secs, "Pruning expired verification records"
        );
        for id in expired {
            self.delete(&id).await?;
        }
        Ok(())
    }
}
