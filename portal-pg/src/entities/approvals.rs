//! Pending subscription approvals.

use crate::engine::{PgEngine, QueryOptions};
use crate::model::Entity;
use crate::sql::Criteria;
use ::async_trait::async_trait;
use portal_core::{create_random_id, Approval, ApprovalsDao, DaoError, DaoResult};
use tracing::debug;

/// Relational approvals.
#[derive(Debug, Clone)]
pub struct PgApprovals {
    engine: PgEngine,
}

impl PgApprovals {
    pub fn new(engine: PgEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ApprovalsDao for PgApprovals {
    async fn get_all(&self) -> DaoResult<Vec<Approval>> {
        debug!("approvals.get_all");
        Ok(self
            .engine
            .get_page::<Approval>(Entity::Approvals, &Criteria::new(), &QueryOptions::new())
            .await?
            .rows)
    }

    async fn create(&self, mut approval: Approval) -> DaoResult<Approval> {
        debug!(subscription_id = %approval.subscription_id, "approvals.create");
        if approval.id.is_empty() {
            approval.id = create_random_id();
        } else if self
            .engine
            .get_by_id(Entity::Approvals, &approval.id, None)
            .await?
            .is_some()
        {
            return Err(DaoError::conflict(format!(
                "Approval ID \"{}\" already exists.",
                approval.id
            )));
        }
        self.engine
            .upsert_entity(Entity::Approvals, &approval, None, None)
            .await?;
        Ok(approval)
    }

    async fn delete_by_app_and_api(&self, app_id: &str, api_id: &str) -> DaoResult<()> {
        debug!(app_id, api_id, "approvals.delete_by_app_and_api");
        // Only a handful of approvals are ever pending, so a scan is fine.
        let approvals = self.get_all().await?;
        match approvals
            .iter()
            .find(|a| a.api.id == api_id && a.application.id == app_id)
        {
            Some(approval) => {
                self.engine
                    .delete_by_id(Entity::Approvals, &approval.id, None)
                    .await?;
            }
            None => debug!(app_id, api_id, "no matching approval"),
        }
        Ok(())
    }
}
