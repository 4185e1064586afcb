//! Scope grants per user, application and API.

use crate::engine::{PgEngine, QueryOptions};
use crate::model::Entity;
use crate::sql::Criteria;
use ::async_trait::async_trait;
use portal_core::{
    create_random_id, merge_grant_data, now_iso, ApiGrant, DaoError, DaoResult, GrantsDao, Page,
};
use tracing::debug;

fn grant_key(user_id: &str, application_id: &str, api_id: &str) -> Criteria {
    Criteria::by("userId", user_id)
        .and_eq("applicationId", application_id)
        .and_eq("apiId", api_id)
}

/// Relational grants.
#[derive(Debug, Clone)]
pub struct PgGrants {
    engine: PgEngine,
}

impl PgGrants {
    pub fn new(engine: PgEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl GrantsDao for PgGrants {
    async fn get_by_user_application_and_api(
        &self,
        user_id: &str,
        application_id: &str,
        api_id: &str,
    ) -> DaoResult<ApiGrant> {
        debug!(user_id, application_id, api_id, "grants.get_by_user_application_and_api");
        self.engine
            .get_single(Entity::Grants, &grant_key(user_id, application_id, api_id), None)
            .await?
            .ok_or_else(|| {
                DaoError::not_found(format!(
                    "User {} does not have a grants record for API {} for application {}",
                    user_id, api_id, application_id
                ))
            })
    }

    async fn get_by_user(&self, user_id: &str) -> DaoResult<Page<ApiGrant>> {
        debug!(user_id, "grants.get_by_user");
        self.engine
            .get_page(
                Entity::Grants,
                &Criteria::by("userId", user_id),
                &QueryOptions::new().ordered("application_id ASC"),
            )
            .await
    }

    async fn delete_by_user(
        &self,
        user_id: &str,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<()> {
        debug!(user_id, ?deleting_user_id, "grants.delete_by_user");
        let deleted = self
            .engine
            .delete_by(Entity::Grants, &Criteria::by("userId", user_id), None)
            .await?;
        debug!(user_id, deleted, "deleted grants");
        Ok(())
    }

    async fn upsert(
        &self,
        user_id: &str,
        application_id: &str,
        api_id: &str,
        upserting_user_id: Option<&str>,
        grants: ApiGrant,
    ) -> DaoResult<()> {
        debug!(user_id, application_id, api_id, "grants.upsert");
        let prev: Option<ApiGrant> = self
            .engine
            .get_single(Entity::Grants, &grant_key(user_id, application_id, api_id), None)
            .await?;
        let mut next = ApiGrant {
            id: Some(
                prev.as_ref()
                    .and_then(|p| p.id.clone())
                    .unwrap_or_else(create_random_id),
            ),
            user_id: user_id.to_string(),
            application_id: application_id.to_string(),
            api_id: api_id.to_string(),
            grants: grants.grants,
            extra: Default::default(),
        };
        merge_grant_data(prev.as_ref(), &mut next, &now_iso());
        self.engine
            .upsert_entity(Entity::Grants, &next, upserting_user_id, None)
            .await
    }

    async fn delete(
        &self,
        user_id: &str,
        application_id: &str,
        api_id: &str,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<()> {
        debug!(user_id, application_id, api_id, ?deleting_user_id, "grants.delete");
        // Surfaces NotFound for a missing record.
        self.get_by_user_application_and_api(user_id, application_id, api_id)
            .await?;
        self.engine
            .delete_by(Entity::Grants, &grant_key(user_id, application_id, api_id), None)
            .await?;
        Ok(())
    }
}
