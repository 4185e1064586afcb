//! Pool registrations of users, optionally scoped to a namespace.

use crate::engine::{decode_page, PgEngine, QueryOptions};
use crate::model::Entity;
use crate::sql::{Criteria, Op};
use ::async_trait::async_trait;
use portal_core::{
    create_random_id, DaoError, DaoResult, JsonMap, ListQuery, Page, Registration,
    RegistrationsDao, UserRegistrations,
};
use serde_json::Value as JsonValue;
use tracing::debug;

/// Id of the single row matching `criteria`, or a fresh id.
///
/// Used by the read-then-upsert entities, which key rows by a generated id
/// but are addressed by a natural key.
pub(crate) fn reuse_id(rows: &[JsonMap], what: impl FnOnce() -> String) -> DaoResult<String> {
    match rows {
        [] => Ok(create_random_id()),
        [row] => row
            .get("id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| DaoError::internal(format!("Row without id in {}", what()))),
        _ => Err(DaoError::internal(format!("More than one entry in {}", what()))),
    }
}

/// Group registrations by pool id.
fn group_by_pool(registrations: Vec<Registration>) -> UserRegistrations {
    let mut grouped = UserRegistrations::default();
    for registration in registrations {
        grouped
            .pools
            .entry(registration.pool_id.clone())
            .or_default()
            .push(registration);
    }
    grouped
}

/// Relational registrations.
#[derive(Debug, Clone)]
pub struct PgRegistrations {
    engine: PgEngine,
}

impl PgRegistrations {
    pub fn new(engine: PgEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl RegistrationsDao for PgRegistrations {
    async fn get_by_pool_and_user(
        &self,
        pool_id: &str,
        user_id: &str,
    ) -> DaoResult<Page<Registration>> {
        debug!(pool_id, user_id, "registrations.get_by_pool_and_user");
        self.engine
            .get_page(
                Entity::Registrations,
                &Criteria::by("poolId", pool_id).and_eq("userId", user_id),
                &QueryOptions::new(),
            )
            .await
    }

    async fn get_by_pool_and_namespace(
        &self,
        pool_id: &str,
        namespace: Option<&str>,
        query: &ListQuery,
    ) -> DaoResult<Page<Registration>> {
        debug!(pool_id, ?namespace, ?query, "registrations.get_by_pool_and_namespace");
        let mut criteria = Criteria::by("poolId", pool_id);
        if let Some(namespace) = namespace.filter(|n| !n.is_empty()) {
            criteria.push("namespace", Op::Eq, namespace.into());
        }
        criteria.add_filter_options(&query.filter);
        self.engine
            .get_page(
                Entity::Registrations,
                &criteria,
                &QueryOptions::from_list(query, Some("name ASC")),
            )
            .await
    }

    async fn get_by_user(&self, user_id: &str) -> DaoResult<UserRegistrations> {
        debug!(user_id, "registrations.get_by_user");
        let page = self
            .engine
            .get_by(
                Entity::Registrations,
                &Criteria::by("userId", user_id),
                &QueryOptions::new().ordered("pool_id ASC"),
            )
            .await?;
        Ok(group_by_pool(decode_page(page)?.rows))
    }

    async fn upsert(
        &self,
        pool_id: &str,
        user_id: &str,
        upserting_user_id: Option<&str>,
        mut registration: Registration,
    ) -> DaoResult<()> {
        debug!(pool_id, user_id, "registrations.upsert");
        let mut criteria = Criteria::by("poolId", pool_id).and_eq("userId", user_id);
        if let Some(namespace) = registration.namespace.as_deref().filter(|n| !n.is_empty()) {
            criteria.push("namespace", Op::Eq, namespace.into());
        }
        let existing = self
            .engine
            .get_by(Entity::Registrations, &criteria, &QueryOptions::new().uncached())
            .await?;
        registration.id = Some(reuse_id(&existing.rows, || {
            format!(
                "registrations for pool {}, namespace {:?} and user {}",
                pool_id, registration.namespace, user_id
            )
        })?);
        registration.pool_id = pool_id.to_string();
        registration.user_id = user_id.to_string();
        self.engine
            .upsert_entity(Entity::Registrations, &registration, upserting_user_id, None)
            .await
    }

    async fn delete(
        &self,
        pool_id: &str,
        user_id: &str,
        namespace: Option<&str>,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<()> {
        debug!(pool_id, user_id, ?namespace, ?deleting_user_id, "registrations.delete");
        let mut criteria = Criteria::by("poolId", pool_id).and_eq("userId", user_id);
        if let Some(namespace) = namespace.filter(|n| !n.is_empty()) {
            criteria.push("namespace", Op::Eq, namespace.into());
        }
        let deleted = self
            .engine
            .delete_by(Entity::Registrations, &criteria, None)
            .await?;
        if deleted == 0 {
            return Err(DaoError::not_found("Not found"));
        }
        Ok(())
    }
}
