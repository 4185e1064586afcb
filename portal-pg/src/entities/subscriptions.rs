//! Subscriptions with credentials encrypted at rest.

use super::id_page;
use crate::engine::{decode, encode, PgEngine, QueryOptions};
use crate::model::Entity;
use crate::sql::{Criteria, Join, JoinedField};
use ::async_trait::async_trait;
use portal_core::{
    create_random_id, DaoError, DaoOptions, DaoResult, IdRef, JsonMap, ListQuery, Page,
    Subscription, SubscriptionsDao,
};
use tracing::debug;

/// Projects application name, owner emails, owner registration names and
/// the owner list onto listing rows.
const APPLICATION_JOIN: Join = Join {
    clause: Some(
        "INNER JOIN wicked.applications b ON b.id = a.applications_id \
         LEFT JOIN (SELECT c.applications_id AS applications_id, string_agg(c.data->>'email', ' ') AS owner, \
         string_agg(d.name, ' ') AS user FROM wicked.owners c, wicked.registrations d \
         WHERE c.users_id = d.users_id GROUP BY c.applications_id) e ON e.applications_id = b.id",
    ),
    fields: &[
        JoinedField::new("b.data->>'name'", "application_name", "application_name"),
        JoinedField::new("e.owner", "owner", "owner"),
        JoinedField::new("e.user", "user", "user"),
        JoinedField::new(
            "(SELECT to_json(array_agg(row_to_json(tmp))) FROM (SELECT o.applications_id AS applications_id, \
             o.users_id AS users_id, o.data->>'role' AS role, o.data->>'email' AS email, r.name \
             FROM wicked.owners o INNER JOIN wicked.registrations r ON r.users_id = o.users_id \
             WHERE r.pool_id = 'wicked') tmp WHERE tmp.applications_id = b.id)",
            "owner_data",
            "owner_data",
        ),
    ],
};

/// Relational subscriptions.
#[derive(Debug, Clone)]
pub struct PgSubscriptions {
    engine: PgEngine,
    options: DaoOptions,
}

impl PgSubscriptions {
    pub fn new(engine: PgEngine, options: DaoOptions) -> Self {
        Self { engine, options }
    }

    fn decrypt(&self, row: JsonMap) -> DaoResult<Subscription> {
        let mut sub: Subscription = decode(row)?;
        self.options.cipher.decrypt_subscription(&mut sub)?;
        Ok(sub)
    }

    fn decrypt_page(&self, page: Page<JsonMap>) -> DaoResult<Page<Subscription>> {
        let rows = page
            .rows
            .into_iter()
            .map(|row| self.decrypt(row))
            .collect::<DaoResult<Vec<_>>>()?;
        Ok(Page {
            rows,
            count: page.count,
        })
    }

    fn encrypted_row(&self, sub: &Subscription) -> DaoResult<JsonMap> {
        let mut stored = sub.clone();
        self.options.cipher.encrypt_subscription(&mut stored)?;
        encode(&stored)
    }

    async fn single(&self, criteria: Criteria) -> DaoResult<Option<Subscription>> {
        self.engine
            .get_single_by(Entity::Subscriptions, &criteria, None)
            .await?
            .map(|row| self.decrypt(row))
            .transpose()
    }
}

#[async_trait]
impl SubscriptionsDao for PgSubscriptions {
    async fn get_by_app_id(&self, app_id: &str) -> DaoResult<Vec<Subscription>> {
        debug!(app_id, "subscriptions.get_by_app_id");
        let page = self
            .engine
            .get_by(
                Entity::Subscriptions,
                &Criteria::by("applications_id", app_id),
                &QueryOptions::new(),
            )
            .await?;
        Ok(self.decrypt_page(page)?.rows)
    }

    async fn get_by_client_id(&self, client_id: &str) -> DaoResult<Option<Subscription>> {
        debug!("subscriptions.get_by_client_id");
        self.single(Criteria::by("client_id", client_id)).await
    }

    async fn get_by_app_and_api(
        &self,
        app_id: &str,
        api_id: &str,
    ) -> DaoResult<Option<Subscription>> {
        debug!(app_id, api_id, "subscriptions.get_by_app_and_api");
        self.single(Criteria::by("applications_id", app_id).and_eq("api_id", api_id))
            .await
    }

    async fn get_by_api(
        &self,
        api_id: &str,
        offset: usize,
        limit: usize,
    ) -> DaoResult<Page<Subscription>> {
        debug!(api_id, offset, limit, "subscriptions.get_by_api");
        let page = self
            .engine
            .get_by(
                Entity::Subscriptions,
                &Criteria::by("api_id", api_id),
                &QueryOptions::paged(offset, limit),
            )
            .await?;
        self.decrypt_page(page)
    }

    async fn get_all(&self, query: &ListQuery) -> DaoResult<Page<Subscription>> {
        debug!(?query, "subscriptions.get_all");
        let mut criteria = Criteria::new();
        criteria.add_filter_options(&query.filter);
        let options = QueryOptions::from_list(query, Some("id ASC")).joined(&APPLICATION_JOIN);
        let page = self
            .engine
            .get_by(Entity::Subscriptions, &criteria, &options)
            .await?;
        self.decrypt_page(page)
    }

    async fn get_index(&self, offset: usize, limit: usize) -> DaoResult<Page<IdRef>> {
        debug!(offset, limit, "subscriptions.get_index");
        let page = self
            .engine
            .get_by(
                Entity::Subscriptions,
                &Criteria::new(),
                &QueryOptions::paged(offset, limit).ordered("id ASC"),
            )
            .await?;
        Ok(id_page(page))
    }

    async fn get_count(&self) -> DaoResult<i64> {
        self.engine.count(Entity::Subscriptions, None).await
    }

    async fn create(
        &self,
        mut sub: Subscription,
        creating_user_id: Option<&str>,
    ) -> DaoResult<Subscription> {
        debug!(app_id = %sub.application, api_id = %sub.api, "subscriptions.create");
        if self
            .get_by_app_and_api(&sub.application, &sub.api)
            .await?
            .is_some()
        {
            return Err(DaoError::conflict(format!(
                "Application {} already has a subscription to API {}",
                sub.application, sub.api
            )));
        }
        if sub.id.is_empty() {
            sub.id = create_random_id();
        } else if self
            .engine
            .get_by_id(Entity::Subscriptions, &sub.id, None)
            .await?
            .is_some()
        {
            return Err(DaoError::conflict(format!(
                "Subscription ID \"{}\" already exists.",
                sub.id
            )));
        }
        if sub.api_group.is_none() {
            sub.api_group = self.options.api_groups.get(&sub.api).cloned();
        }
        self.engine
            .upsert(
                Entity::Subscriptions,
                self.encrypted_row(&sub)?,
                creating_user_id,
                None,
            )
            .await?;
        Ok(sub)
    }

    async fn delete(&self, app_id: &str, api_id: &str, subscription_id: &str) -> DaoResult<()> {
        debug!(app_id, api_id, subscription_id, "subscriptions.delete");
        // Approvals of the subscription cascade in the database.
        let deleted = self
            .engine
            .delete_by_id(Entity::Subscriptions, subscription_id, None)
            .await?;
        if deleted == 0 {
            return Err(DaoError::not_found(format!(
                "Not found. Subscription to API \"{}\" does not exist: {}",
                api_id, app_id
            )));
        }
        Ok(())
    }

    async fn patch(
        &self,
        app_id: &str,
        sub: Subscription,
        patching_user_id: Option<&str>,
    ) -> DaoResult<Subscription> {
        debug!(app_id, subscription_id = %sub.id, "subscriptions.patch");
        let existing = self
            .engine
            .get_single_by(
                Entity::Subscriptions,
                &Criteria::by("id", &sub.id).and_eq("applications_id", app_id),
                None,
            )
            .await?;
        if existing.is_none() {
            return Err(DaoError::not_found("Not found. Subscription does not exist"));
        }
        self.engine
            .upsert(
                Entity::Subscriptions,
                self.encrypted_row(&sub)?,
                patching_user_id,
                None,
            )
            .await?;
        Ok(sub)
    }
}
