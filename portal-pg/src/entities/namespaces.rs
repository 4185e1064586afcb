//! Namespaces within registration pools.

use super::registrations::reuse_id;
use crate::engine::{PgEngine, QueryOptions};
use crate::model::Entity;
use crate::sql::Criteria;
use ::async_trait::async_trait;
use portal_core::{DaoResult, ListQuery, Namespace, NamespacesDao, Page};
use tracing::debug;

fn namespace_key(pool_id: &str, namespace: &str) -> Criteria {
    Criteria::by("poolId", pool_id).and_eq("namespace", namespace)
}

/// Relational namespaces.
#[derive(Debug, Clone)]
pub struct PgNamespaces {
    engine: PgEngine,
}

impl PgNamespaces {
    pub fn new(engine: PgEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl NamespacesDao for PgNamespaces {
    async fn get_by_pool(&self, pool_id: &str, query: &ListQuery) -> DaoResult<Page<Namespace>> {
        debug!(pool_id, ?query, "namespaces.get_by_pool");
        let mut criteria = Criteria::by("poolId", pool_id);
        criteria.add_filter_options(&query.filter);
        self.engine
            .get_page(
                Entity::Namespaces,
                &criteria,
                &QueryOptions::from_list(query, Some("description ASC")),
            )
            .await
    }

    async fn get_by_pool_and_namespace(
        &self,
        pool_id: &str,
        namespace: &str,
    ) -> DaoResult<Option<Namespace>> {
        debug!(pool_id, namespace, "namespaces.get_by_pool_and_namespace");
        self.engine
            .get_single(Entity::Namespaces, &namespace_key(pool_id, namespace), None)
            .await
    }

    async fn upsert(
        &self,
        pool_id: &str,
        namespace: &str,
        upserting_user_id: Option<&str>,
        mut data: Namespace,
    ) -> DaoResult<()> {
        debug!(pool_id, namespace, "namespaces.upsert");
        let existing = self
            .engine
            .get_by(
                Entity::Namespaces,
                &namespace_key(pool_id, namespace),
                &QueryOptions::new().uncached(),
            )
            .await?;
        data.id = Some(reuse_id(&existing.rows, || {
            format!("namespaces for pool {} and namespace {}", pool_id, namespace)
        })?);
        data.pool_id = pool_id.to_string();
        data.namespace = namespace.to_string();
        self.engine
            .upsert_entity(Entity::Namespaces, &data, upserting_user_id, None)
            .await
    }

    async fn delete(
        &self,
        pool_id: &str,
        namespace: &str,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<()> {
        debug!(pool_id, namespace, ?deleting_user_id, "namespaces.delete");
        let deleted = self
            .engine
            .delete_by(Entity::Namespaces, &namespace_key(pool_id, namespace), None)
            .await?;
        if deleted == 0 {
            debug!(pool_id, namespace, "namespace not present, nothing to delete");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{make_sql_query, SelectShape};
    use portal_core::FilterValue;

    #[test]
    fn test_listing_by_pool_with_filter() {
        let query = ListQuery::paged(0, 10)
            .with_filter("description", FilterValue::Text("acme".into()));
        let mut criteria = Criteria::by("poolId", "wicked");
        criteria.add_filter_options(&query.filter);
        let shape = SelectShape {
            order_by: Some("description ASC"),
            limit: 10,
            ..Default::default()
        };
        let q = make_sql_query(Entity::Namespaces, &criteria.fields, &criteria.ops, &shape).unwrap();
        assert_eq!(
            q.query,
            "SELECT * FROM wicked.namespaces WHERE pool_id = $1 AND description ILIKE $2 \
             ORDER BY description ASC LIMIT 10 OFFSET 0"
        );
    }
}
