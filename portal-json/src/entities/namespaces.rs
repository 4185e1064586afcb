//! Namespaces: one `namespaces/<poolId>.json` list per pool.

use crate::store::{read_json_or_default, write_json, JsonStore};
use ::async_trait::async_trait;
use portal_core::{filter_and_page, DaoResult, ListQuery, Namespace, NamespacesDao, Page};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Document-store namespaces.
#[derive(Debug, Clone)]
pub struct JsonNamespaces {
    store: Arc<JsonStore>,
}

impl JsonNamespaces {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self { store }
    }

    fn pool_file(&self, pool_id: &str) -> DaoResult<PathBuf> {
        self.store.entity_file("namespaces", pool_id, ".json")
    }

    fn load(&self, pool_id: &str) -> DaoResult<Vec<Namespace>> {
        read_json_or_default(&self.pool_file(pool_id)?)
    }

    fn save(&self, pool_id: &str, namespaces: &[Namespace]) -> DaoResult<()> {
        write_json(&self.pool_file(pool_id)?, namespaces)
    }
}

#[async_trait]
impl NamespacesDao for JsonNamespaces {
    async fn get_by_pool(&self, pool_id: &str, query: &ListQuery) -> DaoResult<Page<Namespace>> {
        filter_and_page(self.load(pool_id)?, query, Some("description ASC"))
    }

    async fn get_by_pool_and_namespace(
        &self,
        pool_id: &str,
        namespace: &str,
    ) -> DaoResult<Option<Namespace>> {
        Ok(self.load(pool_id)?.into_iter().find(|n| n.namespace == namespace))
    }

    async fn upsert(
        &self,
        pool_id: &str,
        namespace: &str,
        _upserting_user_id: Option<&str>,
        mut data: Namespace,
    ) -> DaoResult<()> {
        debug!(pool_id, namespace, "namespaces.upsert");
        data.pool_id = pool_id.to_string();
        data.namespace = namespace.to_string();
        let mut all = self.load(pool_id)?;
        match all.iter_mut().find(|n| n.namespace == namespace) {
            Some(existing) => *existing = data,
            None => all.push(data),
        }
        self.save(pool_id, &all)
    }

    async fn delete(
        &self,
        pool_id: &str,
        namespace: &str,
        _deleting_user_id: Option<&str>,
    ) -> DaoResult<()> {
        let mut all = self.load(pool_id)?;
        let Some(pos) = all.iter().position(|n| n.namespace == namespace) else {
            debug!(pool_id, namespace, "namespace not present, nothing to delete");
            return Ok(());
        };
        all.remove(pos);
        self.save(pool_id, &all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store;

    fn ns(description: &str) -> Namespace {
        Namespace {
            description: description.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_list_delete() {
        let (_dir, store) = test_store();
        let namespaces = JsonNamespaces::new(store);
        namespaces.upsert("pool", "b", None, ns("Bravo")).await.unwrap();
        namespaces.upsert("pool", "a", None, ns("Alpha")).await.unwrap();
        namespaces.upsert("pool", "b", None, ns("Beta")).await.unwrap();

        let page = namespaces.get_by_pool("pool", &ListQuery::new()).await.unwrap();
        assert_eq!(page.count.count, 2);
        assert_eq!(page.rows[0].namespace, "a");
        assert_eq!(page.rows[1].description, "Beta");

        let filtered = namespaces
            .get_by_pool("pool", &ListQuery::new().with_filter("description", "alp"))
            .await
            .unwrap();
        assert_eq!(filtered.rows.len(), 1);

        namespaces.delete("pool", "a", None).await.unwrap();
        namespaces.delete("pool", "a", None).await.unwrap();
        assert!(namespaces.get_by_pool_and_namespace("pool", "a").await.unwrap().is_none());
        assert_eq!(
            namespaces.get_by_pool_and_namespace("pool", "b").await.unwrap().unwrap().pool_id,
            "pool"
        );
    }
}
