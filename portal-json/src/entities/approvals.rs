//! Approvals: a single list in `approvals/_index.json`.

use crate::locks::LockKey;
use crate::store::{read_json, write_json, JsonStore};
use ::async_trait::async_trait;
use portal_core::{create_random_id, Approval, ApprovalsDao, DaoError, DaoResult};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Document-store approvals.
#[derive(Debug, Clone)]
pub struct JsonApprovals {
    store: Arc<JsonStore>,
}

impl JsonApprovals {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self { store }
    }

    fn index_file(&self) -> PathBuf {
        self.store.file("approvals", "_index.json")
    }

    fn load_approvals(&self) -> DaoResult<Vec<Approval>> {
        read_json(&self.index_file())?
            .ok_or_else(|| DaoError::internal("Approvals index not found."))
    }

    fn save_approvals(&self, approvals: &[Approval]) -> DaoResult<()> {
        write_json(&self.index_file(), approvals)
    }

    /// Drop every approval of an application. The caller holds the
    /// approvals lock.
    pub(crate) fn delete_by_app_unlocked(&self, app_id: &str) -> DaoResult<()> {
        let mut approvals = self.load_approvals()?;
        let before = approvals.len();
        approvals.retain(|a| a.application.id != app_id);
        if approvals.len() != before {
            debug!(app_id, removed = before - approvals.len(), "removed approvals of application");
            self.save_approvals(&approvals)?;
        }
        Ok(())
    }

    /// Drop the approval of one subscription under the approvals lock.
    pub(crate) fn delete_by_app_and_api_locked(&self, app_id: &str, api_id: &str) -> DaoResult<()> {
        let _lock = self.store.lock(LockKey::Approvals)?;
        let mut approvals = self.load_approvals()?;
        if let Some(pos) = approvals
            .iter()
            .position(|a| a.application.id == app_id && a.api.id == api_id)
        {
            approvals.remove(pos);
            self.save_approvals(&approvals)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ApprovalsDao for JsonApprovals {
    async fn get_all(&self) -> DaoResult<Vec<Approval>> {
        self.load_approvals()
    }

    async fn create(&self, mut approval: Approval) -> DaoResult<Approval> {
        debug!(subscription_id = %approval.subscription_id, "approvals.create");
        let _lock = self.store.lock(LockKey::Approvals)?;
        let mut approvals = self.load_approvals()?;
        if approval.id.is_empty() {
            approval.id = create_random_id();
        } else if approvals.iter().any(|a| a.id == approval.id) {
            return Err(DaoError::conflict(format!(
                "Approval ID \"{}\" already exists.",
                approval.id
            )));
        }
        approvals.push(approval.clone());
        self.save_approvals(&approvals)?;
        Ok(approval)
    }

    async fn delete_by_app_and_api(&self, app_id: &str, api_id: &str) -> DaoResult<()> {
        debug!(app_id, api_id, "approvals.delete_by_app_and_api");
        self.delete_by_app_and_api_locked(app_id, api_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store;
    use portal_core::EntityRef;

    fn approval(id: &str, app: &str, api: &str) -> Approval {
        Approval {
            id: id.into(),
            subscription_id: format!("{}-{}", app, api),
            application: EntityRef { id: app.into(), ..Default::default() },
            api: EntityRef { id: api.into(), ..Default::default() },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_delete_by_app_and_api() {
        let (_dir, store) = test_store();
        let approvals = JsonApprovals::new(store);
        approvals.create(approval("a1", "app1", "petstore")).await.unwrap();
        approvals.create(approval("a2", "app1", "weather")).await.unwrap();
        approvals.delete_by_app_and_api("app1", "petstore").await.unwrap();
        let rest = approvals.get_all().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "a2");
        // Unknown pair is a no-op.
        approvals.delete_by_app_and_api("app9", "petstore").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_by_app_removes_all() {
        let (_dir, store) = test_store();
        let approvals = JsonApprovals::new(store);
        approvals.create(approval("a1", "app1", "petstore")).await.unwrap();
        approvals.create(approval("a2", "app1", "weather")).await.unwrap();
        approvals.create(approval("a3", "app2", "weather")).await.unwrap();
        approvals.delete_by_app_unlocked("app1").unwrap();
        assert_eq!(approvals.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_existing_id_and_fills_missing_one() {
        let (_dir, store) = test_store();
        let approvals = JsonApprovals::new(store);
        approvals.create(approval("a1", "app1", "petstore")).await.unwrap();
        let err = approvals
            .create(approval("a1", "app2", "weather"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);

        let generated = approvals.create(approval("", "app2", "weather")).await.unwrap();
        assert_eq!(generated.id.len(), 40);
        let all = approvals.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].id, generated.id);
    }

    #[tokio::test]
    async fn test_missing_index_is_internal() {
        let (_dir, store) = test_store();
        std::fs::remove_file(store.file("approvals", "_index.json")).unwrap();
        let err = JsonApprovals::new(store).get_all().await.unwrap_err();
        assert_eq!(err.status_code(), 500);
    }
}
