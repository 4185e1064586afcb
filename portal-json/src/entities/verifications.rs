//! Verifications: a single list in `verifications/_index.json`.

use crate::locks::LockKey;
use crate::store::{read_json_or_default, write_json, JsonStore};
use ::async_trait::async_trait;
use portal_core::{create_random_id, now_utc_secs, DaoError, DaoResult, Verification, VerificationsDao};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Document-store verifications.
#[derive(Debug, Clone)]
pub struct JsonVerifications {
    store: Arc<JsonStore>,
}

impl JsonVerifications {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self { store }
    }

    fn index_file(&self) -> PathBuf {
        self.store.file("verifications", "_index.json")
    }

    fn load(&self) -> DaoResult<Vec<Verification>> {
        read_json_or_default(&self.index_file())
    }

    fn save(&self, verifications: &[Verification]) -> DaoResult<()> {
        write_json(&self.index_file(), verifications)
    }
}

#[async_trait]
impl VerificationsDao for JsonVerifications {
    async fn get_all(&self) -> DaoResult<Vec<Verification>> {
        self.load()
    }

    async fn get_by_id(&self, verification_id: &str) -> DaoResult<Option<Verification>> {
        Ok(self.load()?.into_iter().find(|v| v.id == verification_id))
    }

    async fn create(&self, mut verification: Verification) -> DaoResult<Verification> {
        debug!(kind = %verification.kind, "verifications.create");
        let _lock = self.store.lock(LockKey::Verifications)?;
        let mut all = self.load()?;
        if verification.id.is_empty() {
            verification.id = create_random_id();
        } else if all.iter().any(|v| v.id == verification.id) {
            return Err(DaoError::conflict(format!(
                "Verification ID \"{}\" already exists.",
                verification.id
            )));
        }
        if verification.utc == 0 {
            verification.utc = now_utc_secs();
        }
        all.push(verification.clone());
        self.save(&all)?;
        Ok(verification)
    }

    async fn delete(&self, verification_id: &str) -> DaoResult<()> {
        debug!("verifications.delete");
        let _lock = self.store.lock(LockKey::Verifications)?;
        let mut all = self.load()?;
        let pos = all
            .iter()
            .position(|v| v.id == verification_id)
            .ok_or_else(|| DaoError::not_found("Not found. Verification ID not found."))?;
        all.remove(pos);
        self.save(&all)
    }

    async fn reconcile(&self, expiry_secs: i64) -> DaoResult<()> {
        // A busy index just means this run is skipped.
        let Some(_lock) = self.store.locks().try_lock(&LockKey::Verifications)? else {
            debug!("verifications busy, skipping reconcile");
            return Ok(());
        };
        let mut all = self.load()?;
        let now = now_utc_secs();
        let before = all.len();
        all.retain(|v| now - v.utc <= expiry_secs);
        if all.len() != before {
            debug!(expired = before - all.len(), "removed expired verifications");
            self.save(&all)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store;

    fn verification(id: &str, utc: i64) -> Verification {
        Verification {
            id: id.into(),
            kind: "email".into(),
            email: "a@b.c".into(),
            user_id: "u1".into(),
            utc,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let (_dir, store) = test_store();
        let verifs = JsonVerifications::new(store);
        verifs.create(verification("v1", now_utc_secs())).await.unwrap();
        assert!(verifs.get_by_id("v1").await.unwrap().is_some());
        verifs.delete("v1").await.unwrap();
        assert_eq!(verifs.delete("v1").await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn test_create_rejects_existing_id_and_fills_missing_one() {
        let (_dir, store) = test_store();
        let verifs = JsonVerifications::new(store);
        verifs.create(verification("v1", now_utc_secs())).await.unwrap();
        let err = verifs.create(verification("v1", now_utc_secs())).await.unwrap_err();
        assert_eq!(err.status_code(), 409);

        let created = verifs.create(verification("", 0)).await.unwrap();
        assert!(!created.id.is_empty());
        assert!(created.utc > 0);
        assert_eq!(verifs.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_removes_expired() {
        let (_dir, store) = test_store();
        let verifs = JsonVerifications::new(store);
        let now = now_utc_secs();
        verifs.create(verification("old", now - 7200)).await.unwrap();
        verifs.create(verification("new", now)).await.unwrap();
        verifs.reconcile(3600).await.unwrap();
        let left = verifs.get_all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "new");
    }

    #[tokio::test]
    async fn test_reconcile_skips_when_locked() {
        let (_dir, store) = test_store();
        let verifs = JsonVerifications::new(store.clone());
        verifs.create(verification("old", 0)).await.unwrap();
        let _held = store.lock(LockKey::Verifications).unwrap();
        verifs.reconcile(1).await.unwrap();
        assert_eq!(verifs.get_all().await.unwrap().len(), 1);
    }
}
