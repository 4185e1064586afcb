//! Subscriptions: one `<appId>.subs.json` list per application.
//!
//! Two secondary indexes are maintained next to the lists:
//! `subscription_index/<clientId>.json` points a client id at its
//! `{application, api}`, and `subscription_api_index/<apiId>.json` lists the
//! `{application, plan}` pairs subscribed to an API. Both can be rebuilt
//! from the lists at any time.

use super::applications::JsonApplications;
use super::approvals::JsonApprovals;
use crate::locks::LockKey;
use crate::store::{read_json, read_json_or_default, remove_if_exists, write_json, JsonStore};
use ::async_trait::async_trait;
use portal_core::{
    create_random_id, page_slice, ApiIndexEntry, DaoError, DaoResult, IdRef, ListQuery, Page,
    Subscription, SubscriptionIndexEntry, SubscriptionsDao,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub(crate) const SUBS_DIR: &str = "subscriptions";
pub(crate) const CLIENT_ID_INDEX_DIR: &str = "subscription_index";
pub(crate) const API_INDEX_DIR: &str = "subscription_api_index";
const SUBS_SUFFIX: &str = ".subs.json";

/// Document-store subscriptions.
#[derive(Debug, Clone)]
pub struct JsonSubscriptions {
    store: Arc<JsonStore>,
    approvals: JsonApprovals,
}

impl JsonSubscriptions {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self {
            approvals: JsonApprovals::new(store.clone()),
            store,
        }
    }

    pub(crate) fn subscriptions_file(&self, app_id: &str) -> DaoResult<PathBuf> {
        self.store.entity_file(SUBS_DIR, app_id, SUBS_SUFFIX)
    }

    fn client_id_file(&self, client_id: &str) -> DaoResult<PathBuf> {
        self.store.entity_file(CLIENT_ID_INDEX_DIR, client_id, ".json")
    }

    fn api_index_file(&self, api_id: &str) -> DaoResult<PathBuf> {
        self.store.entity_file(API_INDEX_DIR, api_id, ".json")
    }

    // ------------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------------

    /// Decrypted subscriptions of an application; empty if it has none.
    pub(crate) fn load_subscriptions(&self, app_id: &str) -> DaoResult<Vec<Subscription>> {
        debug!(app_id, "load_subscriptions");
        let mut subs: Vec<Subscription> = read_json_or_default(&self.subscriptions_file(app_id)?)?;
        let cipher = &self.store.options().cipher;
        for sub in subs.iter_mut() {
            cipher.decrypt_subscription(sub)?;
        }
        Ok(subs)
    }

    /// Encrypt credentials and write the list.
    pub(crate) fn save_subscriptions(&self, app_id: &str, subs: &[Subscription]) -> DaoResult<()> {
        debug!(app_id, count = subs.len(), "save_subscriptions");
        let cipher = &self.store.options().cipher;
        let mut stored = subs.to_vec();
        for sub in stored.iter_mut() {
            cipher.encrypt_subscription(sub)?;
        }
        write_json(&self.subscriptions_file(app_id)?, &stored)
    }

    fn find_subscription(&self, app_id: &str, api_id: &str) -> DaoResult<Option<Subscription>> {
        Ok(self
            .load_subscriptions(app_id)?
            .into_iter()
            .find(|s| s.api == api_id))
    }

    // ------------------------------------------------------------------------
    // Secondary indexes
    // ------------------------------------------------------------------------

    fn save_client_id_entry(&self, client_id: &str, sub: &Subscription) -> DaoResult<()> {
        let entry = SubscriptionIndexEntry {
            application: sub.application.clone(),
            api: sub.api.clone(),
        };
        write_json(&self.client_id_file(client_id)?, &entry)
    }

    pub(crate) fn remove_client_id_entry(&self, client_id: &str) -> DaoResult<()> {
        remove_if_exists(&self.client_id_file(client_id)?)?;
        Ok(())
    }

    fn load_api_index(&self, api_id: &str) -> DaoResult<Option<Vec<ApiIndexEntry>>> {
        read_json(&self.api_index_file(api_id)?)
    }

    fn add_api_index_entry(&self, sub: &Subscription) -> DaoResult<()> {
        let mut index = match self.load_api_index(&sub.api)? {
            Some(index) => index,
            None => {
                debug!(api_id = %sub.api, "creating subscription api index");
                Vec::new()
            }
        };
        match index.iter_mut().find(|e| e.application == sub.application) {
            Some(entry) => {
                warn!(
                    app_id = %sub.application,
                    api_id = %sub.api,
                    "application already indexed for api; updating plan"
                );
                entry.plan = sub.plan.clone();
            }
            None => index.push(ApiIndexEntry {
                application: sub.application.clone(),
                plan: sub.plan.clone(),
            }),
        }
        write_json(&self.api_index_file(&sub.api)?, &index)
    }

    pub(crate) fn remove_api_index_entry(&self, app_id: &str, api_id: &str) -> DaoResult<()> {
        let Some(mut index) = self.load_api_index(api_id)? else {
            warn!(app_id, api_id, "no subscription api index to remove entry from");
            return Ok(());
        };
        match index.iter().position(|e| e.application == app_id) {
            Some(pos) => {
                index.remove(pos);
                write_json(&self.api_index_file(api_id)?, &index)
            }
            None => {
                warn!(app_id, api_id, "application not present in subscription api index");
                Ok(())
            }
        }
    }

    /// Clear both secondary indexes and rebuild them from the lists.
    pub(crate) fn rebuild_indexes(&self) -> DaoResult<()> {
        for dir in [CLIENT_ID_INDEX_DIR, API_INDEX_DIR] {
            let path = self.store.dir(dir);
            if !path.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&path)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    std::fs::remove_file(entry.path())?;
                }
            }
            debug!(dir, "cleared subscription index");
        }

        let subs_dir = self.store.dir(SUBS_DIR);
        if !subs_dir.is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(self.store.dir(CLIENT_ID_INDEX_DIR))?;
        std::fs::create_dir_all(self.store.dir(API_INDEX_DIR))?;

        let mut rebuilt = 0usize;
        for entry in std::fs::read_dir(&subs_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(app_id) = name.to_str().and_then(|n| n.strip_suffix(SUBS_SUFFIX)) else {
                continue;
            };
            // Read raw: index entries need no decrypted secrets, except the
            // client id which is stored in clear.
            let subs: Vec<Subscription> = read_json_or_default(&entry.path())?;
            for sub in &subs {
                if sub.application != app_id {
                    warn!(app_id, sub_id = %sub.id, "subscription stored under foreign application");
                }
                if let Some(client_id) = sub.client_id.as_deref() {
                    self.save_client_id_entry(client_id, sub)?;
                }
                self.add_api_index_entry(sub)?;
                rebuilt += 1;
            }
        }
        info!(subscriptions = rebuilt, "rebuilt subscription indexes");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    fn create_subscription(&self, mut sub: Subscription) -> DaoResult<Subscription> {
        let app_id = sub.application.clone();
        let _lock = self.store.lock(LockKey::Subscriptions(app_id.clone()))?;
        let mut subs = self.load_subscriptions(&app_id)?;
        if subs.iter().any(|s| s.api == sub.api) {
            return Err(DaoError::conflict(format!(
                "Application {} already has a subscription to API {}",
                app_id, sub.api
            )));
        }
        if sub.id.is_empty() {
            sub.id = create_random_id();
        } else if self.all_subscription_ids()?.iter().any(|s| s.id == sub.id) {
            return Err(DaoError::conflict(format!(
                "Subscription ID \"{}\" already exists.",
                sub.id
            )));
        }
        if sub.api_group.is_none() {
            sub.api_group = self.store.options().api_groups.get(&sub.api).cloned();
        }

        subs.push(sub.clone());
        self.save_subscriptions(&app_id, &subs)?;
        if let Some(client_id) = sub.client_id.as_deref() {
            self.save_client_id_entry(client_id, &sub)?;
        }
        self.add_api_index_entry(&sub)?;
        Ok(sub)
    }

    fn delete_subscription(&self, app_id: &str, api_id: &str, subscription_id: &str) -> DaoResult<()> {
        let _lock = self.store.lock(LockKey::Subscriptions(app_id.to_string()))?;
        let mut subs = self.load_subscriptions(app_id)?;
        let pos = subs
            .iter()
            .position(|s| s.id == subscription_id)
            .ok_or_else(|| {
                DaoError::not_found(format!(
                    "Not found. Subscription to API \"{}\" does not exist: {}",
                    api_id, app_id
                ))
            })?;

        self.approvals.delete_by_app_and_api_locked(app_id, api_id)?;
        let removed = subs.remove(pos);
        self.save_subscriptions(app_id, &subs)?;
        if let Some(client_id) = removed.client_id.as_deref() {
            self.remove_client_id_entry(client_id)?;
        }
        self.remove_api_index_entry(app_id, &removed.api)
    }

    fn patch_subscription(&self, app_id: &str, sub: Subscription) -> DaoResult<Subscription> {
        let _lock = self.store.lock(LockKey::Subscriptions(app_id.to_string()))?;
        let mut subs = self.load_subscriptions(app_id)?;
        let slot = subs
            .iter_mut()
            .find(|s| s.id == sub.id)
            .ok_or_else(|| DaoError::not_found("Not found. Subscription does not exist"))?;
        let previous = std::mem::replace(slot, sub.clone());
        self.save_subscriptions(app_id, &subs)?;
        if let Some(old_client_id) = previous.client_id.as_deref() {
            if sub.client_id.as_deref() != Some(old_client_id) {
                debug!(app_id, "client id changed, dropping old index entry");
                self.remove_client_id_entry(old_client_id)?;
            }
        }
        if let Some(client_id) = sub.client_id.as_deref() {
            self.save_client_id_entry(client_id, &sub)?;
        }
        Ok(sub)
    }

    fn all_subscription_ids(&self) -> DaoResult<Vec<IdRef>> {
        let apps = JsonApplications::new(self.store.clone());
        let mut ids = Vec::new();
        for app in apps.load_index()? {
            ids.extend(
                self.load_subscriptions(&app.id)?
                    .into_iter()
                    .map(|s| IdRef { id: s.id }),
            );
        }
        ids.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(ids)
    }
}

#[async_trait]
impl SubscriptionsDao for JsonSubscriptions {
    async fn get_by_app_id(&self, app_id: &str) -> DaoResult<Vec<Subscription>> {
        self.load_subscriptions(app_id)
    }

    async fn get_by_client_id(&self, client_id: &str) -> DaoResult<Option<Subscription>> {
        debug!("subscriptions.get_by_client_id");
        let Some(entry) = read_json::<SubscriptionIndexEntry>(&self.client_id_file(client_id)?)?
        else {
            return Ok(None);
        };
        match self.find_subscription(&entry.application, &entry.api)? {
            Some(sub) => Ok(Some(sub)),
            None => {
                let message = format!(
                    "Inconsistent state. Please notify operator: Subscription for app {} to API {} not found.",
                    entry.application, entry.api
                );
                error!("{}", message);
                Err(DaoError::internal(message))
            }
        }
    }

    async fn get_by_app_and_api(
        &self,
        app_id: &str,
        api_id: &str,
    ) -> DaoResult<Option<Subscription>> {
        self.find_subscription(app_id, api_id)
    }

    async fn get_by_api(
        &self,
        api_id: &str,
        offset: usize,
        limit: usize,
    ) -> DaoResult<Page<Subscription>> {
        debug!(api_id, "subscriptions.get_by_api");
        let index = self.load_api_index(api_id)?.unwrap_or_default();
        let count = index.len() as i64;
        let mut rows = Vec::new();
        for entry in page_slice(index, offset, limit) {
            let sub = self.find_subscription(&entry.application, api_id)?.ok_or_else(|| {
                DaoError::internal(format!(
                    "Inconsistent state: api index of {} lists {} without subscription",
                    api_id, entry.application
                ))
            })?;
            rows.push(sub);
        }
        Ok(Page::new(rows, count, false))
    }

    async fn get_all(&self, _query: &ListQuery) -> DaoResult<Page<Subscription>> {
        Err(DaoError::not_implemented("subscriptions.getAll"))
    }

    async fn get_index(&self, offset: usize, limit: usize) -> DaoResult<Page<IdRef>> {
        let ids = self.all_subscription_ids()?;
        let count = ids.len() as i64;
        Ok(Page::new(page_slice(ids, offset, limit), count, false))
    }

    async fn get_count(&self) -> DaoResult<i64> {
        Ok(self.all_subscription_ids()?.len() as i64)
    }

    async fn create(
        &self,
        sub: Subscription,
        _creating_user_id: Option<&str>,
    ) -> DaoResult<Subscription> {
        debug!(app_id = %sub.application, api_id = %sub.api, "subscriptions.create");
        self.create_subscription(sub)
    }

    async fn delete(&self, app_id: &str, api_id: &str, subscription_id: &str) -> DaoResult<()> {
        debug!(app_id, api_id, "subscriptions.delete");
        self.delete_subscription(app_id, api_id, subscription_id)
    }

    async fn patch(
        &self,
        app_id: &str,
        sub: Subscription,
        _patching_user_id: Option<&str>,
    ) -> DaoResult<Subscription> {
        debug!(app_id, sub_id = %sub.id, "subscriptions.patch");
        self.patch_subscription(app_id, sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store_with;
    use portal_core::{
        Application, ApplicationsDao, Approval, ApprovalsDao, CredentialCipher, DaoOptions,
        EntityRef,
    };

    fn sub(app: &str, api: &str, client_id: Option<&str>) -> Subscription {
        Subscription {
            id: format!("{}-{}", app, api),
            application: app.into(),
            api: api.into(),
            plan: "basic".into(),
            client_id: client_id.map(String::from),
            client_secret: client_id.map(|c| format!("{}-secret", c)),
            apikey: Some("key-123".into()),
            ..Default::default()
        }
    }

    async fn setup(options: DaoOptions) -> (tempfile::TempDir, Arc<JsonStore>, JsonSubscriptions) {
        let (dir, store) = test_store_with(options);
        let apps = JsonApplications::new(store.clone());
        for id in ["app1", "app2"] {
            apps.create(
                Application {
                    id: id.into(),
                    name: id.into(),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        }
        let subs = JsonSubscriptions::new(store.clone());
        (dir, store, subs)
    }

    fn keyed() -> DaoOptions {
        DaoOptions::default().with_cipher(CredentialCipher::new("test-key").unwrap())
    }

    #[tokio::test]
    async fn test_credentials_encrypted_at_rest() {
        let (_dir, store, subs) = setup(keyed()).await;
        subs.create(sub("app1", "petstore", Some("cid1")), None).await.unwrap();

        let raw = std::fs::read_to_string(store.file("subscriptions", "app1.subs.json")).unwrap();
        assert!(!raw.contains("key-123"));
        assert!(!raw.contains("cid1-secret"));

        let loaded = subs.get_by_app_and_api("app1", "petstore").await.unwrap().unwrap();
        assert_eq!(loaded.apikey.as_deref(), Some("key-123"));
        assert_eq!(loaded.client_secret.as_deref(), Some("cid1-secret"));
    }

    #[tokio::test]
    async fn test_indexes_follow_mutations() {
        let (_dir, _store, subs) = setup(keyed()).await;
        subs.create(sub("app1", "petstore", Some("cid1")), None).await.unwrap();
        subs.create(sub("app2", "petstore", None), None).await.unwrap();

        let by_client = subs.get_by_client_id("cid1").await.unwrap().unwrap();
        assert_eq!(by_client.application, "app1");
        let by_api = subs.get_by_api("petstore", 0, 0).await.unwrap();
        assert_eq!(by_api.count.count, 2);
        assert_eq!(subs.get_count().await.unwrap(), 2);

        subs.delete("app1", "petstore", "app1-petstore").await.unwrap();
        assert!(subs.get_by_client_id("cid1").await.unwrap().is_none());
        let by_api = subs.get_by_api("petstore", 0, 0).await.unwrap();
        assert_eq!(by_api.rows.len(), 1);
        assert_eq!(by_api.rows[0].application, "app2");
    }

    #[tokio::test]
    async fn test_duplicate_subscription_conflicts() {
        let (_dir, _store, subs) = setup(DaoOptions::default()).await;
        subs.create(sub("app1", "petstore", None), None).await.unwrap();
        let err = subs.create(sub("app1", "petstore", None), None).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_existing_subscription_id_conflicts() {
        let (_dir, _store, subs) = setup(DaoOptions::default()).await;
        subs.create(sub("app1", "petstore", None), None).await.unwrap();
        let mut again = sub("app2", "weather", None);
        again.id = "app1-petstore".into();
        let err = subs.create(again, None).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert!(subs.get_by_app_id("app2").await.unwrap().is_empty());
        assert_eq!(subs.get_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dangling_client_id_is_internal() {
        let (_dir, store, subs) = setup(DaoOptions::default()).await;
        subs.create(sub("app1", "petstore", Some("cid1")), None).await.unwrap();
        std::fs::write(store.file("subscriptions", "app1.subs.json"), "[]").unwrap();
        let err = subs.get_by_client_id("cid1").await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().contains("Inconsistent state"));
    }

    #[tokio::test]
    async fn test_delete_removes_approvals() {
        let (_dir, store, subs) = setup(DaoOptions::default()).await;
        subs.create(sub("app1", "petstore", None), None).await.unwrap();
        let approvals = JsonApprovals::new(store.clone());
        approvals
            .create(Approval {
                id: "ap1".into(),
                subscription_id: "app1-petstore".into(),
                application: EntityRef { id: "app1".into(), ..Default::default() },
                api: EntityRef { id: "petstore".into(), ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap();

        subs.delete("app1", "petstore", "app1-petstore").await.unwrap();
        assert!(approvals.get_all().await.unwrap().is_empty());
        let err = subs.delete("app1", "petstore", "app1-petstore").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_patch_replaces_by_id() {
        let (_dir, _store, subs) = setup(DaoOptions::default()).await;
        let mut created = subs.create(sub("app1", "petstore", Some("cid1")), None).await.unwrap();
        created.approved = true;
        subs.patch("app1", created, None).await.unwrap();
        assert!(subs.get_by_client_id("cid1").await.unwrap().unwrap().approved);

        let err = subs.patch("app1", sub("app1", "other", None), None).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_patch_moves_client_id_entry() {
        let (_dir, store, subs) = setup(DaoOptions::default()).await;
        let mut created = subs.create(sub("app1", "petstore", Some("cid1")), None).await.unwrap();
        created.client_id = Some("cid2".into());
        subs.patch("app1", created, None).await.unwrap();

        assert!(!store.file("subscription_index", "cid1.json").exists());
        assert!(subs.get_by_client_id("cid1").await.unwrap().is_none());
        let moved = subs.get_by_client_id("cid2").await.unwrap().unwrap();
        assert_eq!(moved.id, "app1-petstore");
    }

    #[tokio::test]
    async fn test_rebuild_indexes() {
        let (_dir, store, subs) = setup(keyed()).await;
        subs.create(sub("app1", "petstore", Some("cid1")), None).await.unwrap();
        subs.create(sub("app2", "weather", Some("cid2")), None).await.unwrap();
        std::fs::remove_file(store.file("subscription_index", "cid1.json")).unwrap();
        std::fs::write(store.file("subscription_index", "stale.json"), "{}").unwrap();

        subs.rebuild_indexes().unwrap();
        assert!(store.file("subscription_index", "cid1.json").exists());
        assert!(!store.file("subscription_index", "stale.json").exists());
        assert_eq!(subs.get_by_api("weather", 0, 0).await.unwrap().count.count, 1);
    }

    #[tokio::test]
    async fn test_get_all_not_implemented() {
        let (_dir, _store, subs) = setup(DaoOptions::default()).await;
        let err = subs.get_all(&ListQuery::new()).await.unwrap_err();
        assert_eq!(err.status_code(), 501);
    }
}
