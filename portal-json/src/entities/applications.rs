//! Applications: one file per application plus `applications/_index.json`.
//!
//! Owners are mirrored on both sides: the application lists its owners and
//! every owning user lists the application. Mutations that touch both sides
//! hold the locks of all files involved.

use super::approvals::JsonApprovals;
use super::subscriptions::JsonSubscriptions;
use super::users::JsonUsers;
use crate::locks::LockKey;
use crate::store::{read_json, read_json_or_default, remove_if_exists, write_json, JsonStore};
use ::async_trait::async_trait;
use portal_core::{
    filter_and_page, migrate_application_data, normalize_new_application, page_slice,
    stamp_change, Application, ApplicationsDao, DaoError, DaoResult, IdRef, ListQuery, Owner,
    OwnerRole, Page,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

const APPS_DIR: &str = "applications";
const INDEX_FILE: &str = "_index.json";

/// First owner with role `owner`, else the first owner at all.
pub(crate) fn find_owner(app: &Application) -> Option<&Owner> {
    if let Some(owner) = app.owners.iter().find(|o| o.role == OwnerRole::Owner) {
        return Some(owner);
    }
    let first = app.owners.first();
    if first.is_some() {
        warn!(app_id = %app.id, "application has no owner with role 'owner'");
    }
    first
}

/// Fail with `Locked` when the owner list changed while its locks were taken.
fn ensure_same_owners(app_id: &str, locked: &[Owner], current: &[Owner]) -> DaoResult<()> {
    let ids = |owners: &[Owner]| {
        owners
            .iter()
            .map(|o| o.user_id.clone())
            .collect::<std::collections::BTreeSet<_>>()
    };
    if ids(locked) == ids(current) {
        return Ok(());
    }
    warn!(app_id, "owners changed while locking application");
    Err(DaoError::locked(format!(
        "Owners of application {} changed concurrently, try again.",
        app_id
    )))
}

/// Document-store applications.
#[derive(Debug, Clone)]
pub struct JsonApplications {
    store: Arc<JsonStore>,
    users: JsonUsers,
    subscriptions: JsonSubscriptions,
    approvals: JsonApprovals,
}

impl JsonApplications {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self {
            users: JsonUsers::new(store.clone()),
            subscriptions: JsonSubscriptions::new(store.clone()),
            approvals: JsonApprovals::new(store.clone()),
            store,
        }
    }

    fn app_file(&self, app_id: &str) -> DaoResult<PathBuf> {
        self.store.entity_file(APPS_DIR, app_id, ".json")
    }

    fn index_file(&self) -> PathBuf {
        self.store.file(APPS_DIR, INDEX_FILE)
    }

    pub(crate) fn load_application(&self, app_id: &str) -> DaoResult<Option<Application>> {
        debug!(app_id, "load_application");
        let Some(mut app) = read_json::<Application>(&self.app_file(app_id)?)? else {
            return Ok(None);
        };
        migrate_application_data(&mut app);
        Ok(Some(app))
    }

    fn save_application(&self, app: &mut Application, saving_user_id: Option<&str>) -> DaoResult<()> {
        debug!(app_id = %app.id, "save_application");
        stamp_change(&mut app.extra, saving_user_id);
        migrate_application_data(app);
        write_json(&self.app_file(&app.id)?, app)
    }

    pub(crate) fn load_index(&self) -> DaoResult<Vec<IdRef>> {
        read_json_or_default(&self.index_file())
    }

    fn save_index(&self, index: &[IdRef]) -> DaoResult<()> {
        write_json(&self.index_file(), index)
    }

    fn create_application(
        &self,
        mut app: Application,
        creating_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        normalize_new_application(&mut app);
        let app_id = app.id.clone();
        if app_id.is_empty() {
            return Err(DaoError::config("application id must not be empty"));
        }

        // The creating user's application list changes along with the index.
        let mut keys = vec![LockKey::AppsIndex];
        keys.extend(creating_user_id.map(|u| LockKey::User(u.to_string())));
        let _locks = self.store.lock_all(keys)?;
        let mut index = self.load_index()?;
        if index.iter().any(|a| a.id == app_id) {
            return Err(DaoError::conflict(format!(
                "Application ID \"{}\" already exists.",
                app_id
            )));
        }

        let mut user = match creating_user_id {
            Some(user_id) => Some(self.users.load_user(user_id)?.ok_or_else(|| {
                DaoError::internal(format!("Could not load user with id {}", user_id))
            })?),
            None => None,
        };

        app.owners = user
            .iter()
            .map(|u| Owner {
                user_id: u.id.clone(),
                role: OwnerRole::Owner,
                email: Some(u.email.clone()),
            })
            .collect();
        app.owner_user_id = None;
        app.owner_email = None;

        if let Some(user) = user.as_mut() {
            user.applications.push(IdRef { id: app_id.clone() });
        }
        index.push(IdRef { id: app_id.clone() });

        // Application and its empty subscription list first, then the index,
        // then the owning user.
        self.save_application(&mut app, creating_user_id)?;
        self.subscriptions.save_subscriptions(&app_id, &[])?;
        self.save_index(&index)?;
        if let Some(mut user) = user {
            let user_id = user.id.clone();
            self.users.save_user(&mut user, Some(&user_id))?;
        }
        Ok(app)
    }

    fn delete_application(&self, app_id: &str) -> DaoResult<Application> {
        let app = self
            .load_application(app_id)?
            .ok_or_else(|| DaoError::not_found(format!("Application {} not found.", app_id)))?;

        let locked_owners = app.owners.clone();
        let mut keys = vec![
            LockKey::AppsIndex,
            LockKey::Application(app_id.to_string()),
            LockKey::Subscriptions(app_id.to_string()),
            LockKey::Approvals,
        ];
        keys.extend(app.owners.iter().map(|o| LockKey::User(o.user_id.clone())));
        let _locks = self.store.lock_all(keys)?;

        // An owner added before the locks were taken would be left unlocked.
        let app = self
            .load_application(app_id)?
            .ok_or_else(|| DaoError::not_found(format!("Application {} not found.", app_id)))?;
        ensure_same_owners(app_id, &locked_owners, &app.owners)?;

        let mut index = self.load_index()?;
        let pos = index.iter().position(|a| a.id == app_id).ok_or_else(|| {
            DaoError::internal(format!("Application {} not found in index", app_id))
        })?;
        index.remove(pos);

        for owner in &app.owners {
            let mut user = self.users.load_user(&owner.user_id)?.ok_or_else(|| {
                DaoError::internal(format!("Could not load owner {} of {}", owner.user_id, app_id))
            })?;
            user.applications.retain(|a| a.id != app_id);
            self.users.save_user(&mut user, None).map_err(|e| {
                error!(app_id, user_id = %owner.user_id, error = %e, "failed to detach owner");
                e
            })?;
        }

        self.save_index(&index)?;
        remove_if_exists(&self.app_file(app_id)?)?;

        let subs = self.subscriptions.load_subscriptions(app_id)?;
        for sub in &subs {
            if let Some(client_id) = sub.client_id.as_deref() {
                self.subscriptions.remove_client_id_entry(client_id)?;
            }
            self.subscriptions.remove_api_index_entry(app_id, &sub.api)?;
        }
        remove_if_exists(&self.subscriptions.subscriptions_file(app_id)?)?;

        self.approvals.delete_by_app_unlocked(app_id)?;
        Ok(app)
    }

    fn add_owner_sync(
        &self,
        app_id: &str,
        user_id: &str,
        role: OwnerRole,
        adding_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        let _locks = self.store.lock_all(vec![
            LockKey::Application(app_id.to_string()),
            LockKey::User(user_id.to_string()),
        ])?;
        let mut app = self
            .load_application(app_id)?
            .ok_or_else(|| DaoError::not_found(format!("Application {} not found.", app_id)))?;
        let mut user = self.users.load_user(user_id)?.ok_or_else(|| {
            DaoError::internal(format!("Could not load user with id {}", user_id))
        })?;

        if !user.applications.iter().any(|a| a.id == app_id) {
            user.applications.push(IdRef { id: app_id.to_string() });
        }
        app.owners.retain(|o| o.user_id != user_id);
        app.owners.push(Owner {
            user_id: user_id.to_string(),
            role,
            email: Some(user.email.clone()),
        });

        self.save_application(&mut app, adding_user_id)?;
        self.users.save_user(&mut user, adding_user_id)?;
        Ok(app)
    }

    fn delete_owner_sync(
        &self,
        app_id: &str,
        user_id: &str,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        let _locks = self.store.lock_all(vec![
            LockKey::Application(app_id.to_string()),
            LockKey::User(user_id.to_string()),
        ])?;
        let mut app = self
            .load_application(app_id)?
            .ok_or_else(|| DaoError::not_found(format!("Application {} not found.", app_id)))?;
        let mut user = self.users.load_user(user_id)?.ok_or_else(|| {
            DaoError::internal(format!("Could not load user with id {}", user_id))
        })?;

        user.applications.retain(|a| a.id != app_id);
        app.owners.retain(|o| o.user_id != user_id);

        self.users.save_user(&mut user, deleting_user_id)?;
        self.save_application(&mut app, deleting_user_id)?;
        Ok(app)
    }
}

#[async_trait]
impl ApplicationsDao for JsonApplications {
    async fn get_by_id(&self, app_id: &str) -> DaoResult<Option<Application>> {
        self.load_application(app_id)
    }

    async fn create(
        &self,
        app: Application,
        creating_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        debug!(app_id = %app.id, "applications.create");
        self.create_application(app, creating_user_id)
    }

    async fn save(
        &self,
        mut app: Application,
        saving_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        debug!(app_id = %app.id, "applications.save");
        let _lock = if self.app_file(&app.id)?.exists() {
            Some(self.store.lock(LockKey::Application(app.id.clone()))?)
        } else {
            None
        };
        self.save_application(&mut app, saving_user_id)?;
        Ok(app)
    }

    async fn delete(
        &self,
        app_id: &str,
        _deleting_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        debug!(app_id, "applications.delete");
        self.delete_application(app_id)
    }

    async fn get_all(&self, query: &ListQuery) -> DaoResult<Page<Application>> {
        debug!("applications.get_all");
        let mut rows = Vec::new();
        for entry in self.load_index()? {
            let Some(mut app) = self.load_application(&entry.id)? else {
                warn!(app_id = %entry.id, "could not load indexed application");
                continue;
            };
            if let Some(owner) = find_owner(&app).cloned() {
                app.owner_user_id = Some(owner.user_id);
                app.owner_email = owner.email;
            }
            app.owners.clear();
            rows.push(app);
        }
        filter_and_page(rows, query, Some("id ASC"))
    }

    async fn get_index(&self, offset: usize, limit: usize) -> DaoResult<Page<IdRef>> {
        let index = self.load_index()?;
        let count = index.len() as i64;
        Ok(Page::new(page_slice(index, offset, limit), count, false))
    }

    async fn get_count(&self) -> DaoResult<i64> {
        Ok(self.load_index()?.len() as i64)
    }

    async fn get_owners(&self, app_id: &str) -> DaoResult<Vec<Owner>> {
        match self.load_application(app_id)? {
            Some(app) => Ok(app.owners),
            None => Err(DaoError::not_found("Unknown application, cannot return owners.")),
        }
    }

    async fn add_owner(
        &self,
        app_id: &str,
        user_id: &str,
        role: OwnerRole,
        adding_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        debug!(app_id, user_id, %role, "applications.add_owner");
        self.add_owner_sync(app_id, user_id, role, adding_user_id)
    }

    async fn delete_owner(
        &self,
        app_id: &str,
        user_id: &str,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        debug!(app_id, user_id, "applications.delete_owner");
        self.delete_owner_sync(app_id, user_id, deleting_user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store;
    use portal_core::{ClientType, User, UsersDao};

    async fn with_user(store: &Arc<JsonStore>, id: &str) {
        JsonUsers::new(store.clone())
            .create(User {
                id: id.into(),
                email: format!("{}@example.com", id),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    fn app(id: &str) -> Application {
        Application {
            id: id.into(),
            name: "Some App".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_links_owner_both_ways() {
        let (_dir, store) = test_store();
        with_user(&store, "u1").await;
        let apps = JsonApplications::new(store.clone());

        let created = apps.create(app("  app1 "), Some("u1")).await.unwrap();
        assert_eq!(created.id, "app1");
        assert_eq!(created.owners.len(), 1);
        assert_eq!(created.owners[0].role, OwnerRole::Owner);
        assert_eq!(created.client_type, Some(ClientType::PublicSpa));

        let user = JsonUsers::new(store.clone()).load_user("u1").unwrap().unwrap();
        assert_eq!(user.applications, vec![IdRef { id: "app1".into() }]);
        assert!(store.file("subscriptions", "app1.subs.json").exists());
        assert_eq!(apps.get_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_rules() {
        let (_dir, store) = test_store();
        let apps = JsonApplications::new(store);
        apps.create(app("app1"), None).await.unwrap();
        let err = apps.create(app("app1"), None).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        let err = apps.create(app("app2"), Some("ghost")).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_create_truncates_name() {
        let (_dir, store) = test_store();
        let apps = JsonApplications::new(store);
        let mut long = app("app1");
        long.name = "x".repeat(300);
        let created = apps.create(long, None).await.unwrap();
        assert_eq!(created.name.len(), 128);
    }

    #[tokio::test]
    async fn test_owners_add_and_delete() {
        let (_dir, store) = test_store();
        with_user(&store, "u1").await;
        with_user(&store, "u2").await;
        let apps = JsonApplications::new(store.clone());
        apps.create(app("app1"), Some("u1")).await.unwrap();

        let updated = apps
            .add_owner("app1", "u2", OwnerRole::Collaborator, Some("u1"))
            .await
            .unwrap();
        assert_eq!(updated.owners.len(), 2);
        let owners = apps.get_owners("app1").await.unwrap();
        assert_eq!(owners[1].email.as_deref(), Some("u2@example.com"));

        apps.delete_owner("app1", "u2", Some("u1")).await.unwrap();
        let user = JsonUsers::new(store).load_user("u2").unwrap().unwrap();
        assert!(user.applications.is_empty());
        assert_eq!(apps.get_owners("app1").await.unwrap().len(), 1);
        assert_eq!(apps.get_owners("nope").await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn test_get_all_projects_owner() {
        let (_dir, store) = test_store();
        with_user(&store, "u1").await;
        let apps = JsonApplications::new(store);
        apps.create(app("b-app"), Some("u1")).await.unwrap();
        apps.create(app("a-app"), None).await.unwrap();

        let page = apps.get_all(&ListQuery::new()).await.unwrap();
        assert_eq!(page.count.count, 2);
        assert_eq!(page.rows[0].id, "a-app");
        assert!(page.rows[0].owner_user_id.is_none());
        assert_eq!(page.rows[1].owner_user_id.as_deref(), Some("u1"));
        assert_eq!(page.rows[1].owner_email.as_deref(), Some("u1@example.com"));
        assert!(page.rows[1].owners.is_empty());
    }

    #[tokio::test]
    async fn test_delete_detaches_owners() {
        let (_dir, store) = test_store();
        with_user(&store, "u1").await;
        let apps = JsonApplications::new(store.clone());
        apps.create(app("app1"), Some("u1")).await.unwrap();

        let deleted = apps.delete("app1", Some("u1")).await.unwrap();
        assert_eq!(deleted.id, "app1");
        assert!(apps.get_by_id("app1").await.unwrap().is_none());
        assert_eq!(apps.get_count().await.unwrap(), 0);
        assert!(!store.file("subscriptions", "app1.subs.json").exists());
        let user = JsonUsers::new(store).load_user("u1").unwrap().unwrap();
        assert!(user.applications.is_empty());
        assert_eq!(apps.delete("app1", None).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn test_create_with_busy_creating_user_changes_nothing() {
        let (_dir, store) = test_store();
        with_user(&store, "u1").await;
        let apps = JsonApplications::new(store.clone());

        let held = store.lock(LockKey::User("u1".into())).unwrap();
        let err = apps.create(app("app1"), Some("u1")).await.unwrap_err();
        assert_eq!(err.status_code(), 423);
        drop(held);

        assert_eq!(apps.get_count().await.unwrap(), 0);
        assert!(!store.file("applications", "app1.json").exists());
        let user = JsonUsers::new(store).load_user("u1").unwrap().unwrap();
        assert!(user.applications.is_empty());
    }

    #[test]
    fn test_ensure_same_owners() {
        let owner = |id: &str| Owner {
            user_id: id.into(),
            role: OwnerRole::Owner,
            email: None,
        };
        assert!(ensure_same_owners("app1", &[owner("u1")], &[owner("u1")]).is_ok());
        let err = ensure_same_owners("app1", &[owner("u1")], &[owner("u1"), owner("u2")])
            .unwrap_err();
        assert_eq!(err.status_code(), 423);
    }

    #[tokio::test]
    async fn test_delete_fails_when_owner_cannot_be_detached() {
        let (_dir, store) = test_store();
        with_user(&store, "u1").await;
        let apps = JsonApplications::new(store.clone());
        apps.create(app("app1"), Some("u1")).await.unwrap();

        std::fs::write(store.file("users", "u1.json"), "not json").unwrap();
        let err = apps.delete("app1", None).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(apps.get_count().await.unwrap(), 1);
        assert!(apps.get_by_id("app1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_all_projects_owner_email_of_collaborator_only_app() {
        let (_dir, store) = test_store();
        with_user(&store, "u1").await;
        with_user(&store, "u2").await;
        let apps = JsonApplications::new(store.clone());
        apps.create(app("app1"), None).await.unwrap();
        apps.add_owner("app1", "u2", OwnerRole::Reader, None)
            .await
            .unwrap();

        let page = apps.get_all(&ListQuery::new()).await.unwrap();
        assert_eq!(page.rows[0].owner_user_id.as_deref(), Some("u2"));
        assert_eq!(page.rows[0].owner_email.as_deref(), Some("u2@example.com"));
    }

    #[tokio::test]
    async fn test_delete_with_busy_owner_changes_nothing() {
        let (_dir, store) = test_store();
        with_user(&store, "u1").await;
        let apps = JsonApplications::new(store.clone());
        apps.create(app("app1"), Some("u1")).await.unwrap();

        let held = store.lock(LockKey::User("u1".into())).unwrap();
        let err = apps.delete("app1", None).await.unwrap_err();
        assert_eq!(err.status_code(), 423);
        drop(held);
        assert!(apps.get_by_id("app1").await.unwrap().is_some());
        assert_eq!(apps.get_count().await.unwrap(), 1);
    }
}
