//! Users: one file per user plus `users/_index.json` of short infos.

use crate::locks::LockKey;
use crate::store::{read_json, read_json_or_default, remove_if_exists, write_json, JsonStore};
use ::async_trait::async_trait;
use portal_core::{
    create_random_id, page_slice, stamp_change, DaoError, DaoResult, Page, ShortUserInfo, User,
    UsersDao,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error};

const USERS_DIR: &str = "users";
const INDEX_FILE: &str = "_index.json";

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Document-store users.
#[derive(Debug, Clone)]
pub struct JsonUsers {
    store: Arc<JsonStore>,
}

impl JsonUsers {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self { store }
    }

    fn user_file(&self, user_id: &str) -> DaoResult<PathBuf> {
        self.store.entity_file(USERS_DIR, user_id, ".json")
    }

    fn index_file(&self) -> PathBuf {
        self.store.file(USERS_DIR, INDEX_FILE)
    }

    pub(crate) fn load_user(&self, user_id: &str) -> DaoResult<Option<User>> {
        debug!(user_id, "load_user");
        if user_id.is_empty() {
            return Ok(None);
        }
        read_json(&self.user_file(user_id)?)
    }

    pub(crate) fn load_index(&self) -> DaoResult<Vec<ShortUserInfo>> {
        read_json_or_default(&self.index_file())
    }

    fn save_index(&self, index: &[ShortUserInfo]) -> DaoResult<()> {
        write_json(&self.index_file(), index)
    }

    fn load_user_by_email(&self, email: &str) -> DaoResult<Option<User>> {
        let email = normalize_email(email);
        let index = self.load_index()?;
        let Some(short) = index.iter().find(|u| u.email == email) else {
            return Ok(None);
        };
        match self.load_user(&short.id)? {
            Some(user) => Ok(Some(user)),
            None => Err(DaoError::internal(format!(
                "User found in index, but could not be loaded: {}, id: {}",
                email, short.id
            ))),
        }
    }

    /// Write the user record; the index entry follows an email change.
    ///
    /// Callers hold whatever locks the surrounding operation needs.
    pub(crate) fn save_user(&self, user: &mut User, saving_user_id: Option<&str>) -> DaoResult<()> {
        debug!(user_id = %user.id, "save_user");
        let email_changed = match self.load_user(&user.id)? {
            Some(prev) => prev.email != user.email,
            None => false,
        };

        stamp_change(&mut user.extra, saving_user_id);
        write_json(&self.user_file(&user.id)?, user)?;

        if email_changed {
            debug!(user_id = %user.id, "email changed, updating user index");
            let mut index = self.load_index()?;
            if let Some(entry) = index.iter_mut().find(|u| u.id == user.id) {
                entry.email = normalize_email(&user.email);
            }
            self.save_index(&index)?;
        }
        Ok(())
    }

    fn create_user(&self, mut user: User) -> DaoResult<User> {
        let _lock = self.store.lock(LockKey::UserIndex)?;
        let mut index = self.load_index()?;

        if !user.id.is_empty()
            && (index.iter().any(|u| u.id == user.id) || self.user_file(&user.id)?.exists())
        {
            return Err(DaoError::conflict(format!(
                "A user with the ID {} already exists.",
                user.id
            )));
        }

        let email = normalize_email(&user.email);
        for entry in &index {
            if !email.is_empty() && entry.email == email {
                return Err(DaoError::conflict(
                    "A user with the given email address already exists.",
                ));
            }
            if let (Some(wanted), Some(existing)) = (&user.custom_id, &entry.custom_id) {
                if wanted == existing {
                    return Err(DaoError::conflict(
                        "A user with the given custom ID already exists.",
                    ));
                }
            }
        }

        if user.id.is_empty() {
            user.id = create_random_id();
        }
        user.applications = Vec::new();
        index.push(ShortUserInfo {
            id: user.id.clone(),
            email,
            custom_id: user.custom_id.clone(),
        });

        // Record first, then index.
        let user_id = user.id.clone();
        self.save_user(&mut user, Some(&user_id))?;
        self.save_index(&index)?;

        let mut fresh = self
            .load_user(&user_id)?
            .ok_or_else(|| DaoError::internal(format!("User {} vanished after create", user_id)))?;
        fresh.password = None;
        Ok(fresh)
    }

    fn delete_user(&self, user_id: &str) -> DaoResult<()> {
        let _lock = self.store.lock(LockKey::UserIndex)?;
        let mut index = self.load_index()?;
        let pos = index
            .iter()
            .position(|u| u.id == user_id)
            .ok_or_else(|| DaoError::not_found("Not found."))?;

        match self.load_user(user_id)? {
            Some(user) if !user.applications.is_empty() => {
                return Err(DaoError::conflict(
                    "User has applications; remove user from applications first.",
                ));
            }
            Some(_) => {}
            None => error!(user_id, "user exists in index but has no record"),
        }

        index.remove(pos);
        // Index before record, so a crash never leaves an index entry
        // pointing nowhere.
        self.save_index(&index)?;
        remove_if_exists(&self.user_file(user_id)?)?;
        Ok(())
    }
}

#[async_trait]
impl UsersDao for JsonUsers {
    async fn get_by_id(&self, user_id: &str) -> DaoResult<Option<User>> {
        debug!(user_id, "users.get_by_id");
        self.load_user(user_id)
    }

    async fn get_by_email(&self, email: &str) -> DaoResult<Option<User>> {
        debug!("users.get_by_email");
        self.load_user_by_email(email)
    }

    async fn get_short_info_by_email(&self, email: &str) -> DaoResult<Option<ShortUserInfo>> {
        let email = normalize_email(email);
        Ok(self.load_index()?.into_iter().find(|u| u.email == email))
    }

    async fn get_short_info_by_custom_id(
        &self,
        custom_id: &str,
    ) -> DaoResult<Option<ShortUserInfo>> {
        Ok(self
            .load_index()?
            .into_iter()
            .find(|u| u.custom_id.as_deref() == Some(custom_id)))
    }

    async fn create(&self, user: User) -> DaoResult<User> {
        debug!("users.create");
        self.create_user(user)
    }

    async fn save(&self, mut user: User, saving_user_id: Option<&str>) -> DaoResult<User> {
        debug!(user_id = %user.id, "users.save");
        let _lock = if self.user_file(&user.id)?.exists() {
            Some(self.store.lock(LockKey::User(user.id.clone()))?)
        } else {
            None
        };
        self.save_user(&mut user, saving_user_id)?;
        user.password = None;
        Ok(user)
    }

    async fn delete(&self, user_id: &str, _deleting_user_id: Option<&str>) -> DaoResult<()> {
        debug!(user_id, "users.delete");
        self.delete_user(user_id)
    }

    async fn get_index(&self, offset: usize, limit: usize) -> DaoResult<Page<ShortUserInfo>> {
        let index = self.load_index()?;
        let count = index.len() as i64;
        Ok(Page::new(page_slice(index, offset, limit), count, false))
    }

    async fn get_count(&self) -> DaoResult<i64> {
        Ok(self.load_index()?.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store;
    use portal_core::IdRef;

    fn user(id: &str, email: &str) -> User {
        User {
            id: id.to_string(),
            email: email.to_string(),
            password: Some("secret".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_strips_password_and_indexes() {
        let (_dir, store) = test_store();
        let users = JsonUsers::new(store);
        let created = users.create(user("u1", "Ada@Example.com")).await.unwrap();
        assert!(created.password.is_none());
        assert!(created.applications.is_empty());
        assert_eq!(created.extra["changedBy"], "u1");

        let short = users.get_short_info_by_email("ada@example.com ").await.unwrap();
        assert_eq!(short.unwrap().id, "u1");
        assert_eq!(users.get_count().await.unwrap(), 1);
        let found = users.get_by_email("ADA@example.com").await.unwrap();
        assert_eq!(found.unwrap().id, "u1");
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let (_dir, store) = test_store();
        let users = JsonUsers::new(store);
        let mut first = user("u1", "a@b.c");
        first.custom_id = Some("google:1".into());
        users.create(first).await.unwrap();

        let err = users.create(user("u2", "A@B.C")).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert!(err.to_string().contains("email address"));

        let mut second = user("u3", "x@y.z");
        second.custom_id = Some("google:1".into());
        let err = users.create(second).await.unwrap_err();
        assert!(err.to_string().contains("custom ID"));
    }

    #[tokio::test]
    async fn test_create_rejects_existing_id() {
        let (_dir, store) = test_store();
        let users = JsonUsers::new(store);
        users.create(user("u1", "a@b.test")).await.unwrap();

        let err = users.create(user("u1", "x@y.test")).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert_eq!(users.get_count().await.unwrap(), 1);
        let stored = users.get_by_id("u1").await.unwrap().unwrap();
        assert_eq!(stored.email, "a@b.test");
    }

    #[tokio::test]
    async fn test_save_updates_index_on_email_change() {
        let (_dir, store) = test_store();
        let users = JsonUsers::new(store);
        let mut u = users.create(user("u1", "old@b.c")).await.unwrap();
        u.email = "new@b.c".into();
        users.save(u, Some("admin")).await.unwrap();
        assert!(users.get_short_info_by_email("old@b.c").await.unwrap().is_none());
        assert!(users.get_short_info_by_email("new@b.c").await.unwrap().is_some());
        let stored = users.get_by_id("u1").await.unwrap().unwrap();
        assert_eq!(stored.extra["changedBy"], "admin");
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let (_dir, store) = test_store();
        let users = JsonUsers::new(store);
        assert_eq!(users.delete("nobody", None).await.unwrap_err().status_code(), 404);

        let mut u = users.create(user("u1", "a@b.c")).await.unwrap();
        u.applications.push(IdRef { id: "app".into() });
        users.save(u, None).await.unwrap();
        assert_eq!(users.delete("u1", None).await.unwrap_err().status_code(), 409);

        let mut u = users.get_by_id("u1").await.unwrap().unwrap();
        u.applications.clear();
        users.save(u, None).await.unwrap();
        users.delete("u1", None).await.unwrap();
        assert!(users.get_by_id("u1").await.unwrap().is_none());
        assert_eq!(users.get_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_locked_index_fails_fast() {
        let (_dir, store) = test_store();
        let users = JsonUsers::new(store.clone());
        let _held = store.lock(LockKey::UserIndex).unwrap();
        let err = users.create(user("u1", "a@b.c")).await.unwrap_err();
        assert_eq!(err.status_code(), 423);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_index_paging() {
        let (_dir, store) = test_store();
        let users = JsonUsers::new(store);
        for i in 0..5 {
            users.create(user(&format!("u{}", i), &format!("{}@b.c", i))).await.unwrap();
        }
        let page = users.get_index(3, 0).await.unwrap();
        assert_eq!(page.count.count, 5);
        assert_eq!(page.rows.len(), 2);
    }
}
