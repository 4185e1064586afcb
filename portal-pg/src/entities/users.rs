//! Users in `wicked.users`; application back-references come from `owners`.

use crate::engine::{decode, encode, PgEngine, QueryOptions};
use crate::model::Entity;
use crate::sql::Criteria;
use ::async_trait::async_trait;
use portal_core::{
    create_random_id, DaoError, DaoResult, IdRef, JsonMap, Page, ShortUserInfo, User, UsersDao,
};
use serde_json::Value as JsonValue;
use tracing::debug;

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Relational users.
#[derive(Debug, Clone)]
pub struct PgUsers {
    engine: PgEngine,
}

impl PgUsers {
    pub fn new(engine: PgEngine) -> Self {
        Self { engine }
    }

    /// User record with `applications` attached from the owner rows.
    pub(crate) async fn load_user(&self, user_id: &str) -> DaoResult<Option<User>> {
        let Some(row) = self.engine.get_by_id(Entity::Users, user_id, None).await? else {
            return Ok(None);
        };
        let mut user: User = decode(row)?;
        let owners = self
            .engine
            .get_by(Entity::Owners, &Criteria::by("userId", user_id), &QueryOptions::new())
            .await?;
        user.applications = owners
            .rows
            .iter()
            .filter_map(|o| o.get("appId").and_then(JsonValue::as_str))
            .map(|id| IdRef { id: id.to_string() })
            .collect();
        Ok(Some(user))
    }

    async fn short_info_by(&self, field: &str, value: &str) -> DaoResult<Option<ShortUserInfo>> {
        debug!(field, "short_info_by");
        let row = self
            .engine
            .get_single_by(Entity::Users, &Criteria::by(field, value), None)
            .await?;
        Ok(row.map(decode::<User>).transpose()?.map(|u| u.short_info()))
    }

    /// Serialized user without the derived `applications` list.
    fn user_row(user: &User) -> DaoResult<JsonMap> {
        let mut row = encode(user)?;
        row.remove("applications");
        Ok(row)
    }

    async fn upsert_user(&self, mut user: User, saving_user_id: Option<&str>) -> DaoResult<User> {
        user.email = normalize_email(&user.email);
        self.engine
            .upsert(Entity::Users, Self::user_row(&user)?, saving_user_id, None)
            .await?;
        self.load_user(&user.id)
            .await?
            .ok_or_else(|| DaoError::internal(format!("User {} vanished after save", user.id)))
    }
}

#[async_trait]
impl UsersDao for PgUsers {
    async fn get_by_id(&self, user_id: &str) -> DaoResult<Option<User>> {
        debug!(user_id, "users.get_by_id");
        self.load_user(user_id).await
    }

    async fn get_by_email(&self, email: &str) -> DaoResult<Option<User>> {
        debug!("users.get_by_email");
        match self.get_short_info_by_email(email).await? {
            Some(short) => self.load_user(&short.id).await,
            None => Ok(None),
        }
    }

    async fn get_short_info_by_email(&self, email: &str) -> DaoResult<Option<ShortUserInfo>> {
        self.short_info_by("email", &normalize_email(email)).await
    }

    async fn get_short_info_by_custom_id(
        &self,
        custom_id: &str,
    ) -> DaoResult<Option<ShortUserInfo>> {
        self.short_info_by("custom_id", custom_id).await
    }

    async fn create(&self, mut user: User) -> DaoResult<User> {
        debug!("users.create");
        if user.id.is_empty() {
            user.id = create_random_id();
        } else if self.engine.get_by_id(Entity::Users, &user.id, None).await?.is_some() {
            return Err(DaoError::conflict(format!(
                "A user with the ID {} already exists.",
                user.id
            )));
        }
        if self
            .get_short_info_by_email(&user.email)
            .await?
            .is_some()
        {
            return Err(DaoError::conflict(
                "A user with the given email address already exists.",
            ));
        }
        if let Some(custom_id) = user.custom_id.as_deref() {
            if self.get_short_info_by_custom_id(custom_id).await?.is_some() {
                return Err(DaoError::conflict(
                    "A user with the given custom ID already exists.",
                ));
            }
        }
        let user_id = user.id.clone();
        let mut created = self.upsert_user(user, Some(&user_id)).await?;
        created.password = None;
        Ok(created)
    }

    async fn save(&self, user: User, saving_user_id: Option<&str>) -> DaoResult<User> {
        debug!(user_id = %user.id, "users.save");
        self.upsert_user(user, saving_user_id).await
    }

    async fn delete(&self, user_id: &str, deleting_user_id: Option<&str>) -> DaoResult<()> {
        debug!(user_id, ?deleting_user_id, "users.delete");
        let user = self
            .load_user(user_id)
            .await?
            .ok_or_else(|| DaoError::not_found("Not found."))?;
        if !user.applications.is_empty() {
            return Err(DaoError::conflict(
                "User has applications; remove user from applications first.",
            ));
        }
        self.engine.delete_by_id(Entity::Users, user_id, None).await?;
        Ok(())
    }

    async fn get_index(&self, offset: usize, limit: usize) -> DaoResult<Page<ShortUserInfo>> {
        debug!(offset, limit, "users.get_index");
        let page = self
            .engine
            .get_page::<User>(
                Entity::Users,
                &Criteria::new(),
                &QueryOptions::paged(offset, limit).ordered("id ASC"),
            )
            .await?;
        Ok(page.map(|user| user.short_info()))
    }

    async fn get_count(&self) -> DaoResult<i64> {
        self.engine.count(Entity::Users, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_row_drops_applications() {
        let user = User {
            id: "u1".into(),
            email: "a@b.c".into(),
            applications: vec![IdRef { id: "app".into() }],
            ..Default::default()
        };
        let row = PgUsers::user_row(&user).unwrap();
        assert!(!row.contains_key("applications"));
        assert_eq!(row["email"], json!("a@b.c"));
    }

    #[test]
    fn test_emails_are_lowercased() {
        assert_eq!(normalize_email("  Dev@Example.COM "), "dev@example.com");
    }
}
