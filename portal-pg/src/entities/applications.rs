//! Applications and their owner rows.
//!
//! Owners live in `wicked.owners`, one row per user and application. The
//! database cascades owner, subscription and approval rows when an
//! application is deleted.

use super::id_page;
use super::users::PgUsers;
use crate::engine::{decode, encode, Executor, PgEngine, QueryOptions};
use crate::model::Entity;
use crate::sql::{Criteria, Join, JoinedField};
use ::async_trait::async_trait;
use portal_core::{
    create_random_id, migrate_application_data, normalize_new_application, Application,
    ApplicationsDao, DaoError, DaoResult, IdRef, JsonMap, ListQuery, Owner, OwnerRole, Page, User,
};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

/// Projects the first `owner` of each application onto listing rows.
const OWNER_JOIN: Join = Join {
    clause: Some(
        "LEFT JOIN wicked.owners b ON a.id = b.applications_id AND b.id = \
         (SELECT id FROM wicked.owners c WHERE c.applications_id = a.id AND c.data->>'role' = 'owner' LIMIT 1)",
    ),
    fields: &[
        JoinedField::new("b.users_id", "owner_user_id", "ownerUserId"),
        JoinedField::new("b.data->>'email'", "owner_email", "ownerEmail"),
    ],
};

fn owner_row(app_id: &str, user: &User, role: OwnerRole) -> JsonMap {
    let mut row = JsonMap::new();
    row.insert("id".into(), json!(create_random_id()));
    row.insert("appId".into(), json!(app_id));
    row.insert("userId".into(), json!(user.id));
    row.insert("role".into(), json!(role));
    row.insert("email".into(), json!(user.email));
    row
}

fn owner_from_row(row: &JsonMap) -> DaoResult<Owner> {
    Ok(Owner {
        user_id: row
            .get("userId")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
        role: serde_json::from_value(row.get("role").cloned().unwrap_or(JsonValue::Null))?,
        email: row.get("email").and_then(JsonValue::as_str).map(str::to_string),
    })
}

/// Serialized application without the derived owner list.
fn application_row(app: &Application) -> DaoResult<JsonMap> {
    let mut row = encode(app)?;
    for derived in ["owners", "ownerUserId", "ownerEmail"] {
        row.remove(derived);
    }
    Ok(row)
}

/// Relational applications.
#[derive(Debug, Clone)]
pub struct PgApplications {
    engine: PgEngine,
    users: PgUsers,
}

impl PgApplications {
    pub fn new(engine: PgEngine, users: PgUsers) -> Self {
        Self { engine, users }
    }

    async fn owners_of(&self, app_id: &str, client: Option<&dyn Executor>) -> DaoResult<Vec<Owner>> {
        let rows = self
            .engine
            .get_by(
                Entity::Owners,
                &Criteria::by("applications_id", app_id),
                &QueryOptions::new().with_client(client),
            )
            .await?;
        rows.rows.iter().map(owner_from_row).collect()
    }

    async fn load_application(
        &self,
        app_id: &str,
        client: Option<&dyn Executor>,
    ) -> DaoResult<Option<Application>> {
        debug!(app_id, "load_application");
        let Some(row) = self.engine.get_by_id(Entity::Applications, app_id, client).await? else {
            return Ok(None);
        };
        let mut app: Application = decode(row)?;
        migrate_application_data(&mut app);
        app.owners = self.owners_of(app_id, client).await?;
        Ok(Some(app))
    }

    async fn require_application(&self, app_id: &str) -> DaoResult<Application> {
        self.load_application(app_id, None)
            .await?
            .ok_or_else(|| DaoError::not_found(format!("Application {} not found.", app_id)))
    }
}

#[async_trait]
impl ApplicationsDao for PgApplications {
    async fn get_by_id(&self, app_id: &str) -> DaoResult<Option<Application>> {
        debug!(app_id, "applications.get_by_id");
        self.load_application(app_id, None).await
    }

    async fn create(
        &self,
        mut app: Application,
        creating_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        debug!(app_id = %app.id, "applications.create");
        normalize_new_application(&mut app);
        if self
            .engine
            .get_by_id(Entity::Applications, &app.id, None)
            .await?
            .is_some()
        {
            return Err(DaoError::conflict(format!(
                "Application ID \"{}\" already exists.",
                app.id
            )));
        }
        let creator = match creating_user_id {
            Some(user_id) => self.users.load_user(user_id).await?,
            None => None,
        };
        migrate_application_data(&mut app);

        let app_row = application_row(&app)?;
        let owner = creator
            .as_ref()
            .map(|user| owner_row(&app.id, user, OwnerRole::Owner));
        let upserting_user_id = creator.as_ref().map(|user| user.id.clone());
        let app_id = app.id.clone();
        let engine = self.engine.clone();
        let this = self.clone();

        self.engine
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let by = upserting_user_id.as_deref();
                    engine
                        .upsert(Entity::Applications, app_row, by, Some(tx))
                        .await?;
                    if let Some(owner) = owner {
                        engine.upsert(Entity::Owners, owner, by, Some(tx)).await?;
                    }
                    this.load_application(&app_id, Some(tx))
                        .await?
                        .ok_or_else(|| {
                            DaoError::internal(format!("Application {} vanished after create", app_id))
                        })
                })
            })
            .await
    }

    async fn save(
        &self,
        mut app: Application,
        saving_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        debug!(app_id = %app.id, "applications.save");
        migrate_application_data(&mut app);
        self.engine
            .upsert(Entity::Applications, application_row(&app)?, saving_user_id, None)
            .await?;
        Ok(app)
    }

    async fn delete(
        &self,
        app_id: &str,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        debug!(app_id, ?deleting_user_id, "applications.delete");
        let app = self.require_application(app_id).await?;
        self.engine
            .delete_by_id(Entity::Applications, app_id, None)
            .await?;
        Ok(app)
    }

    async fn get_all(&self, query: &ListQuery) -> DaoResult<Page<Application>> {
        debug!(?query, "applications.get_all");
        let mut criteria = Criteria::new();
        criteria.add_filter_options(&query.filter);
        let options = QueryOptions::from_list(query, Some("id ASC")).joined(&OWNER_JOIN);
        let page = self
            .engine
            .get_page::<Application>(Entity::Applications, &criteria, &options)
            .await?;
        Ok(page.map(|mut app| {
            migrate_application_data(&mut app);
            app
        }))
    }

    async fn get_index(&self, offset: usize, limit: usize) -> DaoResult<Page<IdRef>> {
        debug!(offset, limit, "applications.get_index");
        let page = self
            .engine
            .get_by(
                Entity::Applications,
                &Criteria::new(),
                &QueryOptions::paged(offset, limit).ordered("id ASC"),
            )
            .await?;
        Ok(id_page(page))
    }

    async fn get_count(&self) -> DaoResult<i64> {
        self.engine.count(Entity::Applications, None).await
    }

    async fn get_owners(&self, app_id: &str) -> DaoResult<Vec<Owner>> {
        debug!(app_id, "applications.get_owners");
        self.owners_of(app_id, None).await
    }

    async fn add_owner(
        &self,
        app_id: &str,
        user_id: &str,
        role: OwnerRole,
        adding_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        debug!(app_id, user_id, %role, "applications.add_owner");
        let user = self.users.load_user(user_id).await?.ok_or_else(|| {
            DaoError::internal("add_owner: Could not load user to add as owner.")
        })?;
        self.require_application(app_id).await?;
        self.engine
            .upsert(Entity::Owners, owner_row(app_id, &user, role), adding_user_id, None)
            .await?;
        self.require_application(app_id).await
    }

    async fn delete_owner(
        &self,
        app_id: &str,
        user_id: &str,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<Application> {
        debug!(app_id, user_id, ?deleting_user_id, "applications.delete_owner");
        self.engine
            .delete_by(
                Entity::Owners,
                &Criteria::by("appId", app_id).and_eq("userId", user_id),
                None,
            )
            .await?;
        self.require_application(app_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{make_sql_query, SelectShape};

    #[test]
    fn test_owner_row_shape() {
        let user = User {
            id: "u1".into(),
            email: "owner@example.com".into(),
            ..Default::default()
        };
        let row = owner_row("app", &user, OwnerRole::Collaborator);
        assert_eq!(row["appId"], json!("app"));
        assert_eq!(row["role"], json!("collaborator"));
        assert!(!row["id"].as_str().unwrap().is_empty());

        let owner = owner_from_row(&row).unwrap();
        assert_eq!(owner.user_id, "u1");
        assert_eq!(owner.role, OwnerRole::Collaborator);
        assert_eq!(owner.email.as_deref(), Some("owner@example.com"));
    }

    #[test]
    fn test_application_row_drops_derived_fields() {
        let app = Application {
            id: "app".into(),
            owners: vec![Owner {
                user_id: "u1".into(),
                role: OwnerRole::Owner,
                email: None,
            }],
            owner_user_id: Some("u1".into()),
            ..Default::default()
        };
        let row = application_row(&app).unwrap();
        assert!(!row.contains_key("owners"));
        assert!(!row.contains_key("ownerUserId"));
    }

    #[test]
    fn test_listing_filters_on_owner_email() {
        let shape = SelectShape {
            order_by: Some("id ASC"),
            limit: 10,
            join: Some(&OWNER_JOIN),
            ..Default::default()
        };
        let q = make_sql_query(
            Entity::Applications,
            &["ownerEmail".to_string()],
            &[crate::sql::Op::ILike],
            &shape,
        )
        .unwrap();
        assert!(q.query.starts_with(
            "SELECT a.*, b.users_id AS owner_user_id, b.data->>'email' AS owner_email FROM wicked.applications a LEFT JOIN"
        ));
        assert!(q.query.contains("WHERE b.data->>'email' ILIKE $1"));
        assert!(q.query.ends_with("ORDER BY a.id ASC LIMIT 10 OFFSET 0"));
    }
}
