//! Audit log entries, timestamped by the database on insert.

use crate::engine::{decode, encode, PgEngine, QueryOptions};
use crate::model::Entity;
use crate::sql::{Criteria, Join, JoinedField, SqlParam};
use ::async_trait::async_trait;
use chrono::{DateTime, Utc};
use portal_core::{
    create_random_id, AuditLogDao, AuditLogEntry, DaoError, DaoResult, IdRef, ListQuery, Page,
};
use tracing::debug;

/// Columns computed from the entry for listings and filters.
const PROJECTION: Join = Join {
    clause: None,
    fields: &[
        JoinedField::new("CONCAT(data->>'action', ' ', data->>'entity')", "activity", "activity"),
        JoinedField::new("data->'data'->'user'->>'name'", "user", "user"),
        JoinedField::new("data->'data'->'user'->>'email'", "email", "email"),
        JoinedField::new("data->'data'->>'planId'", "plan", "plan"),
        JoinedField::new("data->'data'->'user'->>'role'", "role", "role"),
        JoinedField::new("data->'data'->>'apiId'", "api", "api"),
        JoinedField::new("data->'data'->>'applicationId'", "application", "application"),
        JoinedField::new("created_at", "created_at", "created_at"),
    ],
};

const DEFAULT_ORDER: &str = "created_at DESC";

/// Relational audit log.
#[derive(Debug, Clone)]
pub struct PgAuditLog {
    engine: PgEngine,
}

impl PgAuditLog {
    pub fn new(engine: PgEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl AuditLogDao for PgAuditLog {
    async fn get_by_id(&self, audit_log_id: &str) -> DaoResult<Option<AuditLogEntry>> {
        debug!(audit_log_id, "audit_log.get_by_id");
        self.engine
            .get_by_id(Entity::AuditLog, audit_log_id, None)
            .await?
            .map(decode)
            .transpose()
    }

    async fn get_all(&self, query: &ListQuery) -> DaoResult<Page<AuditLogEntry>> {
        debug!(?query, "audit_log.get_all");
        let mut filter = query.filter.clone();
        let mut criteria = Criteria::new();
        criteria.add_date_time_filter_options("created_at", &mut filter)?;
        criteria.add_filter_options(&filter);
        let options = QueryOptions::from_list(query, Some(DEFAULT_ORDER)).joined(&PROJECTION);
        self.engine
            .get_page(Entity::AuditLog, &criteria, &options)
            .await
    }

    async fn get_index(&self, _offset: usize, _limit: usize) -> DaoResult<Page<IdRef>> {
        Err(DaoError::not_implemented("audit_log.get_index"))
    }

    async fn get_count(&self) -> DaoResult<i64> {
        self.engine.count(Entity::AuditLog, None).await
    }

    async fn create(&self, mut entry: AuditLogEntry) -> DaoResult<()> {
        debug!(action = %entry.action, entity = %entry.entity, "audit_log.create");
        if entry.id.is_empty() {
            entry.id = create_random_id();
        }
        // `created_at` is set by the column default.
        entry.created_at = None;
        self.engine
            .upsert(Entity::AuditLog, encode(&entry)?, None, None)
            .await
    }

    async fn delete(
        &self,
        before: DateTime<Utc>,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<()> {
        debug!(%before, ?deleting_user_id, "audit_log.delete");
        let deleted = self
            .engine
            .delete_before(Entity::AuditLog, "created_at", SqlParam::Timestamp(before), None)
            .await?;
        debug!(deleted, "deleted audit log entries");
        Ok(())
    }

    async fn delete_by_id(
        &self,
        audit_log_id: &str,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<()> {
        debug!(audit_log_id, ?deleting_user_id, "audit_log.delete_by_id");
        self.engine
            .delete_by_id(Entity::AuditLog, audit_log_id, None)
            .await?;
        Ok(())
    }
}
