//! Portal DAO Relational Store
//!
//! PostgreSQL backend of the portal DAO:
//! - pooled connections with create-on-demand of the target database
//! - a generic query engine over `id`, promoted columns and a `jsonb` blob
//! - short-lived count cache for paged listings
//! - schema bootstrap and versioned migrations
//! - `PgDao`, the `PortalDao` implementation over one database

pub mod config;
pub mod count_cache;
pub mod engine;
pub mod entities;
pub mod error;
pub mod meta;
pub mod model;
pub mod notify;
pub mod rows;
pub mod sql;

pub use config::{PgConfig, PgTuning, DEFAULT_DATABASE, MAINTENANCE_DATABASE};
pub use count_cache::{CountCache, COUNT_CACHE_PURGE_INTERVAL, COUNT_CACHE_TTL};
pub use engine::{decode, decode_page, encode, Executor, PgEngine, QueryOptions};
pub use entities::*;
pub use error::PgError;
pub use meta::{PgMeta, CURRENT_DATABASE_VERSION};
pub use model::Entity;
pub use sql::{Criteria, Join, JoinedField, Op, SqlParam};

use portal_core::{
    AccessTokensDao, ApplicationsDao, ApprovalsDao, AuditLogDao, DaoOptions, DaoResult,
    GrantsDao, MetaDao, NamespacesDao, PortalDao, RegistrationsDao, SubscriptionsDao, UsersDao,
    VerificationsDao, WebhooksDao,
};
use tracing::info;

// ============================================================================
// POSTGRES DAO
// ============================================================================

/// Relational implementation of the DAO contract.
#[derive(Debug, Clone)]
pub struct PgDao {
    engine: PgEngine,
    meta: PgMeta,
    users: PgUsers,
    applications: PgApplications,
    subscriptions: PgSubscriptions,
    approvals: PgApprovals,
    audit_log: PgAuditLog,
    verifications: PgVerifications,
    webhooks: PgWebhooks,
    registrations: PgRegistrations,
    grants: PgGrants,
    namespaces: PgNamespaces,
    access_tokens: PgAccessTokens,
}

impl PgDao {
    /// Build the DAO without connecting.
    pub fn new(config: PgConfig, options: DaoOptions) -> Self {
        let engine = PgEngine::new(config);
        let users = PgUsers::new(engine.clone());
        Self {
            meta: PgMeta::new(engine.clone(), options.clone()),
            applications: PgApplications::new(engine.clone(), users.clone()),
            users,
            subscriptions: PgSubscriptions::new(engine.clone(), options),
            approvals: PgApprovals::new(engine.clone()),
            audit_log: PgAuditLog::new(engine.clone()),
            verifications: PgVerifications::new(engine.clone()),
            webhooks: PgWebhooks::new(engine.clone()),
            registrations: PgRegistrations::new(engine.clone()),
            grants: PgGrants::new(engine.clone()),
            namespaces: PgNamespaces::new(engine.clone()),
            access_tokens: PgAccessTokens::new(engine.clone()),
            engine,
        }
    }

    /// Build the DAO, connect, and bring the schema up to date.
    pub async fn open(config: PgConfig, options: DaoOptions) -> DaoResult<Self> {
        config.validate()?;
        let dao = Self::new(config, options);
        dao.meta.run_init_checks().await?;
        info!(
            host = %dao.engine.config().host,
            database = %dao.engine.config().database,
            "relational store ready"
        );
        Ok(dao)
    }

    pub fn engine(&self) -> &PgEngine {
        &self.engine
    }

    /// Stop background tasks and close the pool.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}

impl PortalDao for PgDao {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    fn meta(&self) -> &dyn MetaDao {
        &self.meta
    }

    fn users(&self) -> &dyn UsersDao {
        &self.users
    }

    fn applications(&self) -> &dyn ApplicationsDao {
        &self.applications
    }

    fn subscriptions(&self) -> &dyn SubscriptionsDao {
        &self.subscriptions
    }

    fn approvals(&self) -> &dyn ApprovalsDao {
        &self.approvals
    }

    fn audit_log(&self) -> &dyn AuditLogDao {
        &self.audit_log
    }

    fn verifications(&self) -> &dyn VerificationsDao {
        &self.verifications
    }

    fn webhooks(&self) -> &dyn WebhooksDao {
        &self.webhooks
    }

    fn registrations(&self) -> &dyn RegistrationsDao {
        &self.registrations
    }

    fn grants(&self) -> &dyn GrantsDao {
        &self.grants
    }

    fn namespaces(&self) -> &dyn NamespacesDao {
        &self.namespaces
    }

    fn access_tokens(&self) -> &dyn AccessTokensDao {
        &self.access_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_does_not_connect() {
        let dao = PgDao::new(PgConfig::default(), DaoOptions::default());
        assert_eq!(dao.backend(), "postgres");
        assert!(!dao.engine().is_connected());
        assert!(!dao.meta().is_legacy_data());
    }

    #[tokio::test]
    async fn test_open_rejects_incomplete_config() {
        let config = PgConfig {
            host: String::new(),
            ..Default::default()
        };
        let err = PgDao::open(config, DaoOptions::default()).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
