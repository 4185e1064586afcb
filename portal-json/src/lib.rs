//! Portal DAO Document Store
//!
//! Flat-file backend of the portal DAO:
//! - advisory `.lock` sentinels with fail-fast, ordered multi-resource locking
//! - one JSON file per entity or per list, pretty-printed
//! - secondary indexes for subscriptions and registrations, rebuilt at startup
//! - `JsonDao`, the `PortalDao` implementation over a base directory

pub mod entities;
pub mod locks;
pub mod meta;
pub mod store;

pub use entities::*;
pub use locks::{lock_order, LockGuard, LockKey, LockManager, LockSet, GLOBAL_LOCK_FILE};
pub use meta::{JsonMeta, CURRENT_DYNAMIC_VERSION};
pub use store::{JsonStore, JsonStoreConfig};

use portal_core::{
    AccessTokensDao, ApplicationsDao, ApprovalsDao, AuditLogDao, DaoOptions, DaoResult,
    GrantsDao, MetaDao, NamespacesDao, PortalDao, RegistrationsDao, SubscriptionsDao, UsersDao,
    VerificationsDao, WebhooksDao,
};
use std::sync::Arc;
use tracing::info;

// ============================================================================
// JSON DAO
// ============================================================================

/// Document-store implementation of the DAO contract.
#[derive(Debug, Clone)]
pub struct JsonDao {
    store: Arc<JsonStore>,
    meta: JsonMeta,
    users: JsonUsers,
    applications: JsonApplications,
    subscriptions: JsonSubscriptions,
    approvals: JsonApprovals,
    audit_log: JsonAuditLog,
    verifications: JsonVerifications,
    webhooks: JsonWebhooks,
    registrations: JsonRegistrations,
    grants: JsonGrants,
    namespaces: JsonNamespaces,
    access_tokens: JsonAccessTokens,
}

impl JsonDao {
    /// Build the DAO without touching the filesystem.
    pub fn new(config: &JsonStoreConfig, options: DaoOptions) -> Self {
        let store = Arc::new(JsonStore::new(config, options));
        Self {
            meta: JsonMeta::new(store.clone()),
            users: JsonUsers::new(store.clone()),
            applications: JsonApplications::new(store.clone()),
            subscriptions: JsonSubscriptions::new(store.clone()),
            approvals: JsonApprovals::new(store.clone()),
            audit_log: JsonAuditLog,
            verifications: JsonVerifications::new(store.clone()),
            webhooks: JsonWebhooks::new(store.clone()),
            registrations: JsonRegistrations::new(store.clone()),
            grants: JsonGrants::new(store.clone()),
            namespaces: JsonNamespaces::new(store.clone()),
            access_tokens: JsonAccessTokens,
            store,
        }
    }

    /// Build the DAO and run its init checks.
    pub async fn open(config: &JsonStoreConfig, options: DaoOptions) -> DaoResult<Self> {
        let dao = Self::new(config, options);
        dao.meta.run_init_checks().await?;
        info!(base = %config.base_path.display(), legacy = dao.meta.is_legacy_data(), "document store ready");
        Ok(dao)
    }

    pub fn store(&self) -> &Arc<JsonStore> {
        &self.store
    }
}

impl PortalDao for JsonDao {
    fn backend(&self) -> &'static str {
        "json"
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

// ============================================================================
// TEST HELPERS
// ============================================================================

#[cfg(test)]
pub(crate) fn test_store_with(options: DaoOptions) -> (tempfile::TempDir, Arc<JsonStore>) {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let store = Arc::new(JsonStore::new(&JsonStoreConfig::new(dir.path()), options));
    JsonMeta::new(store.clone())
        .ensure_directories()
        .expect("store skeleton");
    (dir, store)
}

#[cfg(test)]
pub(crate) fn test_store() -> (tempfile::TempDir, Arc<JsonStore>) {
    test_store_with(DaoOptions::default())
}
