//! The data-access contract.
//!
//! Both backends implement the same family of capability traits, so callers
//! hold an `Arc<dyn PortalDao>` and never know which store is active.
//! Optional acting-user parameters (`saving_user_id`, `deleting_user_id`..)
//! end up as `changedBy` on the written record where the backend keeps it.

use crate::entities::*;
use crate::error::DaoResult;
use crate::query::{ListQuery, Page};
use ::async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// META
// ============================================================================

/// Startup checks a backend runs before it serves requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitCheck {
    /// Refuse unmigrated legacy data unless opened for migration.
    DataMigratedOrEmpty,
    /// Rebuild the by-clientId and by-API subscription indexes.
    RebuildSubscriptionIndexes,
    /// Create the directory skeleton and seed files.
    EnsureDirectories,
    /// Remove lock files left behind by a crashed process.
    CleanupLockFiles,
    /// Bring stored data up to the current data version.
    RunMigrations,
}

#[async_trait]
pub trait MetaDao: Send + Sync {
    /// Checks in the order they must run.
    fn init_checks(&self) -> Vec<InitCheck>;

    async fn run_init_check(&self, check: InitCheck) -> DaoResult<()>;

    async fn run_init_checks(&self) -> DaoResult<()> {
        for check in self.init_checks() {
            tracing::debug!(?check, "running init check");
            self.run_init_check(check).await?;
        }
        Ok(())
    }

    /// Remove all stored data.
    async fn wipe(&self) -> DaoResult<()>;

    /// True if the store holds data from before dynamic versioning.
    fn is_legacy_data(&self) -> bool;

    async fn get_metadata(&self, property: &str) -> DaoResult<Option<JsonValue>>;

    /// Set a metadata property; `None` or an empty value deletes it.
    async fn set_metadata(&self, property: &str, value: Option<JsonValue>) -> DaoResult<()>;
}

// ============================================================================
// USERS & APPLICATIONS
// ============================================================================

#[async_trait]
pub trait UsersDao: Send + Sync {
    async fn get_by_id(&self, user_id: &str) -> DaoResult<Option<User>>;

    /// Case-insensitive lookup.
    async fn get_by_email(&self, email: &str) -> DaoResult<Option<User>>;

    async fn get_short_info_by_email(&self, email: &str) -> DaoResult<Option<ShortUserInfo>>;

    async fn get_short_info_by_custom_id(&self, custom_id: &str)
        -> DaoResult<Option<ShortUserInfo>>;

    /// Create a user; duplicate email or customId is a conflict.
    async fn create(&self, user: User) -> DaoResult<User>;

    async fn save(&self, user: User, saving_user_id: Option<&str>) -> DaoResult<User>;

    async fn delete(&self, user_id: &str, deleting_user_id: Option<&str>) -> DaoResult<()>;

    async fn get_index(&self, offset: usize, limit: usize) -> DaoResult<Page<ShortUserInfo>>;

    async fn get_count(&self) -> DaoResult<i64>;
}

#[async_trait]
pub trait ApplicationsDao: Send + Sync {
    async fn get_by_id(&self, app_id: &str) -> DaoResult<Option<Application>>;

    /// Create an application; the creating user, if any, becomes its owner.
    async fn create(
        &self,
        app: Application,
        creating_user_id: Option<&str>,
    ) -> DaoResult<Application>;

    async fn save(&self, app: Application, saving_user_id: Option<&str>)
        -> DaoResult<Application>;

    /// Delete an application with its subscriptions and approvals.
    async fn delete(&self, app_id: &str, deleting_user_id: Option<&str>)
        -> DaoResult<Application>;

    /// Listing rows carry `ownerUserId`/`ownerEmail` instead of the owner list.
    async fn get_all(&self, query: &ListQuery) -> DaoResult<Page<Application>>;

    async fn get_index(&self, offset: usize, limit: usize) -> DaoResult<Page<IdRef>>;

    async fn get_count(&self) -> DaoResult<i64>;

    async fn get_owners(&self, app_id: &str) -> DaoResult<Vec<Owner>>;

    async fn add_owner(
        &self,
        app_id: &str,
        user_id: &str,
        role: OwnerRole,
        adding_user_id: Option<&str>,
    ) -> DaoResult<Application>;

    async fn delete_owner(
        &self,
        app_id: &str,
        user_id: &str,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<Application>;
}

// ============================================================================
// SUBSCRIPTIONS & APPROVALS
// ============================================================================

#[async_trait]
pub trait SubscriptionsDao: Send + Sync {
    async fn get_by_app_id(&self, app_id: &str) -> DaoResult<Vec<Subscription>>;

    async fn get_by_client_id(&self, client_id: &str) -> DaoResult<Option<Subscription>>;

    async fn get_by_app_and_api(&self, app_id: &str, api_id: &str)
        -> DaoResult<Option<Subscription>>;

    async fn get_by_api(&self, api_id: &str, offset: usize, limit: usize)
        -> DaoResult<Page<Subscription>>;

    async fn get_all(&self, query: &ListQuery) -> DaoResult<Page<Subscription>>;

    async fn get_index(&self, offset: usize, limit: usize) -> DaoResult<Page<IdRef>>;

    async fn get_count(&self) -> DaoResult<i64>;

    async fn create(
        &self,
        sub: Subscription,
        creating_user_id: Option<&str>,
    ) -> DaoResult<Subscription>;

    async fn delete(&self, app_id: &str, api_id: &str, subscription_id: &str) -> DaoResult<()>;

    /// Replace the stored subscription of `app_id` carrying the same id.
    async fn patch(
        &self,
        app_id: &str,
        sub: Subscription,
        patching_user_id: Option<&str>,
    ) -> DaoResult<Subscription>;
}

#[async_trait]
pub trait ApprovalsDao: Send + Sync {
    async fn get_all(&self) -> DaoResult<Vec<Approval>>;

    async fn create(&self, approval: Approval) -> DaoResult<Approval>;

    async fn delete_by_app_and_api(&self, app_id: &str, api_id: &str) -> DaoResult<()>;
}

// ============================================================================
// AUDIT LOG & VERIFICATIONS
// ============================================================================

#[async_trait]
pub trait AuditLogDao: Send + Sync {
    async fn get_by_id(&self, audit_log_id: &str) -> DaoResult<Option<AuditLogEntry>>;

    /// Besides field filters, accepts `startdate` and `enddate` bounds.
    async fn get_all(&self, query: &ListQuery) -> DaoResult<Page<AuditLogEntry>>;

    async fn get_index(&self, offset: usize, limit: usize) -> DaoResult<Page<IdRef>>;

    async fn get_count(&self) -> DaoResult<i64>;

    async fn create(&self, entry: AuditLogEntry) -> DaoResult<()>;

    /// Delete all entries created before `before`.
    async fn delete(&self, before: DateTime<Utc>, deleting_user_id: Option<&str>)
        -> DaoResult<()>;

    async fn delete_by_id(&self, audit_log_id: &str, deleting_user_id: Option<&str>)
        -> DaoResult<()>;
}

#[async_trait]
pub trait VerificationsDao: Send + Sync {
    async fn get_all(&self) -> DaoResult<Vec<Verification>>;

    async fn get_by_id(&self, verification_id: &str) -> DaoResult<Option<Verification>>;

    async fn create(&self, verification: Verification) -> DaoResult<Verification>;

    async fn delete(&self, verification_id: &str) -> DaoResult<()>;

    /// Delete verifications older than `expiry_secs`.
    async fn reconcile(&self, expiry_secs: i64) -> DaoResult<()>;
}

// ============================================================================
// WEBHOOKS
// ============================================================================

/// Called by the webhook dispatch loop when events are pending.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch(&self) -> DaoResult<()>;
}

/// Handle to a running webhook dispatch loop.
pub struct ListenerHook {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ListenerHook {
    pub fn new(shutdown: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        Self { shutdown, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "webhook dispatch loop ended abnormally");
        }
    }
}

#[async_trait]
pub trait WebhookListenersDao: Send + Sync {
    async fn get_all(&self) -> DaoResult<Vec<WebhookListener>>;

    async fn get_by_id(&self, listener_id: &str) -> DaoResult<Option<WebhookListener>>;

    /// Insert or replace; a new listener starts with an empty event queue.
    async fn upsert(&self, listener: WebhookListener) -> DaoResult<WebhookListener>;

    async fn delete(&self, listener_id: &str) -> DaoResult<()>;
}

#[async_trait]
pub trait WebhookEventsDao: Send + Sync {
    /// Start the loop that calls `dispatcher` when events are pending.
    async fn hook_listeners(&self, dispatcher: Arc<dyn EventDispatcher>)
        -> DaoResult<ListenerHook>;

    async fn get_by_listener(&self, listener_id: &str) -> DaoResult<Vec<WebhookEvent>>;

    /// Queue the event for every registered listener.
    async fn create(&self, event: WebhookEvent) -> DaoResult<()>;

    async fn delete(&self, listener_id: &str, event_id: &str) -> DaoResult<()>;

    async fn flush(&self, listener_id: &str) -> DaoResult<()>;
}

pub trait WebhooksDao: Send + Sync {
    fn listeners(&self) -> &dyn WebhookListenersDao;
    fn events(&self) -> &dyn WebhookEventsDao;
}

// ============================================================================
// REGISTRATIONS, GRANTS, NAMESPACES
// ============================================================================

#[async_trait]
pub trait RegistrationsDao: Send + Sync {
    async fn get_by_pool_and_user(&self, pool_id: &str, user_id: &str)
        -> DaoResult<Page<Registration>>;

    async fn get_by_pool_and_namespace(
        &self,
        pool_id: &str,
        namespace: Option<&str>,
        query: &ListQuery,
    ) -> DaoResult<Page<Registration>>;

    async fn get_by_user(&self, user_id: &str) -> DaoResult<UserRegistrations>;

    async fn upsert(
        &self,
        pool_id: &str,
        user_id: &str,
        upserting_user_id: Option<&str>,
        registration: Registration,
    ) -> DaoResult<()>;

    async fn delete(
        &self,
        pool_id: &str,
        user_id: &str,
        namespace: Option<&str>,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<()>;
}

#[async_trait]
pub trait GrantsDao: Send + Sync {
    /// Missing grant records are `NotFound`.
    async fn get_by_user_application_and_api(
        &self,
        user_id: &str,
        application_id: &str,
        api_id: &str,
    ) -> DaoResult<ApiGrant>;

    async fn get_by_user(&self, user_id: &str) -> DaoResult<Page<ApiGrant>>;

    async fn delete_by_user(&self, user_id: &str, deleting_user_id: Option<&str>)
        -> DaoResult<()>;

    /// Store the scope list, keeping `grantedDate` of scopes granted before.
    async fn upsert(
        &self,
        user_id: &str,
        application_id: &str,
        api_id: &str,
        upserting_user_id: Option<&str>,
        grants: ApiGrant,
    ) -> DaoResult<()>;

    async fn delete(
        &self,
        user_id: &str,
        application_id: &str,
        api_id: &str,
        deleting_user_id: Option<&str>,
    ) -> DaoResult<()>;
}

#[async_trait]
pub trait NamespacesDao: Send + Sync {
    async fn get_by_pool(&self, pool_id: &str, query: &ListQuery) -> DaoResult<Page<Namespace>>;

    async fn get_by_pool_and_namespace(&self, pool_id: &str, namespace: &str)
        -> DaoResult<Option<Namespace>>;

    async fn upsert(
        &self,
        pool_id: &str,
        namespace: &str,
        upserting_user_id: Option<&str>,
        data: Namespace,
    ) -> DaoResult<()>;

    async fn delete(&self, pool_id: &str, namespace: &str, deleting_user_id: Option<&str>)
        -> DaoResult<()>;
}

// ============================================================================
// ACCESS TOKENS
// ============================================================================

#[async_trait]
pub trait AccessTokensDao: Send + Sync {
    async fn get_by_access_token(&self, access_token: &str) -> DaoResult<Option<AccessToken>>;

    async fn get_by_refresh_token(&self, refresh_token: &str) -> DaoResult<Option<AccessToken>>;

    async fn get_by_authenticated_user_id(&self, authenticated_user_id: &str)
        -> DaoResult<Page<AccessToken>>;

    async fn get_by_user_id(&self, user_id: &str) -> DaoResult<Page<AccessToken>>;

    async fn insert(&self, token: AccessToken) -> DaoResult<()>;

    async fn delete_by_access_token(&self, access_token: &str) -> DaoResult<()>;

    async fn delete_by_refresh_token(&self, refresh_token: &str) -> DaoResult<()>;

    async fn delete_by_authenticated_user_id(&self, authenticated_user_id: &str)
        -> DaoResult<()>;

    async fn delete_by_user_id(&self, user_id: &str) -> DaoResult<()>;

    /// Remove expired tokens.
    async fn cleanup(&self) -> DaoResult<()>;
}

// ============================================================================
// PORTAL DAO
// ============================================================================

/// Entry point to every capability of a backend.
pub trait PortalDao: Send + Sync {
    /// Short backend name for logs, e.g. `json` or `postgres`.
    fn backend(&self) -> &'static str;

    fn meta(&self) -> &dyn MetaDao;
    fn users(&self) -> &dyn UsersDao;
    fn applications(&self) -> &dyn ApplicationsDao;
    fn subscriptions(&self) -> &dyn SubscriptionsDao;
    fn approvals(&self) -> &dyn ApprovalsDao;
    fn audit_log(&self) -> &dyn AuditLogDao;
    fn verifications(&self) -> &dyn VerificationsDao;
    fn webhooks(&self) -> &dyn WebhooksDao;
    fn registrations(&self) -> &dyn RegistrationsDao;
    fn grants(&self) -> &dyn GrantsDao;
    fn namespaces(&self) -> &dyn NamespacesDao;
    fn access_tokens(&self) -> &dyn AccessTokensDao;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMeta {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl MetaDao for CountingMeta {
        fn init_checks(&self) -> Vec<InitCheck> {
            vec![InitCheck::EnsureDirectories, InitCheck::RunMigrations]
        }

        async fn run_init_check(&self, _check: InitCheck) -> DaoResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn wipe(&self) -> DaoResult<()> {
            Ok(())
        }

        fn is_legacy_data(&self) -> bool {
            false
        }

        async fn get_metadata(&self, _property: &str) -> DaoResult<Option<JsonValue>> {
            Ok(None)
        }

        async fn set_metadata(&self, _property: &str, _value: Option<JsonValue>) -> DaoResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_init_checks_runs_every_check() {
        let meta = CountingMeta {
            runs: AtomicUsize::new(0),
        };
        meta.run_init_checks().await.unwrap();
        assert_eq!(meta.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_listener_hook_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let _ = rx.changed().await;
        });
        let hook = ListenerHook::new(tx, handle);
        hook.shutdown().await;
    }
}
