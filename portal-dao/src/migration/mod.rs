//! Migration Pipeline
//!
//! Copies portal data from a source backend into a target backend. Phases
//! run strictly in order:
//! 1. validate the configuration shape
//! 2. open source and target in migration mode (a JSON source is copied to
//!    a temporary working directory first, the target is wiped on request)
//! 3. validate the source; legacy data needs complete custom id mappings
//! 4. collect application ids that collide ignoring case
//! 5. copy users, registrations, applications, subscriptions and approvals
//!
//! Cleanup hooks run after every run, successful or not.

mod config;
mod report;

pub use config::{custom_id_prefix, CustomIdMappings, MigrationConfig, INTERNAL_PREFIX};
pub use report::{MigrationSummary, MigrationWarning, Severity};

use crate::config::DaoConfig;
use futures_util::future::BoxFuture;
use portal_core::{
    create_random_id, make_name, DaoError, DaoOptions, DaoResult, PortalDao, Registration, User,
};
use portal_json::{JsonDao, JsonStoreConfig};
use portal_pg::PgDao;
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Records fetched per index page.
pub const PAGE_SIZE: usize = 5;

/// Pool every migrated legacy user is registered in.
pub const WICKED_POOL: &str = "wicked";

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum MigrationError {
    /// The configuration document is incomplete or malformed.
    #[error("Invalid migration configuration: {0}")]
    Config(String),

    /// The source data cannot be migrated with this configuration.
    #[error("Source validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Dao(#[from] DaoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// PAGING
// ============================================================================

/// `(offset, limit)` windows covering `count` records.
pub fn page_windows(count: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..count)
        .step_by(PAGE_SIZE)
        .map(move |offset| (offset, PAGE_SIZE.min(count - offset)))
}

fn as_count(count: i64) -> usize {
    usize::try_from(count).unwrap_or(0)
}

/// Ids of all users, each once.
async fn user_ids(source: &dyn PortalDao) -> DaoResult<Vec<String>> {
    let count = as_count(source.users().get_count().await?);
    debug!(count, "user count");
    let mut seen = HashSet::new();
    let mut ids = Vec::with_capacity(count);
    for (offset, limit) in page_windows(count) {
        for info in source.users().get_index(offset, limit).await?.rows {
            if !seen.insert(info.id.clone()) {
                warn!(user_id = %info.id, "Detected duplicate user id in index, skipping");
                continue;
            }
            ids.push(info.id);
        }
    }
    Ok(ids)
}

/// How application ids are told apart while paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdMatch {
    Exact,
    IgnoreCase,
}

/// Ids of all applications, each once under `matching`.
async fn application_ids(source: &dyn PortalDao, matching: IdMatch) -> DaoResult<Vec<String>> {
    let count = as_count(source.applications().get_count().await?);
    debug!(count, "application count");
    let mut seen = HashSet::new();
    let mut ids = Vec::with_capacity(count);
    for (offset, limit) in page_windows(count) {
        for entry in source.applications().get_index(offset, limit).await?.rows {
            let key = match matching {
                IdMatch::Exact => entry.id.clone(),
                IdMatch::IgnoreCase => entry.id.to_lowercase(),
            };
            if !seen.insert(key) {
                warn!(app_id = %entry.id, "Detected duplicate application id in index, skipping");
                continue;
            }
            ids.push(entry.id);
        }
    }
    Ok(ids)
}

/// Application ids that collide with another id ignoring case; both sides
/// of every collision are in the set.
pub fn duplicate_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    let mut first_seen: HashMap<String, &str> = HashMap::new();
    let mut dupes = HashSet::new();
    for id in ids {
        let lower = id.to_lowercase();
        match first_seen.get(&lower) {
            Some(other) => {
                warn!(app_id = id, also_as = *other, "Found duplicate application id");
                dupes.insert(id.to_string());
                dupes.insert(other.to_string());
            }
            None => {
                first_seen.insert(lower, id);
            }
        }
    }
    dupes
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// ============================================================================
// MIGRATOR
// ============================================================================

type CleanupHook = Box<dyn FnOnce() -> BoxFuture<'static, DaoResult<()>> + Send + Sync>;

/// One migration run.
pub struct Migrator {
    config: MigrationConfig,
    warnings: Vec<MigrationWarning>,
    cleanup_hooks: Vec<CleanupHook>,
    dupe_apps: HashSet<String>,
    skipped_subscriptions: HashSet<String>,
    legacy: bool,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("source", &self.config.source.kind())
            .field("target", &self.config.target.kind())
            .field("warnings", &self.warnings.len())
            .field("cleanup_hooks", &self.cleanup_hooks.len())
            .field("legacy", &self.legacy)
            .finish()
    }
}

impl Migrator {
    pub fn new(config: MigrationConfig) -> Self {
        Self {
            config,
            warnings: Vec::new(),
            cleanup_hooks: Vec::new(),
            dupe_apps: HashSet::new(),
            skipped_subscriptions: HashSet::new(),
            legacy: false,
        }
    }

    pub fn warnings(&self) -> &[MigrationWarning] {
        &self.warnings
    }

    pub fn is_legacy_migration(&self) -> bool {
        self.legacy
    }

    /// Run the migration, then the cleanup hooks, then print the warnings.
    pub async fn migrate(&mut self) -> Result<MigrationSummary, MigrationError> {
        info!(
            source = self.config.source.kind(),
            target = self.config.target.kind(),
            "Starting Migration"
        );
        let outcome = self.run().await;
        self.cleanup().await;
        self.print_warnings();
        match &outcome {
            Ok(summary) => info!(?summary, "Migration finished"),
            Err(e) => error!(error = %e, "Migration failed"),
        }
        outcome
    }

    async fn run(&mut self) -> Result<MigrationSummary, MigrationError> {
        let source_config = self.config.source.clone();
        let target_config = self.config.target.clone();
        let source = self.open_store(&source_config, false, false).await?;
        let target = self
            .open_store(&target_config, self.config.wipe_target, true)
            .await?;

        info!("Validating source DAO with given migration configuration");
        self.validate_source(source.as_ref()).await?;

        let all_apps = application_ids(source.as_ref(), IdMatch::Exact).await?;
        self.dupe_apps = duplicate_ids(all_apps.iter().map(String::as_str));

        let mut summary = MigrationSummary {
            skipped_applications: self.dupe_apps.len(),
            ..Default::default()
        };
        self.migrate_users(source.as_ref(), target.as_ref(), &mut summary).await?;
        self.migrate_registrations(source.as_ref(), target.as_ref(), &mut summary).await?;
        self.migrate_applications(source.as_ref(), target.as_ref(), &mut summary).await?;
        self.migrate_subscriptions(source.as_ref(), target.as_ref(), &mut summary).await?;
        self.migrate_approvals(source.as_ref(), target.as_ref(), &mut summary).await?;
        Ok(summary)
    }

    // ------------------------------------------------------------------------
    // Stores and cleanup
    // ------------------------------------------------------------------------

    fn hook_cleanup<F>(&mut self, hook: F)
    where
        F: FnOnce() -> BoxFuture<'static, DaoResult<()>> + Send + Sync + 'static,
    {
        self.cleanup_hooks.push(Box::new(hook));
    }

    async fn cleanup(&mut self) {
        info!("Cleaning up");
        for hook in self.cleanup_hooks.drain(..) {
            if let Err(e) = hook().await {
                error!(error = %e, "cleanup hook failed");
            }
        }
    }

    fn print_warnings(&self) {
        for warning in &self.warnings {
            warning.print();
        }
    }

    /// Copy a JSON source to a temporary directory removed on cleanup.
    fn working_copy(&mut self, config: &JsonStoreConfig) -> Result<JsonStoreConfig, MigrationError> {
        let tmp = tempfile::Builder::new().prefix("wicked_migration").tempdir()?;
        let path = tmp.path().to_path_buf();
        debug!(tmp = %path.display(), "using temporary working copy");
        self.hook_cleanup(move || {
            Box::pin(async move {
                debug!(tmp = %tmp.path().display(), "removing working copy");
                tmp.close().map_err(DaoError::from)
            })
        });
        if !config.base_path.is_dir() {
            return Err(MigrationError::Config(format!(
                "JSON source {} is not a directory",
                config.base_path.display()
            )));
        }
        copy_dir(&config.base_path, &path)?;
        debug!(from = %config.base_path.display(), "copied source files");
        Ok(JsonStoreConfig::new(path))
    }

    async fn open_store(
        &mut self,
        config: &DaoConfig,
        wipe: bool,
        is_target: bool,
    ) -> Result<Arc<dyn PortalDao>, MigrationError> {
        let options = DaoOptions::migration();
        let dao: Arc<dyn PortalDao> = match config {
            DaoConfig::Json(json) => {
                let json = if is_target {
                    json.clone()
                } else {
                    self.working_copy(json)?
                };
                Arc::new(JsonDao::new(&json, options))
            }
            DaoConfig::Postgres(pg) => {
                let dao = PgDao::new(pg.clone(), options);
                let handle = dao.clone();
                self.hook_cleanup(move || {
                    Box::pin(async move {
                        handle.shutdown().await;
                        Ok(())
                    })
                });
                Arc::new(dao)
            }
        };
        if wipe {
            dao.meta().wipe().await?;
        }
        dao.meta().run_init_checks().await?;
        info!(backend = dao.backend(), is_target, "Successfully created DAO");
        Ok(dao)
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    async fn validate_source(&mut self, source: &dyn PortalDao) -> Result<(), MigrationError> {
        self.legacy = source.meta().is_legacy_data();
        if !self.legacy {
            info!("Migrating from a current data source");
            return Ok(());
        }
        info!("Migrating from a legacy data source");

        let mut unprefixed = false;
        let mut prefixes = BTreeSet::new();
        for user_id in user_ids(source).await? {
            let Some(user) = source.users().get_by_id(&user_id).await? else {
                continue;
            };
            let Some(custom_id) = user.custom_id.as_deref().filter(|c| !c.is_empty()) else {
                continue;
            };
            match custom_id_prefix(custom_id) {
                None => unprefixed = true,
                Some(INTERNAL_PREFIX) => {}
                Some(prefix) => {
                    prefixes.insert(prefix.to_string());
                }
            }
        }

        let mappings = self.config.mappings();
        let mut success = true;
        if unprefixed && mappings.default_prefix.as_deref().map_or(true, str::is_empty) {
            success = false;
            self.warnings.push(MigrationWarning::error(
                "Migration configuration for empty customId prefixes missing.",
                "Some users have a custom ID without a prefix. Every custom ID needs a prefix \
                 matching the auth method ID of its identity provider; configure one as \
                 customIdMappings.defaultPrefix.",
                Some(json!({ "customIdMappings": { "defaultPrefix": "someprefix" } })),
            ));
        }
        if !prefixes.is_empty() {
            if mappings.prefixes.is_empty() {
                success = false;
                self.warnings.push(MigrationWarning::error(
                    "Migration configuration for custom ID/auth method ID prefix mapping missing",
                    "Identities can only be mapped onto auth methods with a list of custom ID \
                     prefix mappings in customIdMappings.prefixes.",
                    Some(json!({
                        "customIdMappings": { "prefixes": { "Google": "google", "Github": "github" } }
                    })),
                ));
            } else {
                for prefix in prefixes.iter().filter(|p| !mappings.prefixes.contains_key(*p)) {
                    success = false;
                    self.warnings.push(MigrationWarning::error(
                        format!(
                            "Migration configuration for custom ID prefix {} to auth method ID missing.",
                            prefix
                        ),
                        "The custom ID prefix above needs a mapping to an auth method ID.",
                        Some(json!({
                            "customIdMappings": { "prefixes": { prefix.as_str(): prefix.to_lowercase() } }
                        })),
                    ));
                }
            }
        }

        if !success {
            return Err(MigrationError::Validation(
                "custom id mappings incomplete; see warning list".to_string(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------------

    async fn migrate_users(
        &self,
        source: &dyn PortalDao,
        target: &dyn PortalDao,
        summary: &mut MigrationSummary,
    ) -> DaoResult<()> {
        info!("Migrating Users");
        let mappings = self.config.mappings();
        for user_id in user_ids(source).await? {
            let Some(mut user) = source.users().get_by_id(&user_id).await? else {
                warn!(user_id = %user_id, "Could not load user, skipping");
                continue;
            };
            info!(user_id = %user_id, "Migrating user");
            if self.legacy {
                user.custom_id = user
                    .custom_id
                    .as_deref()
                    .filter(|c| !c.is_empty())
                    .and_then(|c| mappings.map(c));
            }
            // Back-references come back when owners are re-added.
            user.applications.clear();
            let created = target.users().create(user.clone()).await?;
            summary.users += 1;
            if self.legacy {
                create_wicked_registration(target, &created.id, &user).await?;
                summary.registrations += 1;
            }
        }
        Ok(())
    }

    async fn migrate_registrations(
        &self,
        source: &dyn PortalDao,
        target: &dyn PortalDao,
        summary: &mut MigrationSummary,
    ) -> DaoResult<()> {
        info!("Migrating Registrations");
        for user_id in user_ids(source).await? {
            let registrations = source.registrations().get_by_user(&user_id).await?;
            for (pool_id, pool) in registrations.pools {
                for registration in pool {
                    debug!(user_id = %user_id, pool_id = %pool_id, name = %registration.name, "Migrating registration");
                    target
                        .registrations()
                        .upsert(&pool_id, &user_id, None, registration)
                        .await?;
                    summary.registrations += 1;
                }
            }
        }
        Ok(())
    }

    async fn migrate_applications(
        &mut self,
        source: &dyn PortalDao,
        target: &dyn PortalDao,
        summary: &mut MigrationSummary,
    ) -> DaoResult<()> {
        info!("Migrating Applications");
        for app_id in application_ids(source, IdMatch::IgnoreCase).await? {
            let Some(mut app) = source.applications().get_by_id(&app_id).await? else {
                warn!(app_id = %app_id, "Could not load application, skipping");
                continue;
            };
            let owners = std::mem::take(&mut app.owners);
            if self.dupe_apps.contains(&app.id) {
                warn!(app_id = %app_id, "Skipping migration of duplicate application");
                self.warnings.push(MigrationWarning::warning(
                    format!("APPLICATION: Migration of \"{}\" was skipped, as it is duplicate.", app.id),
                    "Applications whose ids differ only by case are not migrated, as their \
                     subscriptions may have been mixed up. Contact the owners listed below.",
                    serde_json::to_value(&owners).ok(),
                ));
                continue;
            }
            info!(app_id = %app_id, "Migrating application");
            app.id = app.id.to_lowercase();
            let changed_by = changed_by(&app.extra);
            target.applications().create(app.clone(), None).await?;
            for owner in owners {
                target
                    .applications()
                    .add_owner(&app.id, &owner.user_id, owner.role, changed_by.as_deref())
                    .await?;
            }
            summary.applications += 1;
        }
        Ok(())
    }

    async fn migrate_subscriptions(
        &mut self,
        source: &dyn PortalDao,
        target: &dyn PortalDao,
        summary: &mut MigrationSummary,
    ) -> DaoResult<()> {
        info!("Migrating Subscriptions");
        for app_id in application_ids(source, IdMatch::Exact).await? {
            for mut sub in source.subscriptions().get_by_app_id(&app_id).await? {
                if self.dupe_apps.contains(&sub.application) {
                    warn!(app_id = %sub.application, api_id = %sub.api, "Skipping subscription of duplicate application");
                    self.warnings.push(MigrationWarning::warning(
                        format!(
                            "SUBSCRIPTIONS: Skipping subscription to API {} for application {}",
                            sub.api, sub.application
                        ),
                        "Subscriptions of duplicate applications are not migrated.",
                        None,
                    ));
                    self.skipped_subscriptions.insert(sub.id.clone());
                    summary.skipped_subscriptions += 1;
                    continue;
                }
                sub.application = sub.application.to_lowercase();
                info!(app_id = %sub.application, api_id = %sub.api, "Migrating subscription");
                let changed_by = changed_by(&sub.extra);
                target
                    .subscriptions()
                    .create(sub, changed_by.as_deref())
                    .await?;
                summary.subscriptions += 1;
            }
        }
        Ok(())
    }

    async fn migrate_approvals(
        &self,
        source: &dyn PortalDao,
        target: &dyn PortalDao,
        summary: &mut MigrationSummary,
    ) -> DaoResult<()> {
        info!("Migrating Approvals");
        for mut approval in source.approvals().get_all().await? {
            if self.skipped_subscriptions.contains(&approval.subscription_id) {
                warn!(
                    subscription_id = %approval.subscription_id,
                    app_id = %approval.application.id,
                    "Skipped approval of skipped subscription"
                );
                summary.skipped_approvals += 1;
                continue;
            }
            if approval.id.is_empty() {
                approval.id = create_random_id();
            }
            approval.application.id = approval.application.id.to_lowercase();
            target.approvals().create(approval).await?;
            summary.approvals += 1;
        }
        Ok(())
    }
}

fn changed_by(extra: &portal_core::JsonMap) -> Option<String> {
    extra
        .get("changedBy")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

async fn create_wicked_registration(
    target: &dyn PortalDao,
    user_id: &str,
    user: &User,
) -> DaoResult<()> {
    debug!(user_id, "creating wicked pool registration");
    let registration = Registration {
        pool_id: WICKED_POOL.to_string(),
        user_id: user_id.to_string(),
        name: make_name(user),
        ..Default::default()
    };
    target
        .registrations()
        .upsert(WICKED_POOL, user_id, None, registration)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_page_windows() {
        let windows: Vec<_> = page_windows(12).collect();
        assert_eq!(windows, vec![(0, 5), (5, 5), (10, 2)]);
        assert_eq!(page_windows(0).count(), 0);
        assert_eq!(page_windows(5).collect::<Vec<_>>(), vec![(0, 5)]);
    }

    #[test]
    fn test_duplicate_ids() {
        let dupes = duplicate_ids(["Shop", "blog", "shop", "tools"]);
        let mut dupes: Vec<_> = dupes.into_iter().collect();
        dupes.sort();
        assert_eq!(dupes, vec!["Shop".to_string(), "shop".to_string()]);
        assert!(duplicate_ids(["a", "b"]).is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_hooks_run_in_order_and_errors_do_not_stop_them() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut migrator = Migrator::new(
            MigrationConfig::from_value(json!({
                "source": { "type": "json", "config": { "basePath": "/nonexistent" } },
                "target": { "type": "json", "config": { "basePath": "/nonexistent-target" } }
            }))
            .unwrap(),
        );
        for n in 0..3 {
            let tx = tx.clone();
            migrator.hook_cleanup(move || {
                Box::pin(async move {
                    let _ = tx.send(n);
                    if n == 1 {
                        Err(DaoError::internal("hook failed"))
                    } else {
                        Ok(())
                    }
                })
            });
        }
        migrator.cleanup().await;
        drop(tx);
        let mut order = Vec::new();
        while let Some(n) = rx.recv().await {
            order.push(n);
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    proptest! {
        #[test]
        fn prop_page_windows_cover_count(count in 0usize..200) {
            let windows: Vec<_> = page_windows(count).collect();
            let total: usize = windows.iter().map(|(_, limit)| limit).sum();
            prop_assert_eq!(total, count);
            prop_assert!(windows.iter().all(|(_, limit)| *limit >= 1 && *limit <= PAGE_SIZE));
            prop_assert_eq!(windows.len(), (count + PAGE_SIZE - 1) / PAGE_SIZE);
        }
    }
}
