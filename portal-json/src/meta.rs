//! Metadata, startup checks and data versioning of the document store.

use crate::entities::JsonSubscriptions;
use crate::locks::LockKey;
use crate::store::{read_json, write_json, JsonStore, STORE_DIRS};
use ::async_trait::async_trait;
use portal_core::{DaoError, DaoResult, InitCheck, JsonMap, MetaDao};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Data version this build writes.
pub const CURRENT_DYNAMIC_VERSION: i64 = 1;

const META_FILE: &str = "meta.json";
const DYNAMIC_VERSION: &str = "dynamicVersion";

/// Files seeded with an empty list when missing.
const SEED_FILES: &[(&str, &str)] = &[
    ("applications", "_index.json"),
    ("approvals", "_index.json"),
    ("users", "_index.json"),
    ("verifications", "_index.json"),
    ("webhooks", "_listeners.json"),
];

fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Document-store metadata and lifecycle.
#[derive(Debug, Clone)]
pub struct JsonMeta {
    store: Arc<JsonStore>,
}

impl JsonMeta {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self { store }
    }

    fn meta_file(&self) -> PathBuf {
        self.store.base().join(META_FILE)
    }

    fn load_metadata(&self) -> DaoResult<JsonMap> {
        Ok(read_json(&self.meta_file())?.unwrap_or_default())
    }

    fn dynamic_version(&self) -> DaoResult<i64> {
        Ok(self
            .load_metadata()?
            .get(DYNAMIC_VERSION)
            .and_then(JsonValue::as_i64)
            .unwrap_or(0))
    }

    fn update_metadata(&self, property: &str, value: Option<JsonValue>) -> DaoResult<()> {
        let meta_file = self.meta_file();
        if !meta_file.exists() {
            write_json(&meta_file, &JsonMap::new())?;
        }
        let _lock = self.store.lock(LockKey::Metadata)?;
        let mut metadata = self.load_metadata()?;
        match value.filter(|v| !is_empty_value(v)) {
            Some(v) => {
                metadata.insert(property.to_string(), v);
            }
            None => {
                metadata.remove(property);
            }
        }
        write_json(&meta_file, &metadata)
    }

    // ------------------------------------------------------------------------
    // Init checks
    // ------------------------------------------------------------------------

    fn data_was_migrated_or_is_empty(&self) -> DaoResult<()> {
        let base = self.store.base();
        std::fs::create_dir_all(base)?;
        let files = std::fs::read_dir(base)?.collect::<Result<Vec<_>, std::io::Error>>()?;
        if files.is_empty() {
            debug!(base = %base.display(), "empty store");
            return Ok(());
        }
        debug!(entries = files.len(), "store holds data");
        if self.load_metadata()?.contains_key(DYNAMIC_VERSION) {
            return Ok(());
        }
        if !self.store.options().migration_mode {
            return Err(DaoError::config(
                "the store holds legacy data without dynamicVersion; \
                 run it through the migration process first",
            ));
        }
        warn!(base = %base.display(), "opened legacy data for migration");
        self.store.set_legacy(true);
        Ok(())
    }

    pub(crate) fn ensure_directories(&self) -> DaoResult<()> {
        let base = self.store.base();
        std::fs::create_dir_all(base)?;
        for dir in STORE_DIRS {
            let path = self.store.dir(dir);
            if !path.is_dir() {
                debug!(dir, "creating store directory");
                std::fs::create_dir_all(&path)?;
            }
        }
        for (dir, file) in SEED_FILES {
            let path = self.store.file(dir, file);
            if !path.exists() {
                debug!(path = %path.display(), "seeding empty list");
                write_json(&path, &Vec::<JsonValue>::new())?;
            }
        }
        let meta_file = self.meta_file();
        if !meta_file.exists() {
            write_json(&meta_file, &JsonMap::new())?;
        }
        Ok(())
    }

    fn cleanup_lock_files(&self) -> DaoResult<()> {
        self.store.locks().sweep().map(|_| ()).map_err(|e| {
            error!(error = %e, "lock file cleanup failed");
            e
        })
    }

    fn run_migrations(&self) -> DaoResult<()> {
        let current = self.dynamic_version()?;
        if current >= CURRENT_DYNAMIC_VERSION {
            return Ok(());
        }
        info!(
            current,
            target = CURRENT_DYNAMIC_VERSION,
            "running dynamic data migrations"
        );
        for version in (current + 1)..=CURRENT_DYNAMIC_VERSION {
            self.migrate_to(version)?;
            self.update_metadata(DYNAMIC_VERSION, Some(JsonValue::from(version)))?;
            info!(version, "dynamic data migration succeeded");
        }
        Ok(())
    }

    fn migrate_to(&self, version: i64) -> DaoResult<()> {
        match version {
            // Version 1 only introduces the version marker.
            1 => Ok(()),
            other => Err(DaoError::internal(format!(
                "Dynamic version migration step {} was not found.",
                other
            ))),
        }
    }
}

#[async_trait]
impl MetaDao for JsonMeta {
    fn init_checks(&self) -> Vec<InitCheck> {
        vec![
            InitCheck::DataMigratedOrEmpty,
            InitCheck::RebuildSubscriptionIndexes,
            InitCheck::EnsureDirectories,
            InitCheck::CleanupLockFiles,
            InitCheck::RunMigrations,
        ]
    }

    async fn run_init_check(&self, check: InitCheck) -> DaoResult<()> {
        match check {
            InitCheck::DataMigratedOrEmpty => self.data_was_migrated_or_is_empty(),
            InitCheck::RebuildSubscriptionIndexes => {
                JsonSubscriptions::new(self.store.clone()).rebuild_indexes()
            }
            InitCheck::EnsureDirectories => self.ensure_directories(),
            InitCheck::CleanupLockFiles => self.cleanup_lock_files(),
            InitCheck::RunMigrations => self.run_migrations(),
        }
    }

    async fn wipe(&self) -> DaoResult<()> {
        let base = self.store.base();
        info!(base = %base.display(), "wiping document store");
        match std::fs::remove_dir_all(base) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_legacy_data(&self) -> bool {
        self.store.is_legacy()
    }

    async fn get_metadata(&self, property: &str) -> DaoResult<Option<JsonValue>> {
        Ok(self.load_metadata()?.remove(property))
    }

    async fn set_metadata(&self, property: &str, value: Option<JsonValue>) -> DaoResult<()> {
        debug!(property, "meta.set_metadata");
        self.update_metadata(property, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonStoreConfig;
    use portal_core::DaoOptions;
    use serde_json::json;
    use tempfile::TempDir;

    fn meta_at(dir: &TempDir, options: DaoOptions) -> JsonMeta {
        let config = JsonStoreConfig::new(dir.path().join("dynamic"));
        JsonMeta::new(Arc::new(JsonStore::new(&config, options)))
    }

    #[tokio::test]
    async fn test_fresh_store_initializes() {
        let dir = TempDir::new().unwrap();
        let meta = meta_at(&dir, DaoOptions::default());
        meta.run_init_checks().await.unwrap();
        assert!(!meta.is_legacy_data());
        assert_eq!(
            meta.get_metadata("dynamicVersion").await.unwrap(),
            Some(json!(CURRENT_DYNAMIC_VERSION))
        );
        assert!(dir.path().join("dynamic/users/_index.json").exists());
        assert!(dir.path().join("dynamic/webhooks/_listeners.json").exists());
        // A second start finds a migrated store.
        meta.run_init_checks().await.unwrap();
    }

    #[tokio::test]
    async fn test_legacy_data_requires_migration_mode() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("dynamic");
        std::fs::create_dir_all(base.join("users")).unwrap();
        std::fs::write(base.join("users/_index.json"), "[]").unwrap();

        let meta = meta_at(&dir, DaoOptions::default());
        let err = meta.run_init_checks().await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        let meta = meta_at(&dir, DaoOptions::migration());
        meta.run_init_checks().await.unwrap();
        assert!(meta.is_legacy_data());
    }

    #[tokio::test]
    async fn test_set_metadata_none_deletes() {
        let dir = TempDir::new().unwrap();
        let meta = meta_at(&dir, DaoOptions::default());
        meta.run_init_checks().await.unwrap();
        meta.set_metadata("foo", Some(json!("bar"))).await.unwrap();
        assert_eq!(meta.get_metadata("foo").await.unwrap(), Some(json!("bar")));
        meta.set_metadata("foo", None).await.unwrap();
        assert_eq!(meta.get_metadata("foo").await.unwrap(), None);
        meta.set_metadata("foo", Some(json!("x"))).await.unwrap();
        meta.set_metadata("foo", Some(JsonValue::Null)).await.unwrap();
        assert_eq!(meta.get_metadata("foo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_startup_sweeps_stale_locks() {
        let dir = TempDir::new().unwrap();
        let meta = meta_at(&dir, DaoOptions::default());
        meta.run_init_checks().await.unwrap();
        let stale = dir.path().join("dynamic/users/_index.json.lock");
        std::fs::write(&stale, "").unwrap();
        meta.run_init_checks().await.unwrap();
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_wipe_removes_everything() {
        let dir = TempDir::new().unwrap();
        let meta = meta_at(&dir, DaoOptions::default());
        meta.run_init_checks().await.unwrap();
        meta.wipe().await.unwrap();
        assert!(!dir.path().join("dynamic").exists());
        meta.wipe().await.unwrap();
    }
}
