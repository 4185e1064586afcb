//! Shared state and file helpers of the document store.

use crate::locks::{LockGuard, LockKey, LockManager, LockSet};
use portal_core::{DaoError, DaoOptions, DaoResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Location of a document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonStoreConfig {
    /// Base directory holding all data files.
    pub base_path: PathBuf,
}

impl Default for JsonStoreConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./dynamic"),
        }
    }
}

impl JsonStoreConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Build from `PORTAL_JSON_BASE_PATH`, falling back to `./dynamic`.
    pub fn from_env() -> Self {
        std::env::var("PORTAL_JSON_BASE_PATH")
            .ok()
            .filter(|s| !s.is_empty())
            .map(Self::new)
            .unwrap_or_default()
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Sub-directories of the store, in the order they are created.
pub const STORE_DIRS: &[&str] = &[
    "applications",
    "approvals",
    "subscriptions",
    "subscription_index",
    "subscription_api_index",
    "users",
    "registrations",
    "verifications",
    "webhooks",
    "grants",
    "namespaces",
];

/// A document store rooted at one base directory.
#[derive(Debug)]
pub struct JsonStore {
    base: PathBuf,
    locks: LockManager,
    options: DaoOptions,
    legacy: AtomicBool,
}

impl JsonStore {
    pub fn new(config: &JsonStoreConfig, options: DaoOptions) -> Self {
        Self {
            base: config.base_path.clone(),
            locks: LockManager::new(&config.base_path),
            options,
            legacy: AtomicBool::new(false),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn options(&self) -> &DaoOptions {
        &self.options
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy.load(Ordering::SeqCst)
    }

    pub(crate) fn set_legacy(&self, legacy: bool) {
        self.legacy.store(legacy, Ordering::SeqCst);
    }

    pub fn dir(&self, sub_dir: &str) -> PathBuf {
        self.base.join(sub_dir)
    }

    pub fn file(&self, sub_dir: &str, file_name: &str) -> PathBuf {
        self.base.join(sub_dir).join(file_name)
    }

    /// Path of `<sub_dir>/<id><suffix>`; ids must be plain file name stems.
    pub fn entity_file(&self, sub_dir: &str, id: &str, suffix: &str) -> DaoResult<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(DaoError::config(format!("invalid {} id: {:?}", sub_dir, id)));
        }
        Ok(self.file(sub_dir, &format!("{}{}", id, suffix)))
    }

    pub fn lock(&self, key: LockKey) -> DaoResult<LockGuard> {
        self.locks.lock(key)
    }

    pub fn lock_all(&self, keys: Vec<LockKey>) -> DaoResult<LockSet> {
        self.locks.lock_all(keys)
    }
}

// ============================================================================
// FILE HELPERS
// ============================================================================

/// Parse a JSON file; `None` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> DaoResult<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Parse a JSON file, returning the default value if it does not exist.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> DaoResult<T> {
    Ok(read_json(path)?.unwrap_or_default())
}

/// Write a value as pretty-printed JSON.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> DaoResult<()> {
    debug!(path = %path.display(), "write_json");
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Remove a file; returns false if it did not exist.
pub fn remove_if_exists(path: &Path) -> DaoResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_read_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let value: Option<Vec<String>> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(value.is_none());
        let value: Vec<String> = read_json_or_default(&dir.path().join("nope.json")).unwrap();
        assert!(value.is_empty());
    }

    #[test]
    fn test_write_json_is_pretty_printed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.json");
        write_json(&path, &json!({"a": [1]})).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\n  \"a\": [\n    1\n  ]\n}");
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }

    #[test]
    fn test_entity_file_rejects_path_segments() {
        let store = JsonStore::new(&JsonStoreConfig::new("/data"), DaoOptions::default());
        assert_eq!(
            store.entity_file("users", "u1", ".json").unwrap(),
            PathBuf::from("/data/users/u1.json")
        );
        assert_eq!(
            store.entity_file("users", "../etc", ".json").unwrap_err().status_code(),
            400
        );
        assert!(store.entity_file("users", "", ".json").is_err());
    }

    #[test]
    fn test_config_deserializes_base_path() {
        let config: JsonStoreConfig =
            serde_json::from_value(json!({"basePath": "/var/portal"})).unwrap();
        assert_eq!(config.base_path, PathBuf::from("/var/portal"));
        assert_eq!(JsonStoreConfig::default().base_path, PathBuf::from("./dynamic"));
    }
}
