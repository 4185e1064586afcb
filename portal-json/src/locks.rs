//! Advisory file locks for the document store.
//!
//! A lock is a `<file>.lock` sentinel next to the data file it protects,
//! created with create-new semantics so two concurrent attempts can never
//! both succeed. Acquisition never blocks: a held lock is reported to the
//! caller as `Locked` and the caller decides whether to retry.
//!
//! ```text
//! lock_all([App(b), AppsIndex, User(z), User(a), Approvals])
//!   → AppsIndex → App(b) → User(a) → User(z) → Approvals
//!   ← released in reverse order when the LockSet drops
//! ```

use portal_core::{DaoError, DaoResult};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Name of the maintenance lock at the store root.
pub const GLOBAL_LOCK_FILE: &str = "global.lock";

const LOCK_SUFFIX: &str = ".lock";

// ============================================================================
// LOCK KEYS
// ============================================================================

/// A lockable resource of the document store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    UserIndex,
    User(String),
    AppsIndex,
    Application(String),
    Subscriptions(String),
    Approvals,
    Listeners,
    Events(String),
    Verifications,
    Metadata,
}

impl LockKey {
    /// Sub-directory and file name of the protected data file.
    pub fn location(&self) -> (Option<&'static str>, String) {
        match self {
            LockKey::UserIndex => (Some("users"), "_index.json".to_string()),
            LockKey::User(id) => (Some("users"), format!("{}.json", id)),
            LockKey::AppsIndex => (Some("applications"), "_index.json".to_string()),
            LockKey::Application(id) => (Some("applications"), format!("{}.json", id)),
            LockKey::Subscriptions(app_id) => (Some("subscriptions"), format!("{}.subs.json", app_id)),
            LockKey::Approvals => (Some("approvals"), "_index.json".to_string()),
            LockKey::Listeners => (Some("webhooks"), "_listeners.json".to_string()),
            LockKey::Events(listener_id) => (Some("webhooks"), format!("{}.json", listener_id)),
            LockKey::Verifications => (Some("verifications"), "_index.json".to_string()),
            LockKey::Metadata => (None, "meta.json".to_string()),
        }
    }

    /// Position in the global acquisition order: index locks first, then
    /// the entity, then related entities, then shared indexes.
    fn rank(&self) -> u8 {
        match self {
            LockKey::UserIndex | LockKey::AppsIndex | LockKey::Listeners | LockKey::Metadata => 0,
            LockKey::Application(_) | LockKey::Subscriptions(_) => 1,
            LockKey::User(_) | LockKey::Events(_) => 2,
            LockKey::Approvals | LockKey::Verifications => 3,
        }
    }

    fn sort_id(&self) -> &str {
        match self {
            LockKey::User(id)
            | LockKey::Application(id)
            | LockKey::Subscriptions(id)
            | LockKey::Events(id) => id,
            _ => "",
        }
    }

    /// Message of the `Locked` error reported when this lock is busy.
    pub fn busy_message(&self) -> String {
        match self {
            LockKey::UserIndex => "User index is currently locked. Try again later.".to_string(),
            LockKey::User(id) => format!("User with id {} is locked. Try again later.", id),
            LockKey::AppsIndex => "Application index is currently locked. Try again later.".to_string(),
            LockKey::Application(_) => "Application is locked. Please try again later.".to_string(),
            LockKey::Subscriptions(_) => "Application subscriptions are locked. Try again later.".to_string(),
            LockKey::Approvals => "Approvals index is locked. Try again later.".to_string(),
            LockKey::Listeners => "Listener index locked. Try again later.".to_string(),
            LockKey::Events(_) => "Events for listener are locked. Try again later.".to_string(),
            LockKey::Verifications => "Verification index locked. Try again later.".to_string(),
            LockKey::Metadata => "Metadata locked. Try again later.".to_string(),
        }
    }
}

/// Sort keys into acquisition order and drop duplicates.
pub fn lock_order(mut keys: Vec<LockKey>) -> Vec<LockKey> {
    keys.sort_by(|a, b| {
        a.rank()
            .cmp(&b.rank())
            .then_with(|| a.sort_id().cmp(b.sort_id()))
    });
    keys.dedup();
    keys
}

// ============================================================================
// GUARDS
// ============================================================================

/// A held lock; the sentinel is removed on drop.
#[derive(Debug)]
pub struct LockGuard {
    key: LockKey,
    sentinel: PathBuf,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.sentinel) {
            Ok(()) => debug!(key = ?self.key, "released lock"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(key = ?self.key, "lock sentinel vanished before release")
            }
            Err(e) => error!(key = ?self.key, error = %e, "failed to release lock"),
        }
    }
}

/// Several held locks, released in reverse acquisition order on drop.
#[derive(Debug, Default)]
pub struct LockSet {
    guards: Vec<LockGuard>,
}

impl LockSet {
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

// ============================================================================
// LOCK MANAGER
// ============================================================================

/// Creates and removes lock sentinels below a store directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    base: PathBuf,
}

impl LockManager {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn data_file(&self, key: &LockKey) -> PathBuf {
        let (sub_dir, file) = key.location();
        match sub_dir {
            Some(dir) => self.base.join(dir).join(file),
            None => self.base.join(file),
        }
    }

    fn sentinel(data_file: &Path) -> PathBuf {
        let mut name = data_file.as_os_str().to_owned();
        name.push(LOCK_SUFFIX);
        PathBuf::from(name)
    }

    fn global_lock_file(&self) -> PathBuf {
        self.base.join(GLOBAL_LOCK_FILE)
    }

    pub fn has_global_lock(&self) -> bool {
        self.global_lock_file().exists()
    }

    /// Put the whole store into maintenance; fails if it already is.
    pub fn global_lock(&self) -> DaoResult<()> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.global_lock_file())
        {
            Ok(_) => {
                info!("store globally locked");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(DaoError::locked(
                "globalLock: the store already is globally locked",
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub fn global_unlock(&self) -> DaoResult<()> {
        match std::fs::remove_file(self.global_lock_file()) {
            Ok(()) => {
                info!("store globally unlocked");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(DaoError::locked(
                "globalUnlock: the store is not locked, cannot unlock",
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Try to take a lock without waiting.
    ///
    /// Returns `None` if the lock or the global lock is held. A missing data
    /// file is an internal error: only existing files can be locked.
    pub fn try_lock(&self, key: &LockKey) -> DaoResult<Option<LockGuard>> {
        debug!(?key, "try_lock");
        if self.has_global_lock() {
            return Ok(None);
        }
        let data_file = self.data_file(key);
        if !data_file.exists() {
            return Err(DaoError::internal(format!(
                "lock: file not found: {}",
                data_file.display()
            )));
        }
        let sentinel = Self::sentinel(&data_file);
        match OpenOptions::new().write(true).create_new(true).open(&sentinel) {
            Ok(_) => Ok(Some(LockGuard {
                key: key.clone(),
                sentinel,
            })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Take a lock or fail with `Locked`.
    pub fn lock(&self, key: LockKey) -> DaoResult<LockGuard> {
        match self.try_lock(&key)? {
            Some(guard) => Ok(guard),
            None => Err(DaoError::locked(key.busy_message())),
        }
    }

    /// Take every lock in global order, or none of them.
    pub fn lock_all(&self, keys: Vec<LockKey>) -> DaoResult<LockSet> {
        let mut set = LockSet::default();
        for key in lock_order(keys) {
            // Dropping `set` on the error path releases what was taken.
            let guard = self.lock(key)?;
            set.guards.push(guard);
        }
        Ok(set)
    }

    /// Remove lock sentinels left behind by a crashed process, then clear a
    /// stale global lock.
    pub fn sweep(&self) -> DaoResult<usize> {
        let mut removed = 0;
        self.sweep_dir(&self.base, true, &mut removed)?;
        if removed > 0 {
            warn!(removed, "removed orphaned lock files");
        }
        if self.has_global_lock() {
            warn!("clearing stale global lock");
            self.global_unlock()?;
        }
        Ok(removed)
    }

    fn sweep_dir(&self, dir: &Path, is_root: bool, removed: &mut usize) -> DaoResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.sweep_dir(&path, false, removed)?;
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(LOCK_SUFFIX) || (is_root && name == GLOBAL_LOCK_FILE) {
                continue;
            }
            debug!(path = %path.display(), "removing lock file");
            std::fs::remove_file(&path)?;
            *removed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn store() -> (TempDir, LockManager) {
        let dir = TempDir::new().unwrap();
        for sub in ["users", "applications", "approvals", "webhooks"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        for file in [
            "users/_index.json",
            "users/a.json",
            "users/z.json",
            "applications/_index.json",
            "applications/b.json",
            "approvals/_index.json",
        ] {
            std::fs::write(dir.path().join(file), "[]").unwrap();
        }
        let locks = LockManager::new(dir.path());
        (dir, locks)
    }

    fn lock_files(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in walk(dir) {
            if entry.to_string_lossy().ends_with(".lock") {
                out.push(entry);
            }
        }
        out
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
        out
    }

    #[test]
    fn test_lock_and_release() {
        let (dir, locks) = store();
        {
            let _guard = locks.lock(LockKey::UserIndex).unwrap();
            assert!(dir.path().join("users/_index.json.lock").exists());
            let err = locks.lock(LockKey::UserIndex).unwrap_err();
            assert_eq!(err.status_code(), 423);
            assert!(err.to_string().contains("User index is currently locked"));
        }
        assert!(!dir.path().join("users/_index.json.lock").exists());
        assert!(locks.lock(LockKey::UserIndex).is_ok());
    }

    #[test]
    fn test_missing_data_file_is_internal() {
        let (_dir, locks) = store();
        let err = locks.lock(LockKey::User("nobody".into())).unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_concurrent_lock_has_single_winner() {
        let (_dir, locks) = store();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    // Keep the winning guard alive until every thread tried.
                    let guard = locks.try_lock(&LockKey::Approvals).unwrap();
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    guard.is_some()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_global_lock_blocks_everything() {
        let (_dir, locks) = store();
        locks.global_lock().unwrap();
        assert!(locks.try_lock(&LockKey::UserIndex).unwrap().is_none());
        assert_eq!(locks.global_lock().unwrap_err().status_code(), 423);
        locks.global_unlock().unwrap();
        assert_eq!(locks.global_unlock().unwrap_err().status_code(), 423);
        assert!(locks.try_lock(&LockKey::UserIndex).unwrap().is_some());
    }

    #[test]
    fn test_lock_order() {
        let ordered = lock_order(vec![
            LockKey::Approvals,
            LockKey::User("z".into()),
            LockKey::Application("b".into()),
            LockKey::User("a".into()),
            LockKey::AppsIndex,
            LockKey::User("a".into()),
        ]);
        assert_eq!(
            ordered,
            vec![
                LockKey::AppsIndex,
                LockKey::Application("b".into()),
                LockKey::User("a".into()),
                LockKey::User("z".into()),
                LockKey::Approvals,
            ]
        );
    }

    #[test]
    fn test_failed_lock_all_leaves_no_sentinel() {
        let (dir, locks) = store();
        let held = locks.lock(LockKey::User("z".into())).unwrap();
        let err = locks
            .lock_all(vec![
                LockKey::AppsIndex,
                LockKey::Application("b".into()),
                LockKey::User("a".into()),
                LockKey::User("z".into()),
                LockKey::Approvals,
            ])
            .unwrap_err();
        assert_eq!(err.status_code(), 423);
        assert_eq!(lock_files(dir.path()), vec![dir.path().join("users/z.json.lock")]);
        drop(held);
        assert!(lock_files(dir.path()).is_empty());
    }

    #[test]
    fn test_lock_set_releases_all() {
        let (dir, locks) = store();
        let set = locks
            .lock_all(vec![LockKey::UserIndex, LockKey::User("a".into())])
            .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(lock_files(dir.path()).len(), 2);
        drop(set);
        assert!(lock_files(dir.path()).is_empty());
    }

    #[test]
    fn test_sweep_removes_orphans_and_clears_global_lock() {
        let (dir, locks) = store();
        std::fs::write(dir.path().join("users/a.json.lock"), "").unwrap();
        std::fs::write(dir.path().join("approvals/_index.json.lock"), "").unwrap();
        locks.global_lock().unwrap();
        let removed = locks.sweep().unwrap();
        assert_eq!(removed, 2);
        assert!(!locks.has_global_lock());
        assert!(lock_files(dir.path()).is_empty());
    }

    #[test]
    fn test_sweep_keeps_global_lock_during_walk() {
        let (dir, locks) = store();
        std::fs::write(dir.path().join("users/a.json.lock"), "").unwrap();
        locks.global_lock().unwrap();
        let mut removed = 0;
        locks.sweep_dir(dir.path(), true, &mut removed).unwrap();
        assert_eq!(removed, 1);
        assert!(dir.path().join(GLOBAL_LOCK_FILE).exists());
    }
}
