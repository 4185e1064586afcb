//! Registrations of users in pools.
//!
//! Every registration is stored twice: in the user's list
//! `registrations/<userId>.json` and as a `{poolId, namespace, userId}` entry
//! of the pool index `registrations/<poolId>[_<namespace>].json`. Listings
//! walk the pool index and resolve each entry through the user's list.

use crate::store::{read_json_or_default, write_json, JsonStore};
use ::async_trait::async_trait;
use portal_core::{
    filter_and_page, DaoError, DaoResult, ListQuery, Page, PoolIndexEntry, Registration,
    RegistrationsDao, UserRegistrations,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error};

const REGS_DIR: &str = "registrations";

fn in_pool(reg: &Registration, pool_id: &str, namespace: Option<&str>) -> bool {
    reg.pool_id == pool_id && namespace.map_or(true, |ns| reg.namespace.as_deref() == Some(ns))
}

fn is_user_entry(entry: &PoolIndexEntry, pool_id: &str, namespace: Option<&str>, user_id: &str) -> bool {
    entry.pool_id == pool_id
        && entry.user_id == user_id
        && namespace.map_or(true, |ns| entry.namespace.as_deref() == Some(ns))
}

/// Document-store registrations.
#[derive(Debug, Clone)]
pub struct JsonRegistrations {
    store: Arc<JsonStore>,
}

impl JsonRegistrations {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self { store }
    }

    fn pool_index_file(&self, pool_id: &str, namespace: Option<&str>) -> DaoResult<PathBuf> {
        match namespace {
            Some(ns) => self.store.entity_file(REGS_DIR, &format!("{}_{}", pool_id, ns), ".json"),
            None => self.store.entity_file(REGS_DIR, pool_id, ".json"),
        }
    }

    fn user_file(&self, user_id: &str) -> DaoResult<PathBuf> {
        self.store.entity_file(REGS_DIR, user_id, ".json")
    }

    fn load_pool_index(&self, pool_id: &str, namespace: Option<&str>) -> DaoResult<Vec<PoolIndexEntry>> {
        read_json_or_default(&self.pool_index_file(pool_id, namespace)?)
    }

    fn save_pool_index(
        &self,
        pool_id: &str,
        namespace: Option<&str>,
        index: &[PoolIndexEntry],
    ) -> DaoResult<()> {
        write_json(&self.pool_index_file(pool_id, namespace)?, index)
    }

    fn load_user_registrations(&self, user_id: &str) -> DaoResult<Vec<Registration>> {
        read_json_or_default(&self.user_file(user_id)?)
    }

    fn save_user_registrations(&self, user_id: &str, regs: &[Registration]) -> DaoResult<()> {
        write_json(&self.user_file(user_id)?, regs)
    }

    fn registrations_in_pool(&self, pool_id: &str, user_id: &str) -> DaoResult<Vec<Registration>> {
        Ok(self
            .load_user_registrations(user_id)?
            .into_iter()
            .filter(|r| r.pool_id == pool_id)
            .collect())
    }

    /// Resolve one pool index entry to the user's registration.
    fn resolve_entry(
        &self,
        pool_id: &str,
        namespace: Option<&str>,
        entry: &PoolIndexEntry,
    ) -> DaoResult<Registration> {
        let mut regs = self.registrations_in_pool(pool_id, &entry.user_id)?;
        if regs.is_empty() {
            error!(pool_id, user_id = %entry.user_id, "pool index entry without registration");
            return Err(DaoError::internal(format!(
                "Missing user registration for user {}, pool {}, namespace {:?}",
                entry.user_id, pool_id, namespace
            )));
        }
        match namespace {
            Some(ns) => regs
                .into_iter()
                .find(|r| r.namespace.as_deref() == Some(ns))
                .ok_or_else(|| {
                    DaoError::internal(format!(
                        "Invalid internal state: No registration for user {} for pool {} and namespace {}",
                        entry.user_id, pool_id, ns
                    ))
                }),
            None if regs.len() == 1 => Ok(regs.remove(0)),
            None => Err(DaoError::internal(format!(
                "Invalid internal state: Multiple registrations for user {} for pool {}",
                entry.user_id, pool_id
            ))),
        }
    }
}

#[async_trait]
impl RegistrationsDao for JsonRegistrations {
    async fn get_by_pool_and_user(
        &self,
        pool_id: &str,
        user_id: &str,
    ) -> DaoResult<Page<Registration>> {
        Ok(Page::complete(self.registrations_in_pool(pool_id, user_id)?))
    }

    async fn get_by_pool_and_namespace(
        &self,
        pool_id: &str,
        namespace: Option<&str>,
        query: &ListQuery,
    ) -> DaoResult<Page<Registration>> {
        debug!(pool_id, ?namespace, "registrations.get_by_pool_and_namespace");
        let mut rows = Vec::new();
        for entry in self.load_pool_index(pool_id, namespace)? {
            rows.push(self.resolve_entry(pool_id, namespace, &entry)?);
        }
        filter_and_page(rows, query, Some("name ASC"))
    }

    async fn get_by_user(&self, user_id: &str) -> DaoResult<UserRegistrations> {
        let mut result = UserRegistrations::default();
        for reg in self.load_user_registrations(user_id)? {
            result.pools.entry(reg.pool_id.clone()).or_default().push(reg);
        }
        Ok(result)
    }

    async fn upsert(
        &self,
        pool_id: &str,
        user_id: &str,
        _upserting_user_id: Option<&str>,
        mut registration: Registration,
    ) -> DaoResult<()> {
        let namespace = registration.namespace.clone();
        let ns = namespace.as_deref();
        debug!(pool_id, user_id, ?ns, "registrations.upsert");

        let mut index = self.load_pool_index(pool_id, ns)?;
        if !index.iter().any(|e| is_user_entry(e, pool_id, ns, user_id)) {
            index.push(PoolIndexEntry {
                pool_id: pool_id.to_string(),
                namespace: namespace.clone(),
                user_id: user_id.to_string(),
            });
            self.save_pool_index(pool_id, ns, &index)?;
        }

        registration.pool_id = pool_id.to_string();
        registration.user_id = user_id.to_string();
        let mut regs = self.load_user_registrations(user_id)?;
        match regs.iter_mut().find(|r| in_pool(r, pool_id, ns)) {
            Some(existing) => *existing = registration,
            None => regs.push(registration),
        }
        self.save_user_registrations(user_id, &regs)
    }

    async fn delete(
        &self,
        pool_id: &str,
        user_id: &str,
        namespace: Option<&str>,
        _deleting_user_id: Option<&str>,
    ) -> DaoResult<()> {
        debug!(pool_id, user_id, ?namespace, "registrations.delete");
        let mut index = self.load_pool_index(pool_id, namespace)?;
        let mut regs = self.load_user_registrations(user_id)?;
        let index_pos = index
            .iter()
            .position(|e| is_user_entry(e, pool_id, namespace, user_id));
        let reg_pos = regs.iter().position(|r| in_pool(r, pool_id, namespace));
        let (Some(index_pos), Some(reg_pos)) = (index_pos, reg_pos) else {
            return Err(DaoError::not_found("Not found"));
        };
        index.remove(index_pos);
        regs.remove(reg_pos);
        self.save_pool_index(pool_id, namespace, &index)?;
        self.save_user_registrations(user_id, &regs)
    }
}
