//! Grants: one `grants/<userId>.json` list per user.

use crate::store::{read_json_or_default, remove_if_exists, write_json, JsonStore};
use ::async_trait::async_trait;
use portal_core::{merge_grant_data, now_iso, ApiGrant, DaoError, DaoResult, GrantsDao, Page};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Reject lists with a duplicate api/application pair or a foreign user id.
fn sanity_check_grants(user_id: &str, grants: &[ApiGrant]) -> DaoResult<()> {
    let mut seen = HashSet::new();
    for grant in grants {
        let key = format!("{}#{}", grant.api_id, grant.application_id);
        if grant.user_id != user_id {
            return Err(DaoError::internal(format!(
                "Grants: User ID mismatch ({} != {})",
                user_id, grant.user_id
            )));
        }
        if !seen.insert(key.clone()) {
            return Err(DaoError::internal(format!(
                "Grants: Invalid state, API#Application {} is duplicate",
                key
            )));
        }
    }
    Ok(())
}

/// Document-store grants.
#[derive(Debug, Clone)]
pub struct JsonGrants {
    store: Arc<JsonStore>,
}

impl JsonGrants {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self { store }
    }

    fn grants_file(&self, user_id: &str) -> DaoResult<PathBuf> {
        self.store.entity_file("grants", user_id, ".json")
    }

    fn read_grants(&self, user_id: &str) -> DaoResult<Vec<ApiGrant>> {
        read_json_or_default(&self.grants_file(user_id)?)
    }

    fn write_grants(&self, user_id: &str, grants: &[ApiGrant]) -> DaoResult<()> {
        sanity_check_grants(user_id, grants)?;
        write_json(&self.grants_file(user_id)?, grants)
    }
}

#[async_trait]
impl GrantsDao for JsonGrants {
    async fn get_by_user_application_and_api(
        &self,
        user_id: &str,
        application_id: &str,
        api_id: &str,
    ) -> DaoResult<ApiGrant> {
        self.read_grants(user_id)?
            .into_iter()
            .find(|g| g.api_id == api_id && g.application_id == application_id)
            .ok_or_else(|| {
                DaoError::not_found(format!(
                    "User {} does not have a grants record for API {} for application {}",
                    user_id, api_id, application_id
                ))
            })
    }

    async fn get_by_user(&self, user_id: &str) -> DaoResult<Page<ApiGrant>> {
        Ok(Page::complete(self.read_grants(user_id)?))
    }

    async fn delete_by_user(&self, user_id: &str, _deleting_user_id: Option<&str>) -> DaoResult<()> {
        debug!(user_id, "grants.delete_by_user");
        if !remove_if_exists(&self.grants_file(user_id)?)? {
            debug!(user_id, "no grants file, ignoring");
        }
        Ok(())
    }

    async fn upsert(
        &self,
        user_id: &str,
        application_id: &str,
        api_id: &str,
        _upserting_user_id: Option<&str>,
        mut grants: ApiGrant,
    ) -> DaoResult<()> {
        debug!(user_id, application_id, api_id, "grants.upsert");
        let mut all = self.read_grants(user_id)?;
        let prev = all
            .iter()
            .position(|g| g.api_id == api_id && g.application_id == application_id);

        grants.user_id = user_id.to_string();
        grants.application_id = application_id.to_string();
        grants.api_id = api_id.to_string();
        merge_grant_data(prev.map(|i| &all[i]), &mut grants, &now_iso());

        match prev {
            Some(i) => all[i] = grants,
            None => all.push(grants),
        }
        self.write_grants(user_id, &all)
    }

    async fn delete(
        &self,
        user_id: &str,
        application_id: &str,
        api_id: &str,
        _deleting_user_id: Option<&str>,
    ) -> DaoResult<()> {
        debug!(user_id, application_id, api_id, "grants.delete");
        let mut all = self.read_grants(user_id)?;
        let pos = all
            .iter()
            .position(|g| g.api_id == api_id && g.application_id == application_id)
            .ok_or_else(|| {
                DaoError::not_found(format!(
                    "User {} does not have any grants for API {} and application {}",
                    user_id, api_id, application_id
                ))
            })?;
        all.remove(pos);
        self.write_grants(user_id, &all)
    }
}
