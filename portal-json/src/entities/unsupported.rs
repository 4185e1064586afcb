//! Capabilities the document store does not offer.
//!
//! Audit log and access tokens need the relational backend; every call
//! fails with `NotImplemented`, except the periodic token cleanup which
//! has nothing to clean up here.

use ::async_trait::async_trait;
use chrono::{DateTime, Utc};
use portal_core::{
    AccessToken, AccessTokensDao, AuditLogDao, AuditLogEntry, DaoError, DaoResult, IdRef,
    ListQuery, Page,
};
use tracing::{debug, warn};

/// Audit log of the document store.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAuditLog;

#[async_trait]
impl AuditLogDao for JsonAuditLog {
    async fn get_by_id(&self, _audit_log_id: &str) -> DaoResult<Option<AuditLogEntry>> {
        Err(DaoError::not_implemented("auditlog.getById"))
    }

    async fn get_all(&self, _query: &ListQuery) -> DaoResult<Page<AuditLogEntry>> {
        Err(DaoError::not_implemented("auditlog.getAll"))
    }

    async fn get_index(&self, _offset: usize, _limit: usize) -> DaoResult<Page<IdRef>> {
        Err(DaoError::not_implemented("auditlog.getIndex"))
    }

    async fn get_count(&self) -> DaoResult<i64> {
        Err(DaoError::not_implemented("auditlog.getCount"))
    }

    async fn create(&self, _entry: AuditLogEntry) -> DaoResult<()> {
        debug!("auditlog.create on document store");
        Err(DaoError::not_implemented("auditlog.create"))
    }

    async fn delete(&self, _before: DateTime<Utc>, _deleting_user_id: Option<&str>) -> DaoResult<()> {
        Err(DaoError::not_implemented("auditlog.delete"))
    }

    async fn delete_by_id(&self, _audit_log_id: &str, _deleting_user_id: Option<&str>) -> DaoResult<()> {
        Err(DaoError::not_implemented("auditlog.deleteById"))
    }
}

/// Access tokens of the document store.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAccessTokens;

#[async_trait]
impl AccessTokensDao for JsonAccessTokens {
    async fn get_by_access_token(&self, _access_token: &str) -> DaoResult<Option<AccessToken>> {
        Err(DaoError::not_implemented("accessTokens.getByAccessToken"))
    }

    async fn get_by_refresh_token(&self, _refresh_token: &str) -> DaoResult<Option<AccessToken>> {
        Err(DaoError::not_implemented("accessTokens.getByRefreshToken"))
    }

    async fn get_by_authenticated_user_id(
        &self,
        _authenticated_user_id: &str,
    ) -> DaoResult<Page<AccessToken>> {
        Err(DaoError::not_implemented("accessTokens.getByAuthenticatedUserId"))
    }

    async fn get_by_user_id(&self, _user_id: &str) -> DaoResult<Page<AccessToken>> {
        Err(DaoError::not_implemented("accessTokens.getByUserId"))
    }

    async fn insert(&self, _token: AccessToken) -> DaoResult<()> {
        Err(DaoError::not_implemented("accessTokens.insert"))
    }

    async fn delete_by_access_token(&self, _access_token: &str) -> DaoResult<()> {
        Err(DaoError::not_implemented("accessTokens.deleteByAccessToken"))
    }

    async fn delete_by_refresh_token(&self, _refresh_token: &str) -> DaoResult<()> {
        Err(DaoError::not_implemented("accessTokens.deleteByRefreshToken"))
    }

    async fn delete_by_authenticated_user_id(&self, _authenticated_user_id: &str) -> DaoResult<()> {
        Err(DaoError::not_implemented("accessTokens.deleteByAuthenticatedUserId"))
    }

    async fn delete_by_user_id(&self, _user_id: &str) -> DaoResult<()> {
        Err(DaoError::not_implemented("accessTokens.deleteByUserId"))
    }

    async fn cleanup(&self) -> DaoResult<()> {
        warn!("accessTokens.cleanup is not supported by the document store, ignoring");
        Ok(())
    }
}
