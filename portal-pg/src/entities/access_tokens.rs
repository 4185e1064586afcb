//! OAuth2 access and refresh tokens. Only the relational backend keeps them.

use crate::engine::{encode, PgEngine, QueryOptions};
use crate::model::Entity;
use crate::sql::{Criteria, SqlParam};
use ::async_trait::async_trait;
use portal_core::{now_millis, AccessToken, AccessTokensDao, DaoResult, JsonMap, Page};
use serde_json::Value as JsonValue;
use tracing::debug;

/// Row for a token; the access token doubles as the row id.
fn token_row(token: &AccessToken) -> DaoResult<JsonMap> {
    let mut row = encode(token)?;
    row.insert("id".into(), JsonValue::String(token.access_token.clone()));
    Ok(row)
}

/// Relational access tokens.
#[derive(Debug, Clone)]
pub struct PgAccessTokens {
    engine: PgEngine,
}

impl PgAccessTokens {
    pub fn new(engine: PgEngine) -> Self {
        Self { engine }
    }

    /// Token lookups never go through the count cache.
    async fn get_by_column(&self, column: &str, value: &str) -> DaoResult<Page<AccessToken>> {
        self.engine
            .get_page(
                Entity::AccessTokens,
                &Criteria::by(column, value),
                &QueryOptions::new().uncached(),
            )
            .await
    }

    async fn delete_by_column(&self, column: &str, value: &str) -> DaoResult<()> {
        let deleted = self
            .engine
            .delete_by(Entity::AccessTokens, &Criteria::by(column, value), None)
            .await?;
        debug!(column, deleted, "deleted access tokens");
        Ok(())
    }
}

#[async_trait]
impl AccessTokensDao for PgAccessTokens {
    async fn get_by_access_token(&self, access_token: &str) -> DaoResult<Option<AccessToken>> {
        debug!("access_tokens.get_by_access_token");
        Ok(self
            .get_by_column("access_token", access_token)
            .await?
            .rows
            .into_iter()
            .next())
    }

    async fn get_by_refresh_token(&self, refresh_token: &str) -> DaoResult<Option<AccessToken>> {
        debug!("access_tokens.get_by_refresh_token");
        Ok(self
            .get_by_column("refresh_token", refresh_token)
            .await?
            .rows
            .into_iter()
            .next())
    }

    async fn get_by_authenticated_user_id(
        &self,
        authenticated_user_id: &str,
    ) -> DaoResult<Page<AccessToken>> {
        debug!(authenticated_user_id, "access_tokens.get_by_authenticated_user_id");
        self.get_by_column("authenticated_userid", authenticated_user_id)
            .await
    }

    async fn get_by_user_id(&self, user_id: &str) -> DaoResult<Page<AccessToken>> {
        debug!(user_id, "access_tokens.get_by_user_id");
        self.get_by_column("users_id", user_id).await
    }

    async fn insert(&self, token: AccessToken) -> DaoResult<()> {
        debug!(expires = token.expires, "access_tokens.insert");
        self.engine
            .upsert(Entity::AccessTokens, token_row(&token)?, None, None)
            .await
    }

    async fn delete_by_access_token(&self, access_token: &str) -> DaoResult<()> {
        debug!("access_tokens.delete_by_access_token");
        self.delete_by_column("access_token", access_token).await
    }

    async fn delete_by_refresh_token(&self, refresh_token: &str) -> DaoResult<()> {
        debug!("access_tokens.delete_by_refresh_token");
        self.delete_by_column("refresh_token", refresh_token).await
    }

    async fn delete_by_authenticated_user_id(
        &self,
        authenticated_user_id: &str,
    ) -> DaoResult<()> {
        debug!(authenticated_user_id, "access_tokens.delete_by_authenticated_user_id");
        self.delete_by_column("authenticated_userid", authenticated_user_id)
            .await
    }

    async fn delete_by_user_id(&self, user_id: &str) -> DaoResult<()> {
        debug!(user_id, "access_tokens.delete_by_user_id");
        self.delete_by_column("users_id", user_id).await
    }

    async fn cleanup(&self) -> DaoResult<()> {
        let now = now_millis();
        debug!(now, "access_tokens.cleanup");
        // Tokens without a refresh token expire with the access token,
        // all others with the refresh token.
        let access = self
            .engine
            .delete_expired(
                Entity::AccessTokens,
                "expires",
                SqlParam::Long(now),
                "refresh_token IS NULL",
                None,
            )
            .await?;
        let refresh = self
            .engine
            .delete_expired(
                Entity::AccessTokens,
                "expires_refresh",
                SqlParam::Long(now),
                "refresh_token IS NOT NULL",
                None,
            )
            .await?;
        debug!(access, refresh, "cleaned up expired access tokens");
        Ok(())
    }
}
