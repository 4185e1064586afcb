//! Entity types persisted by the portal DAO.
//!
//! Every entity carries its well-known properties as typed fields and keeps
//! everything else in a flattened `extra` map, so records written by one
//! backend survive a round trip through the other unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Free-form properties carried alongside the typed fields of an entity.
pub type JsonMap = serde_json::Map<String, JsonValue>;

// ============================================================================
// USERS
// ============================================================================

/// A registered portal user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    /// Unique, compared case-insensitively.
    #[serde(default)]
    pub email: String,
    /// Federated identity in the form `authMethod:rawId`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Back-references to the applications this user owns or collaborates on.
    #[serde(default)]
    pub applications: Vec<IdRef>,
    /// Only ever present on input; stripped before a record is returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl User {
    pub fn first_name(&self) -> Option<&str> {
        self.extra.get("firstName").and_then(JsonValue::as_str)
    }

    pub fn last_name(&self) -> Option<&str> {
        self.extra.get("lastName").and_then(JsonValue::as_str)
    }

    /// Index record for this user.
    pub fn short_info(&self) -> ShortUserInfo {
        ShortUserInfo {
            id: self.id.clone(),
            email: self.email.clone(),
            custom_id: self.custom_id.clone(),
        }
    }
}

/// Index record of a user: `{id, email, customId}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortUserInfo {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
}

/// Reference to an entity by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRef {
    pub id: String,
}

// ============================================================================
// APPLICATIONS
// ============================================================================

/// OAuth client type of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Confidential,
    PublicSpa,
    PublicNative,
}

/// Role of an owner on an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerRole {
    Owner,
    Collaborator,
    Reader,
}

impl OwnerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerRole::Owner => "owner",
            OwnerRole::Collaborator => "collaborator",
            OwnerRole::Reader => "reader",
        }
    }
}

impl std::fmt::Display for OwnerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner entry of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub user_id: String,
    pub role: OwnerRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A client application registered in the portal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub confidential: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<ClientType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub owners: Vec<Owner>,
    /// Projected on listing rows only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    /// Projected on listing rows only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_email: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

// ============================================================================
// SUBSCRIPTIONS & APPROVALS
// ============================================================================

/// Subscription of an application to an API plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub application: String,
    pub api: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apikey: Option<String>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Entry of the by-clientId subscription index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionIndexEntry {
    pub application: String,
    pub api: String,
}

/// Entry of the by-API subscription index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiIndexEntry {
    pub application: String,
    pub plan: String,
}

/// Embedded `{id, ..}` reference inside an approval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Pending approval of a subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    /// Older data sets may carry approvals without an id.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub application: EntityRef,
    #[serde(default)]
    pub api: EntityRef,
    #[serde(flatten)]
    pub extra: JsonMap,
}

// ============================================================================
// GRANTS, REGISTRATIONS, NAMESPACES
// ============================================================================

/// A single granted scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeGrant {
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_date: Option<String>,
}

/// Scopes a user granted to an application for one API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGrant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub api_id: String,
    #[serde(default)]
    pub grants: Vec<ScopeGrant>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Registration of a user in a pool, optionally within a namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub pool_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// All registrations of one user, grouped by pool id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRegistrations {
    pub pools: std::collections::BTreeMap<String, Vec<Registration>>,
}

/// Entry of a pool registration index file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolIndexEntry {
    pub pool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub user_id: String,
}

/// A namespace inside a registration pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub pool_id: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub extra: JsonMap,
}

// ============================================================================
// VERIFICATIONS, WEBHOOKS, AUDIT LOG, ACCESS TOKENS
// ============================================================================

/// Pending email verification or password reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub user_id: String,
    /// Creation time in epoch seconds.
    #[serde(default)]
    pub utc: i64,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Registered webhook listener.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookListener {
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Event queued for a webhook listener.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_id: Option<String>,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub entity: String,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub data: JsonValue,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Audit log record. Listing rows carry projected columns in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub entity: String,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub data: JsonValue,
    #[serde(rename = "created_at", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// OAuth access token record. Field names follow the token store wire format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated_userid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users_id: Option<String>,
    /// Expiry of the access token in epoch millis.
    pub expires: i64,
    /// Expiry of the refresh token in epoch millis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_refresh: Option<i64>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_keeps_unknown_properties() {
        let raw = json!({
            "id": "u1",
            "email": "a@b.c",
            "firstName": "Ada",
            "lastName": "Lovelace",
            "applications": [{"id": "app1"}]
        });
        let user: User = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(user.first_name(), Some("Ada"));
        assert_eq!(user.applications, vec![IdRef { id: "app1".into() }]);
        assert_eq!(serde_json::to_value(&user).unwrap(), raw);
    }

    #[test]
    fn test_client_type_wire_names() {
        assert_eq!(
            serde_json::to_value(ClientType::PublicSpa).unwrap(),
            json!("public_spa")
        );
        let ct: ClientType = serde_json::from_value(json!("public_native")).unwrap();
        assert_eq!(ct, ClientType::PublicNative);
    }

    #[test]
    fn test_verification_type_field() {
        let v: Verification = serde_json::from_value(json!({
            "id": "v1", "type": "email", "email": "x@y.z", "userId": "u1", "utc": 1000
        }))
        .unwrap();
        assert_eq!(v.kind, "email");
        assert_eq!(serde_json::to_value(&v).unwrap()["type"], json!("email"));
    }

    #[test]
    fn test_access_token_snake_case() {
        let t = AccessToken {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires: 5,
            ..Default::default()
        };
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v["access_token"], json!("at"));
        assert_eq!(v["refresh_token"], json!("rt"));
        assert!(v.get("users_id").is_none());
    }

    #[test]
    fn test_approval_without_id_deserializes() {
        let a: Approval = serde_json::from_value(json!({
            "subscriptionId": "s1",
            "application": {"id": "app", "name": "App"},
            "api": {"id": "petstore"}
        }))
        .unwrap();
        assert!(a.id.is_empty());
        assert_eq!(a.application.extra["name"], json!("App"));
    }
}
