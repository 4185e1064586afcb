//! Declarative mapping of entities onto tables.
//!
//! Every table has an `id` primary key and a `data jsonb` column. Properties
//! listed here are promoted to their own indexed columns; everything else
//! lives in `data`.

use std::fmt;

/// Storage type of a promoted column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    BigInt,
}

/// A promoted column and the JSON property it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub property: &'static str,
    pub optional: bool,
    pub kind: ColumnKind,
}

impl Column {
    const fn text(name: &'static str, property: &'static str) -> Self {
        Self {
            name,
            property,
            optional: false,
            kind: ColumnKind::Text,
        }
    }

    const fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    const fn bigint(mut self) -> Self {
        self.kind = ColumnKind::BigInt;
        self
    }
}

/// Tables of the `wicked` schema holding entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Users,
    Applications,
    Owners,
    Subscriptions,
    Verifications,
    Approvals,
    WebhookListeners,
    WebhookEvents,
    Registrations,
    Grants,
    Namespaces,
    AuditLog,
    AccessTokens,
}

const USERS: &[Column] = &[
    Column::text("custom_id", "customId").optional(),
    Column::text("email", "email"),
];

const OWNERS: &[Column] = &[
    Column::text("users_id", "userId"),
    Column::text("applications_id", "appId"),
];

const SUBSCRIPTIONS: &[Column] = &[
    Column::text("applications_id", "application"),
    Column::text("plan_id", "plan"),
    Column::text("api_id", "api"),
    Column::text("client_id", "clientId").optional(),
    Column::text("api_group", "apiGroup").optional(),
];

const VERIFICATIONS: &[Column] = &[Column::text("users_id", "userId")];

const APPROVALS: &[Column] = &[Column::text("subscriptions_id", "subscriptionId")];

const WEBHOOK_EVENTS: &[Column] = &[Column::text("webhook_listeners_id", "listenerId")];

const REGISTRATIONS: &[Column] = &[
    Column::text("pool_id", "poolId"),
    Column::text("users_id", "userId"),
    Column::text("namespace", "namespace").optional(),
    Column::text("name", "name"),
];

const GRANTS: &[Column] = &[
    Column::text("users_id", "userId"),
    Column::text("application_id", "applicationId"),
    Column::text("api_id", "apiId"),
];

const NAMESPACES: &[Column] = &[
    Column::text("pool_id", "poolId"),
    Column::text("namespace", "namespace"),
    Column::text("description", "description"),
];

const ACCESS_TOKENS: &[Column] = &[
    Column::text("access_token", "access_token"),
    Column::text("refresh_token", "refresh_token").optional(),
    Column::text("authenticated_userid", "authenticated_userid").optional(),
    Column::text("users_id", "users_id").optional(),
    Column::text("expires", "expires").bigint(),
    Column::text("expires_refresh", "expires_refresh").bigint().optional(),
];

impl Entity {
    pub const ALL: [Entity; 13] = [
        Entity::Users,
        Entity::Applications,
        Entity::Owners,
        Entity::Subscriptions,
        Entity::Verifications,
        Entity::Approvals,
        Entity::WebhookListeners,
        Entity::WebhookEvents,
        Entity::Registrations,
        Entity::Grants,
        Entity::Namespaces,
        Entity::AuditLog,
        Entity::AccessTokens,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Entity::Users => "users",
            Entity::Applications => "applications",
            Entity::Owners => "owners",
            Entity::Subscriptions => "subscriptions",
            Entity::Verifications => "verifications",
            Entity::Approvals => "approvals",
            Entity::WebhookListeners => "webhook_listeners",
            Entity::WebhookEvents => "webhook_events",
            Entity::Registrations => "registrations",
            Entity::Grants => "grants",
            Entity::Namespaces => "namespaces",
            Entity::AuditLog => "audit_log",
            Entity::AccessTokens => "access_tokens",
        }
    }

    /// Promoted columns, in table order.
    pub fn columns(&self) -> &'static [Column] {
        match self {
            Entity::Users => USERS,
            Entity::Owners => OWNERS,
            Entity::Subscriptions => SUBSCRIPTIONS,
            Entity::Verifications => VERIFICATIONS,
            Entity::Approvals => APPROVALS,
            Entity::WebhookEvents => WEBHOOK_EVENTS,
            Entity::Registrations => REGISTRATIONS,
            Entity::Grants => GRANTS,
            Entity::Namespaces => NAMESPACES,
            Entity::AccessTokens => ACCESS_TOKENS,
            Entity::Applications | Entity::WebhookListeners | Entity::AuditLog => &[],
        }
    }

    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.columns().iter().find(|c| c.name == name)
    }

    pub fn column_for_property(&self, property: &str) -> Option<&'static Column> {
        self.columns().iter().find(|c| c.property == property)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}
