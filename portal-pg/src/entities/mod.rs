//! Per-entity adapters over the query engine.

pub mod access_tokens;
pub mod applications;
pub mod approvals;
pub mod audit_log;
pub mod grants;
pub mod namespaces;
pub mod registrations;
pub mod subscriptions;
pub mod users;
pub mod verifications;
pub mod webhooks;

pub use access_tokens::PgAccessTokens;
pub use applications::PgApplications;
pub use approvals::PgApprovals;
pub use audit_log::PgAuditLog;
pub use grants::PgGrants;
pub use namespaces::PgNamespaces;
pub use registrations::PgRegistrations;
pub use subscriptions::PgSubscriptions;
pub use users::PgUsers;
pub use verifications::PgVerifications;
pub use webhooks::PgWebhooks;

use portal_core::{IdRef, JsonMap, Page};
use serde_json::Value as JsonValue;

/// Id-only projection of a page of rows, used by the `get_index` operations.
pub(crate) fn id_page(page: Page<JsonMap>) -> Page<IdRef> {
    page.map(|row| IdRef {
        id: row
            .get("id")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}
