//! Per-entity logic of the document store.

pub mod applications;
pub mod approvals;
pub mod grants;
pub mod namespaces;
pub mod registrations;
pub mod subscriptions;
pub mod unsupported;
pub mod users;
pub mod verifications;
pub mod webhooks;

pub use applications::JsonApplications;
pub use approvals::JsonApprovals;
pub use grants::JsonGrants;
pub use namespaces::JsonNamespaces;
pub use registrations::JsonRegistrations;
pub use subscriptions::JsonSubscriptions;
pub use unsupported::{JsonAccessTokens, JsonAuditLog};
pub use users::JsonUsers;
pub use verifications::JsonVerifications;
pub use webhooks::JsonWebhooks;
