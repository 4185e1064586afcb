//! Portal DAO Core
//!
//! Shared vocabulary of the portal data-access layer:
//! - entity types with round-trip safe extra properties
//! - the `DaoError` taxonomy with HTTP-analog status codes
//! - the `PortalDao` capability traits implemented by every backend
//! - list queries, pages and in-memory filtering
//! - helpers for grants, credentials and application data

pub mod dao;
pub mod entities;
pub mod error;
pub mod options;
pub mod query;
pub mod utils;

pub use dao::*;
pub use entities::*;
pub use error::{DaoError, DaoResult};
pub use options::DaoOptions;
pub use query::{filter_and_page, page_slice, CountResult, FilterValue, ListQuery, OrderBy, Page};
pub use utils::{
    create_random_id, make_name, merge_grant_data, migrate_application_data, normalize_new_application,
    now_iso, now_millis, now_utc_secs, stamp_change, CredentialCipher,
};
