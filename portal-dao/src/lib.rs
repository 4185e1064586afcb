//! Portal DAO
//!
//! Entry point for services using the portal data-access layer:
//! - `DaoConfig`, the tagged choice between the JSON and Postgres backends
//! - `open_dao`, which builds a backend and runs its init checks
//! - the migration pipeline copying data between backends

pub mod config;
pub mod migration;

pub use config::DaoConfig;
pub use migration::{
    CustomIdMappings, MigrationConfig, MigrationError, MigrationSummary, MigrationWarning,
    Migrator, Severity,
};
pub use portal_core::{DaoError, DaoOptions, DaoResult, PortalDao};

use portal_json::JsonDao;
use portal_pg::PgDao;
use std::sync::Arc;
use tracing::info;

/// Open the configured backend, ready for use.
pub async fn open_dao(config: &DaoConfig, options: DaoOptions) -> DaoResult<Arc<dyn PortalDao>> {
    let dao: Arc<dyn PortalDao> = match config {
        DaoConfig::Json(json) => Arc::new(JsonDao::open(json, options).await?),
        DaoConfig::Postgres(pg) => Arc::new(PgDao::open(pg.clone(), options).await?),
    };
    info!(backend = dao.backend(), "DAO opened");
    Ok(dao)
}

/// Open the backend named by `PORTAL_DAO_TYPE`, with options from the
/// environment.
pub async fn open_dao_from_env() -> DaoResult<Arc<dyn PortalDao>> {
    let config = DaoConfig::from_env()?;
    open_dao(&config, DaoOptions::from_env()?).await
}
