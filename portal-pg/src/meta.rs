//! Metadata, schema migrations and wiping of the relational store.

use crate::engine::PgEngine;
use crate::error::DbResultExt;
use crate::sql::split_sql_commands;
use ::async_trait::async_trait;
use portal_core::{DaoError, DaoOptions, DaoResult, InitCheck, MetaDao};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

/// Schema version this build expects.
pub const CURRENT_DATABASE_VERSION: i64 = 3;

/// Migration scripts; entry `n - 1` upgrades version `n - 1` to `n`.
const MIGRATIONS: [&str; CURRENT_DATABASE_VERSION as usize] = [
    include_str!("../schemas/migration-1.sql"),
    include_str!("../schemas/migration-2.sql"),
    include_str!("../schemas/migration-3.sql"),
];

/// Version that adds `subscriptions.api_group`.
const API_GROUP_VERSION: i64 = 3;

fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Relational metadata and lifecycle.
#[derive(Debug, Clone)]
pub struct PgMeta {
    engine: PgEngine,
    options: DaoOptions,
}

impl PgMeta {
    pub fn new(engine: PgEngine, options: DaoOptions) -> Self {
        Self { engine, options }
    }

    /// Current schema version; the first call bootstraps the database.
    pub async fn database_version(&self) -> DaoResult<i64> {
        Ok(self
            .engine
            .get_metadata(None)
            .await?
            .get("version")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0))
    }

    /// Upgrade the schema step by step to [`CURRENT_DATABASE_VERSION`].
    ///
    /// Each step runs its script and records the new version in one
    /// transaction, so a failed step leaves the previous version in place.
    pub async fn run_migrations(&self) -> DaoResult<()> {
        let version = self.database_version().await?;
        debug!(version, "current database version");
        if version >= CURRENT_DATABASE_VERSION {
            debug!("no migrations needed");
            return Ok(());
        }
        debug!(desired = CURRENT_DATABASE_VERSION, "running migrations");

        for step in (version + 1)..=CURRENT_DATABASE_VERSION {
            let commands = split_sql_commands(MIGRATIONS[(step - 1) as usize]);
            let engine = self.engine.clone();
            self.engine
                .with_transaction(move |tx| {
                    Box::pin(async move {
                        for command in &commands {
                            debug!(%command, step, "migration");
                            tx.batch_execute(command).await.db()?;
                        }
                        let mut metadata = engine.get_metadata(Some(tx)).await?;
                        metadata.insert("version".to_string(), JsonValue::from(step));
                        engine.set_metadata(metadata, Some(tx)).await
                    })
                })
                .await
                .map_err(|e| {
                    warn!(step, error = %e, "migration failed");
                    e
                })?;
            info!(step, "applied database migration");

            if step == API_GROUP_VERSION {
                self.populate_subscription_api_groups().await?;
            }
        }
        debug!("migrations finished");
        Ok(())
    }

    async fn populate_subscription_api_groups(&self) -> DaoResult<()> {
        if self.options.migration_mode {
            info!("skipping api group population in migration mode");
            return Ok(());
        }
        for (api_id, group) in &self.options.api_groups {
            let updated = self
                .engine
                .populate_subscription_api_group(api_id, group)
                .await?;
            debug!(api_id, group, updated, "populated subscription api group");
        }
        Ok(())
    }
}

#[async_trait]
impl MetaDao for PgMeta {
    fn init_checks(&self) -> Vec<InitCheck> {
        vec![InitCheck::RunMigrations]
    }

    async fn run_init_check(&self, check: InitCheck) -> DaoResult<()> {
        match check {
            InitCheck::RunMigrations => self.run_migrations().await,
            other => Err(DaoError::internal(format!(
                "init check {:?} does not apply to the postgres backend",
                other
            ))),
        }
    }

    async fn wipe(&self) -> DaoResult<()> {
        debug!("wipe");
        self.engine.drop_database().await
    }

    fn is_legacy_data(&self) -> bool {
        false
    }

    async fn get_metadata(&self, property: &str) -> DaoResult<Option<JsonValue>> {
        debug!(property, "get_metadata");
        Ok(self.engine.get_metadata(None).await?.remove(property))
    }

    async fn set_metadata(&self, property: &str, value: Option<JsonValue>) -> DaoResult<()> {
        debug!(property, "set_metadata");
        let engine = self.engine.clone();
        let property = property.to_string();
        let value = value.filter(|v| !is_empty_value(v));
        self.engine
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let mut metadata = engine.get_metadata(Some(tx)).await?;
                    match value {
                        Some(v) => {
                            metadata.insert(property, v);
                        }
                        None => {
                            metadata.remove(&property);
                        }
                    }
                    engine.set_metadata(metadata, Some(tx)).await
                })
            })
            .await
    }
}
