//! Generic query and upsert engine over the connection pool.
//!
//! The pool is created lazily on first use. Creating it runs the bootstrap
//! sequence: connect with retries, create the database if it is missing,
//! and install the core schema into an empty database. A maintenance task
//! then purges the count cache and closes idle connections until
//! [`PgEngine::shutdown`] is called.

use crate::config::{PgConfig, MAINTENANCE_DATABASE};
use crate::count_cache::{CountCache, COUNT_CACHE_PURGE_INTERVAL};
use crate::error::{DbResultExt, PgError};
use crate::model::Entity;
use crate::notify::{ChannelListener, NotificationSink};
use crate::rows::{normalize_row, postgresize_row};
use crate::sql::{
    count_cache_key, is_identifier, make_count, make_delete, make_delete_before, make_sql_query,
    make_upsert, param_refs, split_sql_commands, Criteria, Join, SelectShape, SqlParam, SCHEMA,
};
use ::async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use futures_util::future::BoxFuture;
use portal_core::{now_iso, CountResult, DaoError, DaoResult, JsonMap, ListQuery, Page};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row, Transaction};
use tracing::{debug, error, info, warn};

/// Core schema installed into an empty database.
const CORE_SCHEMA: &str = include_str!("../schemas/core.sql");

// ============================================================================
// EXECUTORS
// ============================================================================

/// Something statements can run on: a pooled client or an open transaction.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn query_rows(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, tokio_postgres::Error>;

    async fn execute_sql(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, tokio_postgres::Error>;

    async fn batch(&self, sql: &str) -> Result<(), tokio_postgres::Error>;
}

#[async_trait]
impl Executor for tokio_postgres::Client {
    async fn query_rows(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, tokio_postgres::Error> {
        self.query(sql, params).await
    }

    async fn execute_sql(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, tokio_postgres::Error> {
        self.execute(sql, params).await
    }

    async fn batch(&self, sql: &str) -> Result<(), tokio_postgres::Error> {
        self.batch_execute(sql).await
    }
}

#[async_trait]
impl<'a> Executor for Transaction<'a> {
    async fn query_rows(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, tokio_postgres::Error> {
        self.query(sql, params).await
    }

    async fn execute_sql(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, tokio_postgres::Error> {
        self.execute(sql, params).await
    }

    async fn batch(&self, sql: &str) -> Result<(), tokio_postgres::Error> {
        self.batch_execute(sql).await
    }
}

// ============================================================================
// OPTIONS & CONVERSION
// ============================================================================

/// Paging, ordering and join options of [`PgEngine::get_by`].
#[derive(Clone, Copy, Default)]
pub struct QueryOptions<'a> {
    pub offset: usize,
    /// Zero means no limit.
    pub limit: usize,
    pub order_by: Option<&'a str>,
    pub no_count_cache: bool,
    pub join: Option<&'a Join>,
    /// Run inside this transaction instead of on a pooled connection.
    pub client: Option<&'a dyn Executor>,
}

impl<'a> QueryOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paging and ordering of a list query, falling back to `default_order`.
    pub fn from_list(query: &'a ListQuery, default_order: Option<&'a str>) -> Self {
        let order_by = match query.order_by.as_deref() {
            Some(o) if !o.trim().is_empty() => Some(o),
            _ => default_order,
        };
        Self {
            offset: query.offset,
            limit: query.limit,
            order_by,
            no_count_cache: query.no_count_cache,
            ..Self::default()
        }
    }

    pub fn paged(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            ..Self::default()
        }
    }

    pub fn ordered(mut self, order_by: &'a str) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn joined(mut self, join: &'a Join) -> Self {
        self.join = Some(join);
        self
    }

    pub fn uncached(mut self) -> Self {
        self.no_count_cache = true;
        self
    }

    pub fn with_client(mut self, client: Option<&'a dyn Executor>) -> Self {
        self.client = client;
        self
    }
}

/// Deserialize a normalized row into an entity.
pub fn decode<T: DeserializeOwned>(row: JsonMap) -> DaoResult<T> {
    Ok(serde_json::from_value(JsonValue::Object(row))?)
}

pub fn decode_page<T: DeserializeOwned>(page: Page<JsonMap>) -> DaoResult<Page<T>> {
    let rows = page
        .rows
        .into_iter()
        .map(decode)
        .collect::<DaoResult<Vec<T>>>()?;
    Ok(Page {
        rows,
        count: page.count,
    })
}

/// Rename projected columns to their property aliases.
fn apply_aliases(row: &mut JsonMap, join: &Join) {
    for field in join.fields {
        if let (Some(as_name), Some(alias)) = (field.as_name, field.alias) {
            if as_name != alias {
                if let Some(value) = row.remove(as_name) {
                    row.insert(alias.to_string(), value);
                }
            }
        }
    }
}

/// Serialize an entity into the JSON handed to [`PgEngine::upsert`].
pub fn encode<T: Serialize>(entity: &T) -> DaoResult<JsonMap> {
    match serde_json::to_value(entity)? {
        JsonValue::Object(map) => Ok(map),
        other => Err(DaoError::internal(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

// ============================================================================
// ENGINE
// ============================================================================

struct Maintenance {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct EngineInner {
    config: PgConfig,
    pool: OnceCell<Pool>,
    count_cache: Arc<CountCache>,
    maintenance: Mutex<Option<Maintenance>>,
    listener: Mutex<Option<ChannelListener>>,
}

/// Query and upsert engine shared by all relational entities.
#[derive(Clone)]
pub struct PgEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for PgEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgEngine")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("database", &self.inner.config.database)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl PgEngine {
    /// Create the engine without connecting.
    pub fn new(config: PgConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                pool: OnceCell::new(),
                count_cache: Arc::new(CountCache::default()),
                maintenance: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PgConfig {
        &self.inner.config
    }

    pub fn count_cache(&self) -> &CountCache {
        &self.inner.count_cache
    }

    pub fn is_connected(&self) -> bool {
        self.inner.pool.initialized()
    }

    /// The connection pool, bootstrapping it on first use.
    pub async fn pool(&self) -> DaoResult<&Pool> {
        self.inner.pool.get_or_try_init(|| self.bootstrap()).await
    }

    async fn connection(&self) -> DaoResult<Object> {
        self.pool().await?.get().await.db()
    }

    /// Make sure the database is reachable and initialized.
    pub async fn try_connect_to_database(&self) -> DaoResult<()> {
        self.pool().await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    async fn bootstrap(&self) -> DaoResult<Pool> {
        let config = &self.inner.config;
        let mut database_created = false;
        let mut attempt: u32 = 0;
        loop {
            debug!(host = %config.host, port = config.port, database = %config.database, "creating postgres pool");
            let pool = config.create_pool().map_err(DaoError::from)?;
            let err = match pool.get().await {
                Ok(conn) => {
                    drop(conn);
                    self.ensure_schema(&pool).await?;
                    self.start_maintenance(pool.clone()).await;
                    return Ok(pool);
                }
                Err(e) => PgError::from(e),
            };
            pool.close();

            if !database_created && err.is_missing_database() {
                warn!(database = %config.database, "database not found, creating it");
                self.create_database().await?;
                database_created = true;
                continue;
            }
            if err.is_transient() && attempt + 1 < config.tuning.connect_retries {
                attempt += 1;
                error!(
                    attempt,
                    host = %config.host,
                    port = config.port,
                    user = %config.user,
                    error = %err,
                    "Could not connect to Postgres, will retry"
                );
                tokio::time::sleep(config.tuning.connect_delay).await;
                continue;
            }
            if err.is_transient() {
                error!("Reached maximum tries to connect to Postgres. Failing.");
            }
            return Err(err.into());
        }
    }

    /// Open a connection to the maintenance database outside the pool.
    async fn maintenance_client(&self) -> DaoResult<tokio_postgres::Client> {
        let (client, connection) = self
            .inner
            .config
            .connect_config(MAINTENANCE_DATABASE)
            .connect(NoTls)
            .await
            .db()?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "maintenance connection closed with error");
            }
        });
        Ok(client)
    }

    fn database_identifier(&self) -> DaoResult<&str> {
        let database = self.inner.config.database.as_str();
        if is_identifier(database) {
            Ok(database)
        } else {
            Err(DaoError::config(format!("Invalid database name '{}'", database)))
        }
    }

    async fn create_database(&self) -> DaoResult<()> {
        let database = self.database_identifier()?;
        let client = self.maintenance_client().await?;
        info!(database, "Creating database");
        client
            .batch_execute(&format!("CREATE DATABASE \"{}\";", database))
            .await
            .db()
    }

    /// Drop the configured database. Refused once the pool exists.
    pub async fn drop_database(&self) -> DaoResult<()> {
        if self.is_connected() {
            return Err(DaoError::internal(
                "Cannot wipe database when already connected.",
            ));
        }
        let database = self.database_identifier()?;
        let client = self.maintenance_client().await?;
        warn!(database, "Dropping database");
        client
            .batch_execute(&format!("DROP DATABASE IF EXISTS \"{}\";", database))
            .await
            .db()
    }

    async fn ensure_schema(&self, pool: &Pool) -> DaoResult<()> {
        let mut conn = pool.get().await.db()?;
        let rows = conn
            .query(
                "SELECT schema_name FROM information_schema.schemata WHERE schema_name = $1",
                &[&SCHEMA],
            )
            .await
            .db()?;
        if !rows.is_empty() {
            info!(schema = SCHEMA, "Found configured database and schema");
            return Ok(());
        }

        warn!(schema = SCHEMA, "Database has no portal schema, creating it");
        let client: &mut tokio_postgres::Client = &mut conn;
        let tx = client.transaction().await.db()?;
        for command in split_sql_commands(CORE_SCHEMA) {
            debug!(%command, "core schema");
            tx.batch_execute(&command).await.db()?;
        }
        let now = now_iso();
        let metadata = serde_json::json!({
            "version": 0,
            "create_date": now,
            "last_update": now,
        });
        tx.execute(
            "INSERT INTO wicked.meta (id, data) VALUES ($1, $2)",
            &[&1i64, &metadata],
        )
        .await
        .db()?;
        tx.commit().await.db()?;
        info!(schema = SCHEMA, "Created schema");
        Ok(())
    }

    async fn start_maintenance(&self, pool: Pool) {
        let (shutdown, mut rx) = watch::channel(false);
        let cache = self.inner.count_cache.clone();
        let idle_timeout = self.inner.config.tuning.idle_timeout;

        let handle = tokio::spawn(async move {
            let mut tick = interval(COUNT_CACHE_PURGE_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!("postgres maintenance task started");
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        cache.purge();
                        let closed = pool.retain(|_, metrics| metrics.last_used() < idle_timeout);
                        if !closed.removed.is_empty() {
                            debug!(closed = closed.removed.len(), "closed idle postgres connections");
                        }
                    }
                }
            }
            debug!("postgres maintenance task stopped");
        });

        *self.inner.maintenance.lock().await = Some(Maintenance { shutdown, handle });
    }

    /// Stop background tasks and close the pool.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.maintenance.lock().await.take() {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "maintenance task ended abnormally");
            }
        }
        if let Some(listener) = self.inner.listener.lock().await.take() {
            listener.stop();
        }
        if let Some(pool) = self.inner.pool.get() {
            pool.close();
        }
        info!("postgres engine shut down");
    }

    // ------------------------------------------------------------------
    // Transactions & scripts
    // ------------------------------------------------------------------

    /// Run `f` inside a transaction on a dedicated connection.
    ///
    /// Commits when `f` succeeds and rolls back when it fails. The
    /// connection returns to the pool on every path.
    pub async fn with_transaction<T, F>(&self, f: F) -> DaoResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t Transaction<'t>) -> BoxFuture<'t, DaoResult<T>> + Send,
    {
        let mut conn = self.connection().await?;
        let client: &mut tokio_postgres::Client = &mut conn;
        let tx = client.transaction().await.db()?;
        debug!("transaction started");
        match f(&tx).await {
            Ok(value) => {
                tx.commit().await.db()?;
                debug!("transaction committed");
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "transaction payload failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "ROLLBACK returned another error");
                }
                Err(e)
            }
        }
    }

    /// Run every statement of `script` in one transaction.
    pub async fn run_sql_script(&self, script: &str) -> DaoResult<()> {
        let commands = split_sql_commands(script);
        debug!(commands = commands.len(), "run_sql_script");
        self.with_transaction(move |tx| {
            Box::pin(async move {
                for command in &commands {
                    debug!(%command, "sql");
                    tx.batch_execute(command).await.db()?;
                }
                Ok(())
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Rows matching `criteria`, with the total count before paging.
    pub async fn get_by(
        &self,
        entity: Entity,
        criteria: &Criteria,
        options: &QueryOptions<'_>,
    ) -> DaoResult<Page<JsonMap>> {
        debug!(%entity, fields = ?criteria.fields, "get_by");
        let shape = SelectShape {
            order_by: options.order_by,
            offset: options.offset,
            limit: options.limit,
            join: options.join,
        };
        let sql = make_sql_query(entity, &criteria.fields, &criteria.ops, &shape)?;

        let pooled;
        let exec: &dyn Executor = match options.client {
            Some(client) => client,
            None => {
                pooled = self.connection().await?;
                let client: &tokio_postgres::Client = &pooled;
                client
            }
        };
        let params = param_refs(&criteria.values);
        let (mut rows, count) = tokio::try_join!(
            self.query_entities(exec, entity, &sql.query, &params),
            self.query_count(
                exec,
                &sql.count_query,
                &criteria.values,
                &params,
                options.no_count_cache
            ),
        )?;
        if let Some(join) = options.join {
            rows.iter_mut().for_each(|row| apply_aliases(row, join));
        }
        Ok(Page { rows, count })
    }

    /// Typed variant of [`get_by`](Self::get_by).
    pub async fn get_page<T: DeserializeOwned>(
        &self,
        entity: Entity,
        criteria: &Criteria,
        options: &QueryOptions<'_>,
    ) -> DaoResult<Page<T>> {
        decode_page(self.get_by(entity, criteria, options).await?)
    }

    /// At most one row; more than one match is an invariant violation.
    pub async fn get_single_by(
        &self,
        entity: Entity,
        criteria: &Criteria,
        client: Option<&dyn Executor>,
    ) -> DaoResult<Option<JsonMap>> {
        let options = QueryOptions::new().with_client(client);
        let mut page = self.get_by(entity, criteria, &options).await?;
        match page.rows.len() {
            0 => Ok(None),
            1 => Ok(page.rows.pop()),
            n => Err(DaoError::internal(format!(
                "pgUtils: getSingleBy: Returned {} results, must only return a single result.",
                n
            ))),
        }
    }

    pub async fn get_single<T: DeserializeOwned>(
        &self,
        entity: Entity,
        criteria: &Criteria,
        client: Option<&dyn Executor>,
    ) -> DaoResult<Option<T>> {
        self.get_single_by(entity, criteria, client)
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn get_by_id(
        &self,
        entity: Entity,
        id: &str,
        client: Option<&dyn Executor>,
    ) -> DaoResult<Option<JsonMap>> {
        self.get_single_by(entity, &Criteria::by("id", id), client)
            .await
    }

    async fn query_entities(
        &self,
        exec: &dyn Executor,
        entity: Entity,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> DaoResult<Vec<JsonMap>> {
        let rows = exec.query_rows(sql, params).await.db()?;
        rows.iter()
            .map(|row| {
                normalize_row(entity, row).map_err(|e| {
                    error!(%entity, query = sql, error = %e, "normalizeResult failed");
                    e
                })
            })
            .collect()
    }

    async fn query_count(
        &self,
        exec: &dyn Executor,
        count_query: &str,
        values: &[SqlParam],
        params: &[&(dyn ToSql + Sync)],
        no_cache: bool,
    ) -> DaoResult<CountResult> {
        let key = count_cache_key(count_query, values);
        if !no_cache {
            if let Some(count) = self.inner.count_cache.get(&key) {
                debug!("count cache hit");
                return Ok(CountResult {
                    count,
                    cached: true,
                });
            }
        }
        let rows = exec.query_rows(count_query, params).await.db()?;
        if rows.len() != 1 {
            return Err(DaoError::internal(
                "countRows: SELECT COUNT(*) did not return a single row.",
            ));
        }
        let count: i64 = rows[0].try_get("count").db()?;
        self.inner.count_cache.put(key, count);
        Ok(CountResult {
            count,
            cached: false,
        })
    }

    /// Row count of a whole table.
    pub async fn count(&self, entity: Entity, client: Option<&dyn Executor>) -> DaoResult<i64> {
        debug!(%entity, "count");
        let pooled;
        let exec: &dyn Executor = match client {
            Some(client) => client,
            None => {
                pooled = self.connection().await?;
                let client: &tokio_postgres::Client = &pooled;
                client
            }
        };
        let rows = exec.query_rows(&make_count(entity), &[]).await.db()?;
        if rows.len() != 1 {
            return Err(DaoError::internal(
                "countRows: SELECT COUNT(*) did not return a single row.",
            ));
        }
        rows[0].try_get::<_, i64>("count").db()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    async fn execute(
        &self,
        sql: &str,
        params: &[SqlParam],
        client: Option<&dyn Executor>,
    ) -> DaoResult<u64> {
        let refs = param_refs(params);
        match client {
            Some(client) => client.execute_sql(sql, &refs).await.db(),
            None => {
                let conn = self.connection().await?;
                conn.execute(sql, &refs).await.db()
            }
        }
    }

    /// Insert or update the row of `data["id"]`.
    pub async fn upsert(
        &self,
        entity: Entity,
        data: JsonMap,
        upserting_user_id: Option<&str>,
        client: Option<&dyn Executor>,
    ) -> DaoResult<()> {
        debug!(%entity, "upsert");
        let row = postgresize_row(entity, data, upserting_user_id)?;
        let sql = make_upsert(entity);
        self.execute(&sql, &row.into_params(), client).await?;
        debug!(%entity, "upsert finished successfully");
        Ok(())
    }

    /// Serialize `value` and upsert it.
    pub async fn upsert_entity<T: Serialize + Sync>(
        &self,
        entity: Entity,
        value: &T,
        upserting_user_id: Option<&str>,
        client: Option<&dyn Executor>,
    ) -> DaoResult<()> {
        self.upsert(entity, encode(value)?, upserting_user_id, client)
            .await
    }

    /// Delete rows matching every criterion by equality.
    pub async fn delete_by(
        &self,
        entity: Entity,
        criteria: &Criteria,
        client: Option<&dyn Executor>,
    ) -> DaoResult<u64> {
        debug!(%entity, fields = ?criteria.fields, "delete_by");
        let sql = make_delete(entity, &criteria.fields)?;
        self.execute(&sql, &criteria.values, client).await
    }

    pub async fn delete_by_id(
        &self,
        entity: Entity,
        id: &str,
        client: Option<&dyn Executor>,
    ) -> DaoResult<u64> {
        self.delete_by(entity, &Criteria::by("id", id), client).await
    }

    /// Delete rows whose `field` lies before `value`.
    pub async fn delete_before(
        &self,
        entity: Entity,
        field: &str,
        value: SqlParam,
        client: Option<&dyn Executor>,
    ) -> DaoResult<u64> {
        debug!(%entity, field, "delete_before");
        let sql = make_delete_before(entity, field, None)?;
        self.execute(&sql, &[value], client).await
    }

    /// Like [`delete_before`](Self::delete_before), narrowed by a fixed
    /// extra condition.
    pub async fn delete_expired(
        &self,
        entity: Entity,
        field: &str,
        value: SqlParam,
        additional_condition: &'static str,
        client: Option<&dyn Executor>,
    ) -> DaoResult<u64> {
        debug!(%entity, field, additional_condition, "delete_expired");
        if additional_condition.trim().is_empty() {
            return Err(DaoError::internal(
                "deleteExpired: additionalCondition is empty; use deleteBefore instead if on purpose",
            ));
        }
        let sql = make_delete_before(entity, field, Some(additional_condition))?;
        self.execute(&sql, &[value], client).await
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    pub async fn get_metadata(&self, client: Option<&dyn Executor>) -> DaoResult<JsonMap> {
        debug!("get_metadata");
        let pooled;
        let exec: &dyn Executor = match client {
            Some(client) => client,
            None => {
                pooled = self.connection().await?;
                let client: &tokio_postgres::Client = &pooled;
                client
            }
        };
        let rows = exec
            .query_rows("SELECT data FROM wicked.meta WHERE id = 1", &[])
            .await
            .db()?;
        if rows.len() != 1 {
            return Err(DaoError::internal(format!(
                "getMetadata: Unexpected row count {}",
                rows.len()
            )));
        }
        match rows[0].try_get::<_, JsonValue>("data").db()? {
            JsonValue::Object(map) => Ok(map),
            _ => Ok(JsonMap::new()),
        }
    }

    /// Store the metadata document, stamping `create_date` and `last_update`.
    pub async fn set_metadata(
        &self,
        mut metadata: JsonMap,
        client: Option<&dyn Executor>,
    ) -> DaoResult<()> {
        debug!("set_metadata");
        let now = now_iso();
        let has_create_date = metadata
            .get("create_date")
            .map(|v| !v.is_null())
            .unwrap_or(false);
        if !has_create_date {
            metadata.insert("create_date".to_string(), JsonValue::String(now.clone()));
        }
        metadata.insert("last_update".to_string(), JsonValue::String(now));
        self.execute(
            "UPDATE wicked.meta SET data = $1 WHERE id = 1",
            &[SqlParam::Json(JsonValue::Object(metadata))],
            client,
        )
        .await
        .map(|_| ())
    }

    /// Copy the required user group of `api_id` onto its subscriptions.
    pub async fn populate_subscription_api_group(&self, api_id: &str, group: &str) -> DaoResult<u64> {
        debug!(api_id, group, "populate_subscription_api_group");
        self.execute(
            "UPDATE wicked.subscriptions SET api_group = $2 WHERE api_id = $1",
            &[SqlParam::from(api_id), SqlParam::from(group)],
            None,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Deliver notifications on `channel` to `sink`.
    ///
    /// All channels share one dedicated connection outside the pool; a
    /// second registration on the same channel replaces the first sink.
    pub async fn listen_to_channel(&self, channel: &str, sink: NotificationSink) -> DaoResult<()> {
        if !is_identifier(channel) {
            return Err(DaoError::config(format!("Invalid channel name '{}'", channel)));
        }
        let mut guard = self.inner.listener.lock().await;
        if guard.is_none() {
            debug!("setting up notification listener connection");
            let listener =
                ChannelListener::connect(self.inner.config.connect_config(&self.inner.config.database))
                    .await?;
            *guard = Some(listener);
        }
        match guard.as_ref() {
            Some(listener) => listener.listen(channel, sink).await,
            None => Err(DaoError::internal("notification listener is not available")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_core::FilterValue;

    #[test]
    fn test_query_options_from_list() {
        let query = ListQuery::paged(4, 2);
        let options = QueryOptions::from_list(&query, Some("created_at DESC"));
        assert_eq!(options.offset, 4);
        assert_eq!(options.limit, 2);
        assert_eq!(options.order_by, Some("created_at DESC"));

        let query = ListQuery::new().with_order("name ASC");
        let options = QueryOptions::from_list(&query, Some("id ASC"));
        assert_eq!(options.order_by, Some("name ASC"));
    }

    #[test]
    fn test_encode_decode_entities() {
        let app = portal_core::Application {
            id: "app".into(),
            name: "App".into(),
            ..Default::default()
        };
        let map = encode(&app).unwrap();
        assert_eq!(map["id"], serde_json::json!("app"));
        let back: portal_core::Application = decode(map).unwrap();
        assert_eq!(back, app);
        assert!(encode(&FilterValue::Text("x".into())).is_err());
    }

    #[test]
    fn test_apply_aliases_renames_projected_columns() {
        use crate::sql::JoinedField;
        const JOIN: Join = Join {
            clause: None,
            fields: &[
                JoinedField::new("b.users_id", "owner_user_id", "ownerUserId"),
                JoinedField::new("created_at", "created_at", "created_at"),
            ],
        };
        let mut row = JsonMap::new();
        row.insert("owner_user_id".into(), serde_json::json!("u1"));
        row.insert("created_at".into(), serde_json::json!("2024-01-01T00:00:00.000Z"));
        apply_aliases(&mut row, &JOIN);
        assert_eq!(row["ownerUserId"], serde_json::json!("u1"));
        assert!(!row.contains_key("owner_user_id"));
        assert!(row.contains_key("created_at"));
    }

    #[tokio::test]
    async fn test_drop_database_refuses_invalid_name() {
        let engine = PgEngine::new(PgConfig {
            database: "bad name".into(),
            ..PgConfig::default()
        });
        let err = engine.drop_database().await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(!engine.is_connected());
    }

    #[tokio::test]
    async fn test_listen_rejects_invalid_channel() {
        let engine = PgEngine::new(PgConfig::default());
        let sink: NotificationSink = Arc::new(|_| {});
        let err = engine
            .listen_to_channel("webhook insert; --", sink)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_shutdown_without_pool_is_noop() {
        let engine = PgEngine::new(PgConfig::default());
        engine.shutdown().await;
        assert!(!engine.is_connected());
    }
}
