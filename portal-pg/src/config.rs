//! Connection settings of the relational backend.

use crate::error::PgError;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tokio_postgres::NoTls;

/// Database used when the configuration names none.
pub const DEFAULT_DATABASE: &str = "wicked";

/// Maintenance database used to create and drop the portal database.
pub const MAINTENANCE_DATABASE: &str = "postgres";

// ============================================================================
// TUNING
// ============================================================================

/// Pool and retry tuning, always taken from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgTuning {
    /// Connect attempts before giving up.
    pub connect_retries: u32,
    pub connect_delay: Duration,
    pub max_clients: usize,
    pub connect_timeout: Duration,
    /// Pooled connections unused for longer than this are closed.
    pub idle_timeout: Duration,
}

impl Default for PgTuning {
    fn default() -> Self {
        Self {
            connect_retries: 30,
            connect_delay: Duration::from_millis(2000),
            max_clients: 10,
            connect_timeout: Duration::from_millis(10_000),
            idle_timeout: Duration::from_millis(120 * 60 * 1000),
        }
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl PgTuning {
    /// Read the `POSTGRES_*` tuning variables, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connect_retries: env_number("POSTGRES_CONNECT_RETRIES")
                .unwrap_or(defaults.connect_retries),
            connect_delay: env_number("POSTGRES_CONNECT_DELAY")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_delay),
            max_clients: env_number("POSTGRES_MAX_CLIENTS").unwrap_or(defaults.max_clients),
            connect_timeout: env_number("POSTGRES_CONNECT_TIMEOUT")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            idle_timeout: env_number("POSTGRES_IDLE_TIMEOUT")
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_timeout),
        }
    }
}

// ============================================================================
// CONNECTION CONFIG
// ============================================================================

/// Accept the port as a number or as a numeric string.
fn port_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }
    match Port::deserialize(deserializer)? {
        Port::Number(n) => Ok(n),
        Port::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    DEFAULT_DATABASE.to_string()
}

/// Relational backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgConfig {
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "port_from_any")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(skip, default = "PgTuning::from_env")]
    pub tuning: PgTuning,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            user: "postgres".to_string(),
            password: String::new(),
            database: default_database(),
            tuning: PgTuning::default(),
        }
    }
}

impl PgConfig {
    /// Create configuration from `PORTAL_PG_*` and `POSTGRES_*` variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("PORTAL_PG_HOST").unwrap_or(defaults.host),
            port: env_number("PORTAL_PG_PORT").unwrap_or(defaults.port),
            user: std::env::var("PORTAL_PG_USER").unwrap_or(defaults.user),
            password: std::env::var("PORTAL_PG_PASSWORD").unwrap_or_default(),
            database: std::env::var("PORTAL_PG_DATABASE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.database),
            tuning: PgTuning::from_env(),
        }
    }

    /// Check that every connection property is present.
    pub fn validate(&self) -> Result<(), PgError> {
        let missing: Vec<&str> = [
            ("host", self.host.is_empty()),
            ("port", self.port == 0),
            ("user", self.user.is_empty()),
            ("password", self.password.is_empty()),
        ]
        .iter()
        .filter(|(_, missing)| *missing)
        .map(|(name, _)| *name)
        .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PgError::Config(format!(
                "postgres configuration is missing: {}",
                missing.join(", ")
            )))
        }
    }

    /// Pool settings for `database`.
    pub fn pool_config(&self, database: &str) -> Config {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.dbname = Some(database.to_string());
        cfg.connect_timeout = Some(self.tuning.connect_timeout);

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool = PoolConfig::new(self.tuning.max_clients);
        pool.timeouts.wait = Some(self.tuning.connect_timeout);
        pool.timeouts.create = Some(self.tuning.connect_timeout);
        cfg.pool = Some(pool);
        cfg
    }

    /// Create a connection pool for the configured database.
    pub fn create_pool(&self) -> Result<Pool, PgError> {
        self.pool_config(&self.database)
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| PgError::Config(format!("Failed to create pool: {}", e)))
    }

    /// Settings for a dedicated connection outside the pool.
    pub fn connect_config(&self, database: &str) -> tokio_postgres::Config {
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&self.host)
            .port(self.port)
            .user(&self.user)
            .password(&self.password)
            .dbname(database)
            .connect_timeout(self.tuning.connect_timeout);
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_from_json_defaults_database() {
        let cfg: PgConfig = serde_json::from_value(json!({
            "host": "db", "port": "5433", "user": "admin", "password": "secret"
        }))
        .unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.database, "wicked");
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_lists_missing_properties() {
        let cfg = PgConfig {
            host: String::new(),
            password: String::new(),
            ..PgConfig::default()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("host"));
        assert!(err.contains("password"));
        assert!(!err.contains("user"));
    }

    #[test]
    fn test_tuning_defaults() {
        let tuning = PgTuning::default();
        assert_eq!(tuning.connect_retries, 30);
        assert_eq!(tuning.connect_delay, Duration::from_millis(2000));
        assert_eq!(tuning.max_clients, 10);
        assert_eq!(tuning.idle_timeout, Duration::from_secs(7200));
    }
}
