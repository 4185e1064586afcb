//! Backend selection.

use portal_core::{DaoError, DaoResult};
use portal_json::JsonStoreConfig;
use portal_pg::PgConfig;
use serde::{Deserialize, Serialize};

/// Which backend to open, with its configuration.
///
/// Serialized as `{"type": "json" | "postgres", "config": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum DaoConfig {
    Json(JsonStoreConfig),
    Postgres(PgConfig),
}

impl Default for DaoConfig {
    fn default() -> Self {
        DaoConfig::Json(JsonStoreConfig::default())
    }
}

impl DaoConfig {
    /// Pick the backend from `PORTAL_DAO_TYPE` (`json` by default) and read
    /// its own environment.
    pub fn from_env() -> DaoResult<Self> {
        let kind = std::env::var("PORTAL_DAO_TYPE").unwrap_or_default();
        Self::from_kind(&kind)
    }

    fn from_kind(kind: &str) -> DaoResult<Self> {
        match kind.trim().to_lowercase().as_str() {
            "" | "json" => Ok(DaoConfig::Json(JsonStoreConfig::from_env())),
            "postgres" => Ok(DaoConfig::Postgres(PgConfig::from_env())),
            other => Err(DaoError::config(format!("Unknown DAO type {}", other))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DaoConfig::Json(_) => "json",
            DaoConfig::Postgres(_) => "postgres",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn test_parse_json_config() {
        let config: DaoConfig = serde_json::from_value(json!({
            "type": "json",
            "config": { "basePath": "/var/portal/dynamic" }
        }))
        .unwrap();
        assert_eq!(
            config,
            DaoConfig::Json(JsonStoreConfig::new(PathBuf::from("/var/portal/dynamic")))
        );
        assert_eq!(config.kind(), "json");
    }

    #[test]
    fn test_parse_postgres_config_defaults_database() {
        let config: DaoConfig = serde_json::from_value(json!({
            "type": "postgres",
            "config": { "host": "db", "port": "5433", "user": "kong", "password": "kong" }
        }))
        .unwrap();
        let DaoConfig::Postgres(pg) = config else {
            panic!("expected postgres config");
        };
        assert_eq!(pg.host, "db");
        assert_eq!(pg.port, 5433);
        assert_eq!(pg.database, "wicked");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let parsed: Result<DaoConfig, _> =
            serde_json::from_value(json!({ "type": "redis", "config": {} }));
        assert!(parsed.is_err());
        assert_eq!(DaoConfig::from_kind("redis").unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_from_kind_defaults_to_json() {
        assert_eq!(DaoConfig::from_kind("").unwrap().kind(), "json");
        assert_eq!(DaoConfig::from_kind("Postgres").unwrap().kind(), "postgres");
    }
}
