//! Migration configuration: shape validation and custom id remapping.

use super::MigrationError;
use crate::config::DaoConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Custom id prefix that is never remapped.
pub const INTERNAL_PREFIX: &str = "internal";

/// Mapping of legacy custom id prefixes to auth method ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomIdMappings {
    /// Prefix given to custom ids that carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_prefix: Option<String>,
    #[serde(default)]
    pub prefixes: BTreeMap<String, String>,
}

/// What to copy where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfig {
    /// Wipe the target before writing to it.
    #[serde(default)]
    pub wipe_target: bool,
    pub source: DaoConfig,
    pub target: DaoConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_id_mappings: Option<CustomIdMappings>,
}

impl MigrationConfig {
    /// Read and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, MigrationError> {
        debug!(path = %path.display(), "reading migration configuration");
        let content = std::fs::read_to_string(path)?;
        let value: JsonValue = serde_json::from_str(&content)
            .map_err(|e| MigrationError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_value(value)
    }

    /// Validate the shape of a configuration document, then parse it.
    pub fn from_value(value: JsonValue) -> Result<Self, MigrationError> {
        for side in ["source", "target"] {
            let dao = value.get(side).ok_or_else(|| {
                MigrationError::Config(format!(
                    "configuration does not contain a \"{}\" property.",
                    side
                ))
            })?;
            validate_dao_config(dao)?;
        }
        serde_json::from_value(value).map_err(|e| MigrationError::Config(e.to_string()))
    }

    pub fn mappings(&self) -> CustomIdMappings {
        self.custom_id_mappings.clone().unwrap_or_default()
    }
}

fn has_value(config: &JsonValue, property: &str) -> bool {
    match config.get(property) {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn validate_dao_config(dao: &JsonValue) -> Result<(), MigrationError> {
    let kind = dao.get("type").and_then(JsonValue::as_str).unwrap_or_default();
    let config = dao.get("config");
    match kind {
        "json" => match config {
            Some(c) if has_value(c, "basePath") => Ok(()),
            _ => Err(MigrationError::Config(
                "JSON configuration does not contain a \"config\" or \"config.basePath\" property."
                    .to_string(),
            )),
        },
        "postgres" => {
            let config = config.ok_or_else(|| {
                MigrationError::Config(
                    "Postgres configuration does not contain a \"config\" property.".to_string(),
                )
            })?;
            for property in ["host", "port", "user", "password"] {
                if !has_value(config, property) {
                    return Err(MigrationError::Config(format!(
                        "Postgres configuration does not contain a \"config.{}\" property.",
                        property
                    )));
                }
            }
            if !has_value(config, "database") {
                warn!("Using default database name \"wicked\".");
            }
            Ok(())
        }
        other => Err(MigrationError::Config(format!(
            "validateDaoConfig: unknown DAO type {}",
            other
        ))),
    }
}

// ============================================================================
// CUSTOM IDS
// ============================================================================

/// Prefix of `prefix:rawId`; prefixes containing spaces do not count.
pub fn custom_id_prefix(custom_id: &str) -> Option<&str> {
    let (prefix, _) = custom_id.split_once(':')?;
    if prefix.contains(' ') {
        return None;
    }
    Some(prefix)
}

fn without_prefix(custom_id: &str) -> &str {
    custom_id.split_once(':').map_or(custom_id, |(_, rest)| rest)
}

impl CustomIdMappings {
    /// Remap a legacy custom id onto its auth method id.
    ///
    /// Returns `None` when no mapping applies; validation rejects such data
    /// before anything is written.
    pub fn map(&self, custom_id: &str) -> Option<String> {
        match custom_id_prefix(custom_id) {
            None => self
                .default_prefix
                .as_deref()
                .map(|prefix| format!("{}:{}", prefix, custom_id)),
            Some(INTERNAL_PREFIX) => Some(custom_id.to_string()),
            Some(prefix) => self
                .prefixes
                .get(prefix)
                .map(|mapped| format!("{}:{}", mapped, without_prefix(custom_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn json_side(base: &str) -> JsonValue {
        json!({ "type": "json", "config": { "basePath": base } })
    }

    #[test]
    fn test_parse_full_config() {
        let config = MigrationConfig::from_value(json!({
            "wipeTarget": true,
            "source": json_side("/data/old"),
            "target": {
                "type": "postgres",
                "config": { "host": "localhost", "port": 5432, "user": "kong", "password": "kong" }
            },
            "customIdMappings": { "defaultPrefix": "legacy", "prefixes": { "Google": "google" } }
        }))
        .unwrap();
        assert!(config.wipe_target);
        assert_eq!(config.target.kind(), "postgres");
        assert_eq!(config.mappings().prefixes["Google"], "google");
    }

    #[test]
    fn test_missing_sides_and_properties() {
        let err = MigrationConfig::from_value(json!({ "source": json_side("/a") })).unwrap_err();
        assert!(err.to_string().contains("\"target\""));

        let err = MigrationConfig::from_value(json!({
            "source": { "type": "json", "config": {} },
            "target": json_side("/b")
        }))
        .unwrap_err();
        assert!(err.to_string().contains("config.basePath"));

        let err = MigrationConfig::from_value(json!({
            "source": json_side("/a"),
            "target": { "type": "postgres", "config": { "host": "h", "port": 5432, "user": "u" } }
        }))
        .unwrap_err();
        assert!(matches!(err, MigrationError::Config(_)));
        assert!(err.to_string().contains("config.password"));

        let err = MigrationConfig::from_value(json!({
            "source": { "type": "mongo", "config": {} },
            "target": json_side("/b")
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unknown DAO type mongo"));
    }

    #[test]
    fn test_custom_id_prefix() {
        assert_eq!(custom_id_prefix("Google:123"), Some("Google"));
        assert_eq!(custom_id_prefix("123"), None);
        assert_eq!(custom_id_prefix("some prefix:123"), None);
        assert_eq!(custom_id_prefix("a:b:c"), Some("a"));
    }

    #[test]
    fn test_map_custom_ids() {
        let mappings = CustomIdMappings {
            default_prefix: Some("legacy".into()),
            prefixes: [("Google".to_string(), "google".to_string())].into_iter().collect(),
        };
        assert_eq!(mappings.map("Google:123").as_deref(), Some("google:123"));
        assert_eq!(mappings.map("123").as_deref(), Some("legacy:123"));
        assert_eq!(mappings.map("internal:42").as_deref(), Some("internal:42"));
        assert_eq!(mappings.map("Github:7"), None);
        assert_eq!(CustomIdMappings::default().map("123"), None);
    }
}
