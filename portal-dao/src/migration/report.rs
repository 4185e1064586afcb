//! Warnings and counters collected during a migration run.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Data was skipped; the run continues.
    Warning,
    /// The run cannot proceed with this configuration.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// Something an operator has to look at after the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationWarning {
    pub severity: Severity,
    pub message: String,
    pub description: String,
    /// Data to act on, or an example configuration fixing the problem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

impl MigrationWarning {
    pub fn warning(
        message: impl Into<String>,
        description: impl Into<String>,
        payload: Option<JsonValue>,
    ) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            description: description.into(),
            payload,
        }
    }

    pub fn error(
        message: impl Into<String>,
        description: impl Into<String>,
        payload: Option<JsonValue>,
    ) -> Self {
        Self {
            severity: Severity::Error,
            ..Self::warning(message, description, payload)
        }
    }

    /// Log the warning at error level, payload included.
    pub fn print(&self) {
        error!("{}: {}", self.severity, self.message);
        error!("{}", self.description);
        if let Some(payload) = &self.payload {
            error!("{}", payload);
        }
    }
}

/// Records written and skipped by a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub users: usize,
    pub registrations: usize,
    pub applications: usize,
    pub subscriptions: usize,
    pub approvals: usize,
    /// Applications whose id collides with another one ignoring case.
    pub skipped_applications: usize,
    pub skipped_subscriptions: usize,
    pub skipped_approvals: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_constructor_keeps_payload() {
        let w = MigrationWarning::error("missing", "add a mapping", Some(json!({"a": 1})));
        assert_eq!(w.severity, Severity::Error);
        assert_eq!(w.payload, Some(json!({"a": 1})));
        assert_eq!(w.severity.to_string(), "ERROR");
        assert_eq!(serde_json::to_value(&w).unwrap()["severity"], "ERROR");
    }
}
