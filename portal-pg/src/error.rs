//! Errors of the relational backend and their mapping onto `DaoError`.

use portal_core::{DaoError, DaoResult};
use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Failures raised by the database driver or the connection pool.
#[derive(Debug, Error)]
pub enum PgError {
    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Invalid postgres configuration: {0}")]
    Config(String),
}

impl PgError {
    /// SQLSTATE of the underlying database error, if any.
    pub fn code(&self) -> Option<&SqlState> {
        match self {
            PgError::Postgres(e) => e.code(),
            PgError::Pool(deadpool_postgres::PoolError::Backend(e)) => e.code(),
            _ => None,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        self.code() == Some(&SqlState::UNIQUE_VIOLATION)
    }

    /// `3D000`: the configured database does not exist yet.
    pub fn is_missing_database(&self) -> bool {
        self.code() == Some(&SqlState::INVALID_CATALOG_NAME)
    }

    /// Errors worth another connect attempt: refused connections, a server
    /// still starting up (`57P03`), dropped connections and pool timeouts.
    pub fn is_transient(&self) -> bool {
        if self.code() == Some(&SqlState::CANNOT_CONNECT_NOW) {
            return true;
        }
        match self {
            PgError::Postgres(e) => e.is_closed() || is_connection_refused(e),
            PgError::Pool(deadpool_postgres::PoolError::Backend(e)) => {
                e.is_closed() || is_connection_refused(e)
            }
            PgError::Pool(deadpool_postgres::PoolError::Timeout(_)) => true,
            _ => false,
        }
    }
}

fn is_connection_refused(err: &tokio_postgres::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return io.kind() == std::io::ErrorKind::ConnectionRefused;
        }
        source = e.source();
    }
    false
}

impl From<PgError> for DaoError {
    fn from(err: PgError) -> Self {
        if err.is_unique_violation() {
            let detail = match &err {
                PgError::Postgres(e) => e
                    .as_db_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| e.to_string()),
                other => other.to_string(),
            };
            return DaoError::Conflict(detail);
        }
        match err {
            PgError::Config(msg) => DaoError::Config(msg),
            PgError::Pool(deadpool_postgres::PoolError::Timeout(_)) => {
                tracing::error!("Connection pool exhausted");
                DaoError::Database("connection pool exhausted".to_string())
            }
            PgError::Pool(deadpool_postgres::PoolError::Closed) => {
                DaoError::Database("connection pool is closed".to_string())
            }
            other => {
                tracing::error!(error = ?other, "database operation failed");
                DaoError::Database(other.to_string())
            }
        }
    }
}

/// `?`-friendly conversion of driver results into `DaoResult`.
pub(crate) trait DbResultExt<T> {
    fn db(self) -> DaoResult<T>;
}

impl<T, E: Into<PgError>> DbResultExt<T> for Result<T, E> {
    fn db(self) -> DaoResult<T> {
        self.map_err(|e| DaoError::from(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_maps_to_config_status() {
        let err: DaoError = PgError::Config("host missing".into()).into();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_config_error_is_not_transient() {
        let err = PgError::Config("x".into());
        assert!(!err.is_transient());
        assert!(!err.is_unique_violation());
        assert!(err.code().is_none());
    }

    #[test]
    fn test_closed_pool_maps_to_database_error() {
        let err: DaoError = PgError::Pool(deadpool_postgres::PoolError::Closed).into();
        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().contains("closed"));
    }
}
