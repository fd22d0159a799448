//! Relational connection management over the `Any` driver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool};
use tracing::{debug, info};

use polystore_core::{
    ConnectionDescriptor, ConnectionManager, ConnectionPoolStatus, ConnectionTestResult,
    DalResult, DataAccessError, EngineKind,
};

use super::dialect::SqlDialect;

/// Connection manager for the relational engines (PostgreSQL, MySQL,
/// MariaDB, SQLite). Owns the driver pool; every logical operation
/// acquires its own pooled connection.
pub struct SqlConnectionManager {
    descriptor: ConnectionDescriptor,
    dialect: SqlDialect,
    pool: AnyPool,
    created_at: Instant,
    error_count: AtomicU64,
}

impl SqlConnectionManager {
    /// Validate the descriptor and open the pool. Pool bounds and the
    /// connect timeout come straight from the descriptor; nothing is
    /// silently downgraded.
    pub async fn connect(descriptor: ConnectionDescriptor) -> DalResult<Self> {
        descriptor.validate()?;
        let dialect = SqlDialect::for_engine(descriptor.engine())?;

        static INSTALL_DRIVERS: Once = Once::new();
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        debug!(
            engine = %descriptor.engine(),
            url = %descriptor.redacted_connection_string(),
            "opening relational pool"
        );

        let pool = AnyPoolOptions::new()
            .min_connections(descriptor.min_pool_size())
            .max_connections(descriptor.max_pool_size())
            .acquire_timeout(Duration::from_secs(descriptor.connect_timeout_secs()))
            .connect(&descriptor.connection_string())
            .await
            .map_err(|err| {
                DataAccessError::connection(
                    descriptor.redact_text(&format!("failed to open pool: {err}")),
                )
            })?;

        info!(engine = %descriptor.engine(), pool = %descriptor.pool_name(), "relational pool ready");

        Ok(Self {
            descriptor,
            dialect,
            pool,
            created_at: Instant::now(),
            error_count: AtomicU64::new(0),
        })
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Per-command timeout from the descriptor.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.descriptor.command_timeout_secs())
    }

    /// Check a connection out of the driver's pool for one logical call.
    pub async fn acquire(&self) -> DalResult<PoolConnection<Any>> {
        self.pool.acquire().await.map_err(|err| {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            map_sqlx_error("acquire", &self.descriptor, err)
        })
    }

    pub(crate) fn note_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl ConnectionManager for SqlConnectionManager {
    fn engine(&self) -> EngineKind {
        self.descriptor.engine()
    }

    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        let started = Instant::now();
        let probe: Result<AnyRow, sqlx::Error> =
            sqlx::query("SELECT 1").fetch_one(&self.pool).await;
        match probe {
            Ok(_) => ConnectionTestResult::ok(started.elapsed().as_secs_f64() * 1000.0),
            Err(err) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                ConnectionTestResult::failed(self.descriptor.redact_text(&err.to_string()))
            }
        }
    }

    async fn pool_status(&self) -> ConnectionPoolStatus {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        ConnectionPoolStatus {
            engine: self.descriptor.engine(),
            pool_name: self.descriptor.pool_name(),
            min_pool_size: self.descriptor.min_pool_size(),
            max_pool_size: self.descriptor.max_pool_size(),
            active_connections: size.saturating_sub(idle),
            healthy: !self.pool.is_closed(),
            error_count: self.error_count.load(Ordering::Relaxed),
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Map a driver error into the taxonomy. SQLSTATE classes 40 (transaction
/// rollback) and 53 (insufficient resources), the MySQL lock codes and
/// SQLite busy/locked codes are transient; pool/IO trouble is a
/// connection error; the rest is an unclassified backend failure.
pub(crate) fn map_sqlx_error(
    operation: &str,
    descriptor: &ConnectionDescriptor,
    err: sqlx::Error,
) -> DataAccessError {
    match &err {
        sqlx::Error::Configuration(inner) => {
            DataAccessError::configuration(descriptor.redact_text(&inner.to_string()))
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DataAccessError::connection_with(
            descriptor.redact_text(&format!("{operation}: {err}")),
            err,
        ),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let message = db.message().to_lowercase();
            let transient = code.starts_with("40")
                || code.starts_with("53")
                || code == "1205"
                || code == "1213"
                || code == "5"
                || code == "6"
                || message.contains("database is locked")
                || message.contains("database table is locked");
            if transient {
                DataAccessError::transient_with(
                    descriptor.redact_text(&format!("{operation}: {}", db.message())),
                    err,
                )
            } else {
                DataAccessError::backend(operation, err)
            }
        }
        _ => DataAccessError::backend(operation, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pool-backed behavior is covered by the SQLite integration tests;
    // here only the error mapping, which needs no I/O.

    #[test]
    fn pool_errors_classify_as_connection() {
        let descriptor = ConnectionDescriptor::builder(EngineKind::Sqlite)
            .database("/tmp/x.db")
            .build()
            .unwrap();
        let mapped = map_sqlx_error("acquire", &descriptor, sqlx::Error::PoolTimedOut);
        assert!(matches!(mapped, DataAccessError::Connection { .. }));
    }

    #[test]
    fn unknown_errors_classify_as_backend() {
        let descriptor = ConnectionDescriptor::builder(EngineKind::Sqlite)
            .database("/tmp/x.db")
            .build()
            .unwrap();
        let mapped = map_sqlx_error("fetch", &descriptor, sqlx::Error::RowNotFound);
        assert!(matches!(mapped, DataAccessError::Backend { .. }));
    }
}
