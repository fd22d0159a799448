//! Runtime-selectable data access: one repository contract over
//! relational engines (PostgreSQL, MySQL, MariaDB, SQLite via `sqlx`) and
//! MongoDB, behind a factory.
//!
//! The driver-independent contract lives in `polystore-core` and is
//! re-exported here.

pub mod factory;
pub mod health;
pub mod mongo;
pub mod sql;

pub use factory::RepositoryFactory;
pub use health::{HealthMonitor, HealthSnapshot};
pub use mongo::{MongoConnectionManager, MongoRepository};
pub use sql::{SqlConnectionManager, SqlDialect, SqlRepository};

pub use polystore_core::{
    transact, AccessConfig, Cond, ConnectionDescriptor, ConnectionManager, ConnectionPoolStatus,
    ConnectionTestResult, DalResult, DataAccessError, EngineConfig, EngineKind, Entity, EntityKey,
    Filter, Idempotency, Op, PagedResult, PageRequest, PerformanceMonitor, QueryCache, Repository,
    RetryPolicy, SoftDeleteFields, TransactionScope, TxAction, TxActionWith,
};

pub(crate) mod exec {
    use std::time::Duration;

    use polystore_core::{DalResult, DataAccessError};

    /// Bound one command by the descriptor's command timeout.
    pub(crate) async fn with_timeout<T>(
        name: &str,
        limit: Duration,
        fut: impl std::future::Future<Output = DalResult<T>>,
    ) -> DalResult<T> {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(DataAccessError::timeout(name, limit)),
        }
    }
}
