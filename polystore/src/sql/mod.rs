//! Relational engine binding (PostgreSQL, MySQL, MariaDB, SQLite) over
//! the `sqlx` `Any` driver.

pub mod dialect;
pub mod manager;
pub mod repository;
pub mod row;
pub mod statements;

pub use dialect::SqlDialect;
pub use manager::SqlConnectionManager;
pub use repository::{SqlRepository, SqlTransactionScope, DEFAULT_BATCH_SIZE};
pub use statements::BuiltQuery;
