//! Core contract of the polystore data-access layer.
//!
//! Everything here is driver-independent: the error taxonomy, connection
//! descriptors and connection-string construction, entity and filter
//! models, paging, the retry policy, the query cache, the performance
//! monitor, and the repository/connection-manager traits. Engine bindings
//! live in the `polystore` crate.

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod filter;
pub mod manager;
pub mod monitor;
pub mod page;
pub mod repository;
pub mod retry;

pub use cache::{CacheStats, QueryCache};
pub use config::{AccessConfig, EngineConfig};
pub use descriptor::{ConnectionDescriptor, ConnectionDescriptorBuilder, EngineKind};
pub use entity::{Entity, EntityKey, SoftDeleteFields};
pub use error::{BoxError, DalResult, DataAccessError};
pub use filter::{Cond, Filter, Node, Op};
pub use manager::{ConnectionManager, ConnectionPoolStatus, ConnectionTestResult};
pub use monitor::{OperationRecord, PerformanceMonitor, PerformanceStats};
pub use page::{PagedResult, PageRequest, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use repository::{transact, Repository, TransactionScope, TxAction, TxActionWith};
pub use retry::{Idempotency, RetryPolicy};
