//! Repository implementation for the relational engines.
//!
//! Statement text is built up front, each attempt acquires a fresh pooled
//! connection, and every command runs under the descriptor's command
//! timeout. Reads go through the query cache when one is attached; every
//! write drops the entity's cached entries.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::AnyConnection;
use tracing::{debug, warn};

use polystore_core::cache::{condition_key, paged_key, query_key};
use polystore_core::{
    Cond, ConnectionDescriptor, ConnectionManager, DalResult, DataAccessError, Entity, EngineKind, Filter,
    Idempotency, Op, PagedResult, PageRequest, PerformanceMonitor, QueryCache, Repository,
    RetryPolicy, TransactionScope, TxAction,
};

use crate::exec::with_timeout;

use super::manager::{map_sqlx_error, SqlConnectionManager};
use super::row::{bind_values, entity_from_row, entity_row, key_value};
use super::statements::{self, BuiltQuery};
use super::SqlDialect;

/// Default chunk size for the batched write paths.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Statement executor run on a checked-out connection. A plain fn pointer
/// so one retry wrapper serves every operation shape.
type Reader<T> = for<'c> fn(
    &'c mut AnyConnection,
    &'c ConnectionDescriptor,
    &'c BuiltQuery,
    &'static str,
) -> BoxFuture<'c, DalResult<T>>;

/// Generic repository over any relational engine kind.
pub struct SqlRepository<E: Entity> {
    manager: Arc<SqlConnectionManager>,
    retry: RetryPolicy,
    cache: Option<Arc<QueryCache>>,
    cache_ttl_minutes: u64,
    monitor: Option<Arc<PerformanceMonitor>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> SqlRepository<E> {
    pub fn new(manager: Arc<SqlConnectionManager>) -> Self {
        Self {
            manager,
            retry: RetryPolicy::default(),
            cache: None,
            cache_ttl_minutes: 0,
            monitor: None,
            _entity: PhantomData,
        }
    }

    /// Attach the shared query cache; `ttl_minutes` follows the cache's
    /// clamping rules (`0` = default).
    pub fn with_cache(mut self, cache: Arc<QueryCache>, ttl_minutes: u64) -> Self {
        self.cache = Some(cache);
        self.cache_ttl_minutes = ttl_minutes;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn dialect(&self) -> SqlDialect {
        self.manager.dialect()
    }

    /// Retry-wrapped execution with duration recording.
    async fn run<T, F, Fut>(
        &self,
        name: &'static str,
        idempotency: Idempotency,
        make: F,
    ) -> DalResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = DalResult<T>>,
    {
        let started = Instant::now();
        let result = self.retry.execute(name, idempotency, || make()).await;
        if result.is_err() {
            self.manager.note_error();
        }
        if let Some(monitor) = &self.monitor {
            monitor.record(name, started.elapsed(), result.is_ok());
        }
        result
    }

    /// One statement: acquire, execute under the command timeout, retry
    /// per policy.
    async fn run_statement<T: Send + 'static>(
        &self,
        name: &'static str,
        idempotency: Idempotency,
        built: BuiltQuery,
        read: Reader<T>,
    ) -> DalResult<T> {
        let manager = Arc::clone(&self.manager);
        let timeout = self.manager.command_timeout();
        self.run(name, idempotency, move || {
            let manager = Arc::clone(&manager);
            let built = built.clone();
            async move {
                with_timeout(name, timeout, async {
                    let mut conn = manager.acquire().await?;
                    read(&mut conn, manager.descriptor(), &built, name).await
                })
                .await
            }
        })
        .await
    }

    async fn cached_read<T, F, Fut>(&self, key: String, fetch: F) -> DalResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = DalResult<T>>,
    {
        match &self.cache {
            Some(cache) => {
                cache
                    .get_or_create(E::type_name(), key, self.cache_ttl_minutes, fetch)
                    .await
            }
            None => fetch().await,
        }
    }

    async fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_entity(E::type_name()).await;
        }
    }

    fn chunk_size(batch_size: usize) -> DalResult<usize> {
        if batch_size == 0 {
            return Err(DataAccessError::validation("batch_size must be at least 1"));
        }
        Ok(batch_size)
    }

    async fn paged_query(
        &self,
        name: &'static str,
        filter: Option<&Filter>,
        page: &PageRequest,
    ) -> DalResult<PagedResult<E>> {
        let count_built = statements::count_where::<E>(self.dialect(), filter)?;
        let page_built = statements::select_page::<E>(self.dialect(), filter, page)?;
        let key = paged_key::<E>(name, page, filter);
        let page_req = page.clone();

        self.cached_read(key, move || async move {
            let manager = Arc::clone(&self.manager);
            let timeout = self.manager.command_timeout();
            self.run(name, Idempotency::Idempotent, move || {
                let manager = Arc::clone(&manager);
                let page = page_req.clone();
                let count_built = count_built.clone();
                let page_built = page_built.clone();
                async move {
                    with_timeout(name, timeout, async {
                        let mut conn = manager.acquire().await?;
                        let total =
                            fetch_count(&mut conn, manager.descriptor(), &count_built, name)
                                .await?;
                        let items = fetch_entities::<E>(
                            &mut conn,
                            manager.descriptor(),
                            &page_built,
                            name,
                        )
                        .await?;
                        Ok(PagedResult::new(items, total, &page))
                    })
                    .await
                }
            })
            .await
        })
        .await
    }
}

// Statement executors shared by the repository and the transaction scope.

async fn fetch_entities<E: Entity>(
    conn: &mut AnyConnection,
    descriptor: &ConnectionDescriptor,
    built: &BuiltQuery,
    operation: &'static str,
) -> DalResult<Vec<E>> {
    let rows = bind_values(sqlx::query(&built.sql), &built.params)
        .fetch_all(&mut *conn)
        .await
        .map_err(|err| map_sqlx_error(operation, descriptor, err))?;
    rows.iter().map(entity_from_row::<E>).collect()
}

async fn fetch_optional_entity<E: Entity>(
    conn: &mut AnyConnection,
    descriptor: &ConnectionDescriptor,
    built: &BuiltQuery,
    operation: &'static str,
) -> DalResult<Option<E>> {
    let row = bind_values(sqlx::query(&built.sql), &built.params)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|err| map_sqlx_error(operation, descriptor, err))?;
    row.as_ref().map(entity_from_row::<E>).transpose()
}

async fn execute_statement(
    conn: &mut AnyConnection,
    descriptor: &ConnectionDescriptor,
    built: &BuiltQuery,
    operation: &'static str,
) -> DalResult<u64> {
    let done = bind_values(sqlx::query(&built.sql), &built.params)
        .execute(&mut *conn)
        .await
        .map_err(|err| map_sqlx_error(operation, descriptor, err))?;
    Ok(done.rows_affected())
}

async fn fetch_count(
    conn: &mut AnyConnection,
    descriptor: &ConnectionDescriptor,
    built: &BuiltQuery,
    operation: &'static str,
) -> DalResult<u64> {
    use sqlx::Row;
    let row = bind_values(sqlx::query(&built.sql), &built.params)
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| map_sqlx_error(operation, descriptor, err))?;
    let count: i64 = row
        .try_get(0)
        .map_err(|err| map_sqlx_error(operation, descriptor, err))?;
    Ok(count.max(0) as u64)
}

async fn fetch_exists(
    conn: &mut AnyConnection,
    descriptor: &ConnectionDescriptor,
    built: &BuiltQuery,
    operation: &'static str,
) -> DalResult<bool> {
    let row = bind_values(sqlx::query(&built.sql), &built.params)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|err| map_sqlx_error(operation, descriptor, err))?;
    Ok(row.is_some())
}

// Boxing wrappers with the exact `Reader` signature.

fn read_entities<'c, E: Entity>(
    conn: &'c mut AnyConnection,
    descriptor: &'c ConnectionDescriptor,
    built: &'c BuiltQuery,
    operation: &'static str,
) -> BoxFuture<'c, DalResult<Vec<E>>> {
    Box::pin(fetch_entities::<E>(conn, descriptor, built, operation))
}

fn read_optional_entity<'c, E: Entity>(
    conn: &'c mut AnyConnection,
    descriptor: &'c ConnectionDescriptor,
    built: &'c BuiltQuery,
    operation: &'static str,
) -> BoxFuture<'c, DalResult<Option<E>>> {
    Box::pin(fetch_optional_entity::<E>(conn, descriptor, built, operation))
}

fn read_affected<'c>(
    conn: &'c mut AnyConnection,
    descriptor: &'c ConnectionDescriptor,
    built: &'c BuiltQuery,
    operation: &'static str,
) -> BoxFuture<'c, DalResult<u64>> {
    Box::pin(execute_statement(conn, descriptor, built, operation))
}

fn read_count<'c>(
    conn: &'c mut AnyConnection,
    descriptor: &'c ConnectionDescriptor,
    built: &'c BuiltQuery,
    operation: &'static str,
) -> BoxFuture<'c, DalResult<u64>> {
    Box::pin(fetch_count(conn, descriptor, built, operation))
}

fn read_exists<'c>(
    conn: &'c mut AnyConnection,
    descriptor: &'c ConnectionDescriptor,
    built: &'c BuiltQuery,
    operation: &'static str,
) -> BoxFuture<'c, DalResult<bool>> {
    Box::pin(fetch_exists(conn, descriptor, built, operation))
}

/// Statement that deletes one row, routing through the soft-delete marker
/// when the entity declares one.
fn delete_by_id_statement<E: Entity>(
    dialect: SqlDialect,
    id: Value,
    deleted_by: &str,
) -> DalResult<BuiltQuery> {
    match E::soft_delete_fields() {
        Some(fields) => {
            statements::soft_delete::<E>(dialect, &fields, id, deleted_by, &Utc::now().to_rfc3339())
        }
        None => Ok(statements::delete_by_id::<E>(dialect, id)),
    }
}

#[async_trait]
impl<E: Entity> Repository<E> for SqlRepository<E> {
    fn engine(&self) -> EngineKind {
        self.manager.engine()
    }

    async fn get_all(&self) -> DalResult<Vec<E>> {
        let built = statements::select_all::<E>(self.dialect());
        let key = query_key::<E>("get_all", &Value::Null);
        self.cached_read(key, || {
            self.run_statement("get_all", Idempotency::Idempotent, built, read_entities::<E>)
        })
        .await
    }

    async fn get_by_id(&self, id: &E::Key) -> DalResult<Option<E>> {
        let built = statements::select_by_id::<E>(self.dialect(), key_value::<E>(id)?);
        let key = query_key::<E>("get_by_id", &Value::String(id.to_string()));
        self.cached_read(key, || {
            self.run_statement(
                "get_by_id",
                Idempotency::Idempotent,
                built,
                read_optional_entity::<E>,
            )
        })
        .await
    }

    async fn get_by_condition(&self, filter: &Filter) -> DalResult<Vec<E>> {
        let built = statements::select_where::<E>(self.dialect(), filter)?;
        let key = condition_key::<E>("get_by_condition", filter);
        self.cached_read(key, || {
            self.run_statement(
                "get_by_condition",
                Idempotency::Idempotent,
                built,
                read_entities::<E>,
            )
        })
        .await
    }

    async fn get_paged(&self, page: &PageRequest) -> DalResult<PagedResult<E>> {
        self.paged_query("get_paged", None, page).await
    }

    async fn get_paged_by_condition(
        &self,
        filter: &Filter,
        page: &PageRequest,
    ) -> DalResult<PagedResult<E>> {
        self.paged_query("get_paged_by_condition", Some(filter), page)
            .await
    }

    async fn exists(&self, filter: &Filter) -> DalResult<bool> {
        let built = statements::exists_where::<E>(self.dialect(), filter)?;
        let key = condition_key::<E>("exists", filter);
        self.cached_read(key, || {
            self.run_statement("exists", Idempotency::Idempotent, built, read_exists)
        })
        .await
    }

    async fn count(&self, filter: Option<&Filter>) -> DalResult<u64> {
        let built = statements::count_where::<E>(self.dialect(), filter)?;
        let key = match filter {
            Some(filter) => condition_key::<E>("count", filter),
            None => query_key::<E>("count", &Value::Null),
        };
        self.cached_read(key, || {
            self.run_statement("count", Idempotency::Idempotent, built, read_count)
        })
        .await
    }

    async fn add(&self, entity: &E) -> DalResult<()> {
        let built = statements::insert_one::<E>(self.dialect(), &entity_row(entity)?)?;
        self.run_statement("add", Idempotency::NonIdempotent, built, read_affected)
            .await?;
        self.invalidate_cache().await;
        Ok(())
    }

    async fn add_range(&self, entities: &[E]) -> DalResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let rows = entities
            .iter()
            .map(entity_row)
            .collect::<DalResult<Vec<_>>>()?;
        let built = statements::insert_many::<E>(self.dialect(), &rows)?;
        self.run_statement("add_range", Idempotency::NonIdempotent, built, read_affected)
            .await?;
        self.invalidate_cache().await;
        Ok(())
    }

    async fn add_batched(&self, entities: &[E], batch_size: usize) -> DalResult<()> {
        let batch_size = Self::chunk_size(batch_size)?;
        if entities.is_empty() {
            return Ok(());
        }
        let rows = entities
            .iter()
            .map(entity_row)
            .collect::<DalResult<Vec<_>>>()?;
        // Chunks run sequentially so a failure names one chunk, not an
        // interleaving.
        for (index, chunk) in rows.chunks(batch_size).enumerate() {
            let built = statements::insert_many::<E>(self.dialect(), chunk)?;
            self.run_statement("add_batched", Idempotency::NonIdempotent, built, read_affected)
                .await
                .map_err(|err| {
                    warn!(chunk = index, error = %err, "batched insert failed");
                    err
                })?;
        }
        self.invalidate_cache().await;
        Ok(())
    }

    async fn update(&self, entity: &E) -> DalResult<()> {
        let built = statements::update_full::<E>(self.dialect(), &entity_row(entity)?)?;
        self.run_statement("update", Idempotency::NonIdempotent, built, read_affected)
            .await?;
        self.invalidate_cache().await;
        Ok(())
    }

    async fn update_partial(&self, entity: &E, fields: &[&str]) -> DalResult<()> {
        let built = statements::update_fields::<E>(self.dialect(), &entity_row(entity)?, fields)?;
        self.run_statement("update_partial", Idempotency::NonIdempotent, built, read_affected)
            .await?;
        self.invalidate_cache().await;
        Ok(())
    }

    async fn update_range(&self, entities: &[E]) -> DalResult<()> {
        for entity in entities {
            let built = statements::update_full::<E>(self.dialect(), &entity_row(entity)?)?;
            self.run_statement("update_range", Idempotency::NonIdempotent, built, read_affected)
                .await?;
        }
        self.invalidate_cache().await;
        Ok(())
    }

    async fn delete(&self, entity: &E) -> DalResult<()> {
        self.delete_by_id(&entity.id()).await.map(|_| ())
    }

    async fn delete_by_id(&self, id: &E::Key) -> DalResult<bool> {
        let built = delete_by_id_statement::<E>(self.dialect(), key_value::<E>(id)?, "system")?;
        let affected = self
            .run_statement("delete_by_id", Idempotency::NonIdempotent, built, read_affected)
            .await?;
        self.invalidate_cache().await;
        Ok(affected > 0)
    }

    async fn delete_by_condition(&self, filter: &Filter) -> DalResult<u64> {
        let built = statements::delete_where::<E>(self.dialect(), filter)?;
        let affected = self
            .run_statement(
                "delete_by_condition",
                Idempotency::NonIdempotent,
                built,
                read_affected,
            )
            .await?;
        self.invalidate_cache().await;
        debug!(affected, entity = E::type_name(), "conditional delete");
        Ok(affected)
    }

    async fn delete_batched(&self, entities: &[E], batch_size: usize) -> DalResult<()> {
        let batch_size = Self::chunk_size(batch_size)?;
        if entities.is_empty() {
            return Ok(());
        }
        let ids = entities
            .iter()
            .map(|e| key_value::<E>(&e.id()))
            .collect::<DalResult<Vec<_>>>()?;
        for chunk in ids.chunks(batch_size) {
            let filter = Filter::by(Cond {
                field: E::id_field().to_string(),
                op: Op::In,
                value: Value::Array(chunk.to_vec()),
            });
            let built = statements::delete_where::<E>(self.dialect(), &filter)?;
            self.run_statement("delete_batched", Idempotency::NonIdempotent, built, read_affected)
                .await?;
        }
        self.invalidate_cache().await;
        Ok(())
    }

    async fn soft_delete(&self, id: &E::Key, deleted_by: &str) -> DalResult<bool> {
        let fields = E::soft_delete_fields().ok_or_else(|| {
            DataAccessError::validation(format!(
                "{} does not declare soft-delete fields",
                E::type_name()
            ))
        })?;
        let built = statements::soft_delete::<E>(
            self.dialect(),
            &fields,
            key_value::<E>(id)?,
            deleted_by,
            &Utc::now().to_rfc3339(),
        )?;
        let affected = self
            .run_statement("soft_delete", Idempotency::NonIdempotent, built, read_affected)
            .await?;
        self.invalidate_cache().await;
        Ok(affected > 0)
    }

    async fn execute_in_transaction(&self, action: TxAction<'_, E>) -> DalResult<()> {
        let started = Instant::now();

        // Opening the transaction is retried; the body never is, because a
        // partially-applied body must not be replayed.
        let manager = Arc::clone(&self.manager);
        let mut tx = self
            .retry
            .execute("begin_transaction", Idempotency::Idempotent, move || {
                let manager = Arc::clone(&manager);
                async move {
                    manager.pool().begin().await.map_err(|err| {
                        map_sqlx_error("begin_transaction", manager.descriptor(), err)
                    })
                }
            })
            .await?;

        let result = {
            let mut scope = SqlTransactionScope::<E> {
                conn: &mut *tx,
                dialect: self.dialect(),
                descriptor: self.manager.descriptor(),
                _entity: PhantomData,
            };
            action(&mut scope).await
        };

        let result = match result {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|err| map_sqlx_error("commit", self.manager.descriptor(), err)),
            Err(err) => {
                // Also covers cancellation: dropping the future drops the
                // transaction, which rolls back.
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed transaction also failed");
                }
                Err(err)
            }
        };

        if let Some(monitor) = &self.monitor {
            monitor.record("execute_in_transaction", started.elapsed(), result.is_ok());
        }
        if result.is_ok() {
            self.invalidate_cache().await;
        }
        result
    }
}

/// Write surface bound to one open transaction.
pub struct SqlTransactionScope<'t, E: Entity> {
    conn: &'t mut AnyConnection,
    dialect: SqlDialect,
    descriptor: &'t ConnectionDescriptor,
    _entity: PhantomData<fn() -> E>,
}

#[async_trait]
impl<'t, E: Entity> TransactionScope<E> for SqlTransactionScope<'t, E> {
    async fn add(&mut self, entity: &E) -> DalResult<()> {
        let built = statements::insert_one::<E>(self.dialect, &entity_row(entity)?)?;
        execute_statement(self.conn, self.descriptor, &built, "tx.add").await?;
        Ok(())
    }

    async fn add_range(&mut self, entities: &[E]) -> DalResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let rows = entities
            .iter()
            .map(entity_row)
            .collect::<DalResult<Vec<_>>>()?;
        let built = statements::insert_many::<E>(self.dialect, &rows)?;
        execute_statement(self.conn, self.descriptor, &built, "tx.add_range").await?;
        Ok(())
    }

    async fn update(&mut self, entity: &E) -> DalResult<()> {
        let built = statements::update_full::<E>(self.dialect, &entity_row(entity)?)?;
        execute_statement(self.conn, self.descriptor, &built, "tx.update").await?;
        Ok(())
    }

    async fn delete_by_id(&mut self, id: &E::Key) -> DalResult<bool> {
        let built = delete_by_id_statement::<E>(self.dialect, key_value::<E>(id)?, "system")?;
        let affected =
            execute_statement(self.conn, self.descriptor, &built, "tx.delete_by_id").await?;
        Ok(affected > 0)
    }

    async fn delete_by_condition(&mut self, filter: &Filter) -> DalResult<u64> {
        let built = statements::delete_where::<E>(self.dialect, filter)?;
        execute_statement(self.conn, self.descriptor, &built, "tx.delete_by_condition").await
    }

    async fn get_by_id(&mut self, id: &E::Key) -> DalResult<Option<E>> {
        let built = statements::select_by_id::<E>(self.dialect, key_value::<E>(id)?);
        fetch_optional_entity::<E>(self.conn, self.descriptor, &built, "tx.get_by_id").await
    }
}
