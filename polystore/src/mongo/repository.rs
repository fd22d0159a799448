//! Repository implementation for the document engine.
//!
//! The same contract as the relational binding despite MongoDB's
//! different transaction and identity semantics: `execute_in_transaction`
//! opens a client session, starts a server transaction, and aborts it on
//! any error inside the block.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, Bson, Document};
use mongodb::{Collection, ClientSession};
use serde_json::Value;
use tracing::{debug, warn};

use polystore_core::cache::{condition_key, paged_key, query_key};
use polystore_core::filter::ensure_valid_identifier;
use polystore_core::{
    Cond, ConnectionManager, DalResult, DataAccessError, Entity, EngineKind, Filter, Idempotency, Op, PagedResult,
    PageRequest, PerformanceMonitor, QueryCache, Repository, RetryPolicy, TransactionScope,
    TxAction,
};

use crate::exec::with_timeout;

use super::filter::render;
use super::manager::{map_mongo_error, MongoConnectionManager};

/// Generic repository over a MongoDB collection.
pub struct MongoRepository<E: Entity> {
    manager: Arc<MongoConnectionManager>,
    retry: RetryPolicy,
    cache: Option<Arc<QueryCache>>,
    cache_ttl_minutes: u64,
    monitor: Option<Arc<PerformanceMonitor>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> MongoRepository<E> {
    pub fn new(manager: Arc<MongoConnectionManager>) -> Self {
        Self {
            manager,
            retry: RetryPolicy::default(),
            cache: None,
            cache_ttl_minutes: 0,
            monitor: None,
            _entity: PhantomData,
        }
    }

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

    fn collection(&self) -> Collection<E> {
        self.manager.database().collection::<E>(E::table())
    }

    fn id_filter(id: &E::Key) -> DalResult<Document> {
        let bson = to_bson(id)
            .map_err(|err| DataAccessError::validation(format!("key failed to serialize: {err}")))?;
        Ok(doc! { (E::id_field()): bson })
    }

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

    async fn cached_read<T, F, Fut>(&self, key: String, fetch: F) -> DalResult<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
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

    fn soft_delete_update(deleted_by: &str) -> DalResult<Document> {
        let fields = E::soft_delete_fields().ok_or_else(|| {
            DataAccessError::validation(format!(
                "{} does not declare soft-delete fields",
                E::type_name()
            ))
        })?;
        Ok(doc! {
            "$set": {
                fields.flag: true,
                fields.deleted_at: Utc::now().to_rfc3339(),
                fields.deleted_by: deleted_by,
            }
        })
    }

    /// Mark several documents deleted in one round trip.
    pub async fn soft_delete_range(&self, ids: &[E::Key], deleted_by: &str) -> DalResult<u64> {
        let update = Self::soft_delete_update(deleted_by)?;
        let id_values: Vec<Bson> = ids
            .iter()
            .map(|id| {
                to_bson(id).map_err(|err| {
                    DataAccessError::validation(format!("key failed to serialize: {err}"))
                })
            })
            .collect::<DalResult<_>>()?;
        let filter = doc! { (E::id_field()): { "$in": id_values } };

        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        let affected = self
            .run("soft_delete_range", Idempotency::NonIdempotent, move || {
                let collection = collection.clone();
                let filter = filter.clone();
                let update = update.clone();
                let manager = Arc::clone(&manager);
                async move {
                    with_timeout("soft_delete_range", timeout, async {
                        let result = collection
                            .update_many(filter, update)
                            .await
                            .map_err(|err| {
                                map_mongo_error("soft_delete_range", manager.descriptor(), err)
                            })?;
                        Ok(result.modified_count)
                    })
                    .await
                }
            })
            .await?;
        self.invalidate_cache().await;
        Ok(affected)
    }
}

#[async_trait]
impl<E: Entity> Repository<E> for MongoRepository<E> {
    fn engine(&self) -> EngineKind {
        EngineKind::Mongo
    }

    async fn get_all(&self) -> DalResult<Vec<E>> {
        let key = query_key::<E>("get_all", &Value::Null);
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        self.cached_read(key, || {
            self.run("get_all", Idempotency::Idempotent, move || {
                let collection = collection.clone();
                let manager = Arc::clone(&manager);
                async move {
                    with_timeout("get_all", timeout, async {
                        let cursor = collection
                            .find(Document::new())
                            .await
                            .map_err(|err| map_mongo_error("get_all", manager.descriptor(), err))?;
                        cursor
                            .try_collect::<Vec<E>>()
                            .await
                            .map_err(|err| map_mongo_error("get_all", manager.descriptor(), err))
                    })
                    .await
                }
            })
        })
        .await
    }

    async fn get_by_id(&self, id: &E::Key) -> DalResult<Option<E>> {
        let key = query_key::<E>("get_by_id", &Value::String(id.to_string()));
        let filter = Self::id_filter(id)?;
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        self.cached_read(key, || {
            self.run("get_by_id", Idempotency::Idempotent, move || {
                let collection = collection.clone();
                let filter = filter.clone();
                let manager = Arc::clone(&manager);
                async move {
                    with_timeout("get_by_id", timeout, async {
                        collection
                            .find_one(filter)
                            .await
                            .map_err(|err| map_mongo_error("get_by_id", manager.descriptor(), err))
                    })
                    .await
                }
            })
        })
        .await
    }

    async fn get_by_condition(&self, filter: &Filter) -> DalResult<Vec<E>> {
        let key = condition_key::<E>("get_by_condition", filter);
        let query = render(filter)?;
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        self.cached_read(key, || {
            self.run("get_by_condition", Idempotency::Idempotent, move || {
                let collection = collection.clone();
                let query = query.clone();
                let manager = Arc::clone(&manager);
                async move {
                    with_timeout("get_by_condition", timeout, async {
                        let cursor = collection.find(query).await.map_err(|err| {
                            map_mongo_error("get_by_condition", manager.descriptor(), err)
                        })?;
                        cursor.try_collect::<Vec<E>>().await.map_err(|err| {
                            map_mongo_error("get_by_condition", manager.descriptor(), err)
                        })
                    })
                    .await
                }
            })
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
        let key = condition_key::<E>("exists", filter);
        let query = render(filter)?;
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        self.cached_read(key, || {
            self.run("exists", Idempotency::Idempotent, move || {
                let collection = collection.clone();
                let query = query.clone();
                let manager = Arc::clone(&manager);
                async move {
                    with_timeout("exists", timeout, async {
                        let found = collection
                            .find_one(query)
                            .await
                            .map_err(|err| map_mongo_error("exists", manager.descriptor(), err))?;
                        Ok(found.is_some())
                    })
                    .await
                }
            })
        })
        .await
    }

    async fn count(&self, filter: Option<&Filter>) -> DalResult<u64> {
        let key = match filter {
            Some(filter) => condition_key::<E>("count", filter),
            None => query_key::<E>("count", &Value::Null),
        };
        let query = match filter {
            Some(filter) => render(filter)?,
            None => Document::new(),
        };
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        self.cached_read(key, || {
            self.run("count", Idempotency::Idempotent, move || {
                let collection = collection.clone();
                let query = query.clone();
                let manager = Arc::clone(&manager);
                async move {
                    with_timeout("count", timeout, async {
                        collection
                            .count_documents(query)
                            .await
                            .map_err(|err| map_mongo_error("count", manager.descriptor(), err))
                    })
                    .await
                }
            })
        })
        .await
    }

    async fn add(&self, entity: &E) -> DalResult<()> {
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        self.run("add", Idempotency::NonIdempotent, move || {
            let collection = collection.clone();
            let manager = Arc::clone(&manager);
            async move {
                with_timeout("add", timeout, async {
                    collection
                        .insert_one(entity)
                        .await
                        .map(|_| ())
                        .map_err(|err| map_mongo_error("add", manager.descriptor(), err))
                })
                .await
            }
        })
        .await?;
        self.invalidate_cache().await;
        Ok(())
    }

    async fn add_range(&self, entities: &[E]) -> DalResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        self.run("add_range", Idempotency::NonIdempotent, move || {
            let collection = collection.clone();
            let manager = Arc::clone(&manager);
            async move {
                with_timeout("add_range", timeout, async {
                    collection
                        .insert_many(entities)
                        .await
                        .map(|_| ())
                        .map_err(|err| map_mongo_error("add_range", manager.descriptor(), err))
                })
                .await
            }
        })
        .await?;
        self.invalidate_cache().await;
        Ok(())
    }

    async fn add_batched(&self, entities: &[E], batch_size: usize) -> DalResult<()> {
        if batch_size == 0 {
            return Err(DataAccessError::validation("batch_size must be at least 1"));
        }
        if entities.is_empty() {
            return Ok(());
        }
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        for (index, chunk) in entities.chunks(batch_size).enumerate() {
            self.run("add_batched", Idempotency::NonIdempotent, || {
                let collection = collection.clone();
                let manager = Arc::clone(&manager);
                async move {
                    with_timeout("add_batched", timeout, async {
                        collection
                            .insert_many(chunk)
                            .await
                            .map(|_| ())
                            .map_err(|err| map_mongo_error("add_batched", manager.descriptor(), err))
                    })
                    .await
                }
            })
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
        let filter = Self::id_filter(&entity.id())?;
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        self.run("update", Idempotency::NonIdempotent, move || {
            let collection = collection.clone();
            let filter = filter.clone();
            let manager = Arc::clone(&manager);
            async move {
                with_timeout("update", timeout, async {
                    collection
                        .replace_one(filter, entity)
                        .await
                        .map(|_| ())
                        .map_err(|err| map_mongo_error("update", manager.descriptor(), err))
                })
                .await
            }
        })
        .await?;
        self.invalidate_cache().await;
        Ok(())
    }

    async fn update_partial(&self, entity: &E, fields: &[&str]) -> DalResult<()> {
        if fields.is_empty() {
            return Err(DataAccessError::validation(
                "update requires at least one field",
            ));
        }
        let row = serde_json::to_value(entity).map_err(|err| {
            DataAccessError::validation(format!("{} failed to serialize: {err}", E::type_name()))
        })?;
        let Value::Object(row) = row else {
            return Err(DataAccessError::validation(format!(
                "{} does not serialize to a flat record",
                E::type_name()
            )));
        };

        let mut set = Document::new();
        for field in fields {
            ensure_valid_identifier(field)?;
            if *field == E::id_field() {
                return Err(DataAccessError::validation(
                    "the identity field cannot be updated",
                ));
            }
            let value = row.get(*field).ok_or_else(|| {
                DataAccessError::validation(format!("unknown field '{field}' in update"))
            })?;
            let bson = to_bson(value).map_err(|err| {
                DataAccessError::validation(format!(
                    "field '{field}' does not convert to BSON: {err}"
                ))
            })?;
            set.insert(*field, bson);
        }

        let filter = Self::id_filter(&entity.id())?;
        let update = doc! { "$set": set };
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        self.run("update_partial", Idempotency::NonIdempotent, move || {
            let collection = collection.clone();
            let filter = filter.clone();
            let update = update.clone();
            let manager = Arc::clone(&manager);
            async move {
                with_timeout("update_partial", timeout, async {
                    collection
                        .update_one(filter, update)
                        .await
                        .map(|_| ())
                        .map_err(|err| map_mongo_error("update_partial", manager.descriptor(), err))
                })
                .await
            }
        })
        .await?;
        self.invalidate_cache().await;
        Ok(())
    }

    async fn update_range(&self, entities: &[E]) -> DalResult<()> {
        for entity in entities {
            self.update(entity).await?;
        }
        Ok(())
    }

    async fn delete(&self, entity: &E) -> DalResult<()> {
        self.delete_by_id(&entity.id()).await.map(|_| ())
    }

    async fn delete_by_id(&self, id: &E::Key) -> DalResult<bool> {
        // Entities with soft-delete fields get the marker written instead.
        if E::soft_delete_fields().is_some() {
            return self.soft_delete(id, "system").await;
        }
        let filter = Self::id_filter(id)?;
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        let deleted = self
            .run("delete_by_id", Idempotency::NonIdempotent, move || {
                let collection = collection.clone();
                let filter = filter.clone();
                let manager = Arc::clone(&manager);
                async move {
                    with_timeout("delete_by_id", timeout, async {
                        let result = collection.delete_one(filter).await.map_err(|err| {
                            map_mongo_error("delete_by_id", manager.descriptor(), err)
                        })?;
                        Ok(result.deleted_count > 0)
                    })
                    .await
                }
            })
            .await?;
        self.invalidate_cache().await;
        Ok(deleted)
    }

    async fn delete_by_condition(&self, filter: &Filter) -> DalResult<u64> {
        let query = render(filter)?;
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        let affected = self
            .run("delete_by_condition", Idempotency::NonIdempotent, move || {
                let collection = collection.clone();
                let query = query.clone();
                let manager = Arc::clone(&manager);
                async move {
                    with_timeout("delete_by_condition", timeout, async {
                        let result = collection.delete_many(query).await.map_err(|err| {
                            map_mongo_error("delete_by_condition", manager.descriptor(), err)
                        })?;
                        Ok(result.deleted_count)
                    })
                    .await
                }
            })
            .await?;
        self.invalidate_cache().await;
        debug!(affected, entity = E::type_name(), "conditional delete");
        Ok(affected)
    }

    async fn delete_batched(&self, entities: &[E], batch_size: usize) -> DalResult<()> {
        if batch_size == 0 {
            return Err(DataAccessError::validation("batch_size must be at least 1"));
        }
        if entities.is_empty() {
            return Ok(());
        }
        for chunk in entities.chunks(batch_size) {
            let ids: Vec<Value> = chunk
                .iter()
                .map(|e| serde_json::to_value(e.id()))
                .collect::<Result<_, _>>()
                .map_err(|err| {
                    DataAccessError::validation(format!("key failed to serialize: {err}"))
                })?;
            let filter = Filter::by(Cond {
                field: E::id_field().to_string(),
                op: Op::In,
                value: Value::Array(ids),
            });
            self.delete_by_condition(&filter).await?;
        }
        Ok(())
    }

    async fn soft_delete(&self, id: &E::Key, deleted_by: &str) -> DalResult<bool> {
        let update = Self::soft_delete_update(deleted_by)?;
        let filter = Self::id_filter(id)?;
        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        let modified = self
            .run("soft_delete", Idempotency::NonIdempotent, move || {
                let collection = collection.clone();
                let filter = filter.clone();
                let update = update.clone();
                let manager = Arc::clone(&manager);
                async move {
                    with_timeout("soft_delete", timeout, async {
                        let result = collection.update_one(filter, update).await.map_err(|err| {
                            map_mongo_error("soft_delete", manager.descriptor(), err)
                        })?;
                        Ok(result.modified_count > 0)
                    })
                    .await
                }
            })
            .await?;
        self.invalidate_cache().await;
        Ok(modified)
    }

    async fn execute_in_transaction(&self, action: TxAction<'_, E>) -> DalResult<()> {
        let started = Instant::now();

        let mut session = self.manager.client().start_session().await.map_err(|err| {
            map_mongo_error("start_session", self.manager.descriptor(), err)
        })?;
        session.start_transaction().await.map_err(|err| {
            map_mongo_error("start_transaction", self.manager.descriptor(), err)
        })?;

        let result = {
            let mut scope = MongoTransactionScope::<E> {
                collection: self.collection(),
                manager: Arc::clone(&self.manager),
                session: &mut session,
                _entity: PhantomData,
            };
            action(&mut scope).await
        };

        let result = match result {
            Ok(()) => session.commit_transaction().await.map_err(|err| {
                map_mongo_error("commit_transaction", self.manager.descriptor(), err)
            }),
            Err(err) => {
                // Abort on any failure inside the block; dropping the
                // session would also abort server-side.
                if let Err(abort_err) = session.abort_transaction().await {
                    warn!(error = %abort_err, "abort after failed transaction also failed");
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

/// Write surface bound to one open client session.
pub struct MongoTransactionScope<'t, E: Entity> {
    collection: Collection<E>,
    manager: Arc<MongoConnectionManager>,
    session: &'t mut ClientSession,
    _entity: PhantomData<fn() -> E>,
}

#[async_trait]
impl<'t, E: Entity> TransactionScope<E> for MongoTransactionScope<'t, E> {
    async fn add(&mut self, entity: &E) -> DalResult<()> {
        self.collection
            .insert_one(entity)
            .session(&mut *self.session)
            .await
            .map(|_| ())
            .map_err(|err| map_mongo_error("tx.add", self.manager.descriptor(), err))
    }

    async fn add_range(&mut self, entities: &[E]) -> DalResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        self.collection
            .insert_many(entities)
            .session(&mut *self.session)
            .await
            .map(|_| ())
            .map_err(|err| map_mongo_error("tx.add_range", self.manager.descriptor(), err))
    }

    async fn update(&mut self, entity: &E) -> DalResult<()> {
        let filter = MongoRepository::<E>::id_filter(&entity.id())?;
        self.collection
            .replace_one(filter, entity)
            .session(&mut *self.session)
            .await
            .map(|_| ())
            .map_err(|err| map_mongo_error("tx.update", self.manager.descriptor(), err))
    }

    async fn delete_by_id(&mut self, id: &E::Key) -> DalResult<bool> {
        let filter = MongoRepository::<E>::id_filter(id)?;
        let result = self
            .collection
            .delete_one(filter)
            .session(&mut *self.session)
            .await
            .map_err(|err| map_mongo_error("tx.delete_by_id", self.manager.descriptor(), err))?;
        Ok(result.deleted_count > 0)
    }

    async fn delete_by_condition(&mut self, filter: &Filter) -> DalResult<u64> {
        let query = render(filter)?;
        let result = self
            .collection
            .delete_many(query)
            .session(&mut *self.session)
            .await
            .map_err(|err| {
                map_mongo_error("tx.delete_by_condition", self.manager.descriptor(), err)
            })?;
        Ok(result.deleted_count)
    }

    async fn get_by_id(&mut self, id: &E::Key) -> DalResult<Option<E>> {
        let filter = MongoRepository::<E>::id_filter(id)?;
        self.collection
            .find_one(filter)
            .session(&mut *self.session)
            .await
            .map_err(|err| map_mongo_error("tx.get_by_id", self.manager.descriptor(), err))
    }
}

impl<E: Entity> MongoRepository<E> {
    async fn paged_query(
        &self,
        name: &'static str,
        filter: Option<&Filter>,
        page: &PageRequest,
    ) -> DalResult<PagedResult<E>> {
        let key = paged_key::<E>(name, page, filter);
        let query = match filter {
            Some(filter) => render(filter)?,
            None => Document::new(),
        };
        let order_field = page.order_field().unwrap_or_else(|| E::id_field());
        ensure_valid_identifier(order_field)?;
        let sort = doc! { order_field: if page.is_descending() { -1 } else { 1 } };

        let collection = self.collection();
        let timeout = self.manager.command_timeout();
        let manager = Arc::clone(&self.manager);
        let page_req = page.clone();

        self.cached_read(key, move || async move {
            self.run(name, Idempotency::Idempotent, move || {
                let collection = collection.clone();
                let query = query.clone();
                let sort = sort.clone();
                let page = page_req.clone();
                let manager = Arc::clone(&manager);
                async move {
                    with_timeout(name, timeout, async {
                        let total = collection
                            .count_documents(query.clone())
                            .await
                            .map_err(|err| map_mongo_error(name, manager.descriptor(), err))?;
                        let cursor = collection
                            .find(query)
                            .sort(sort)
                            .skip(page.offset())
                            .limit(i64::from(page.limit()))
                            .await
                            .map_err(|err| map_mongo_error(name, manager.descriptor(), err))?;
                        let items = cursor
                            .try_collect::<Vec<E>>()
                            .await
                            .map_err(|err| map_mongo_error(name, manager.descriptor(), err))?;
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
