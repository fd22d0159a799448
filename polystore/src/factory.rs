//! Repository factory.
//!
//! An explicit registry constructed at startup and shared by handle, with
//! no ambient globals. The factory owns one connection manager per engine
//! kind for the life of the process; repositories it hands out borrow
//! those managers through `Arc`s. The factory itself holds no per-call
//! state and a single instance is safe to share across all callers.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use polystore_core::{
    ConnectionDescriptor, ConnectionManager, ConnectionPoolStatus, DalResult, DataAccessError,
    EngineKind, Entity, PerformanceMonitor, QueryCache, Repository, RetryPolicy,
};

use crate::mongo::{MongoConnectionManager, MongoRepository};
use crate::sql::{SqlConnectionManager, SqlRepository};

type StrategyKey = (TypeId, TypeId, EngineKind);
type BoxedAny = Box<dyn Any + Send + Sync>;
type Strategy = Arc<dyn Fn() -> BoxedAny + Send + Sync>;

/// Creates repositories bound to a target engine kind.
pub struct RepositoryFactory {
    default_engine: EngineKind,
    sql_managers: RwLock<HashMap<EngineKind, Arc<SqlConnectionManager>>>,
    mongo_manager: RwLock<Option<Arc<MongoConnectionManager>>>,
    strategies: RwLock<HashMap<StrategyKey, Strategy>>,
    cache: Option<Arc<QueryCache>>,
    monitor: Option<Arc<PerformanceMonitor>>,
    cache_ttl_minutes: u64,
    retry: RetryPolicy,
}

impl RepositoryFactory {
    pub fn new(default_engine: EngineKind) -> Self {
        Self {
            default_engine,
            sql_managers: RwLock::new(HashMap::new()),
            mongo_manager: RwLock::new(None),
            strategies: RwLock::new(HashMap::new()),
            cache: None,
            monitor: None,
            cache_ttl_minutes: 0,
            retry: RetryPolicy::default(),
        }
    }

    /// Share a query cache with every repository this factory builds.
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

    pub fn default_engine(&self) -> EngineKind {
        self.default_engine
    }

    /// Connect a manager for the descriptor's engine kind. Re-registering
    /// a kind replaces the prior manager.
    pub async fn register_engine(&self, descriptor: ConnectionDescriptor) -> DalResult<()> {
        let kind = descriptor.engine();
        match kind {
            EngineKind::Mongo => {
                let manager = MongoConnectionManager::connect(descriptor).await?;
                *self
                    .mongo_manager
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(manager));
            }
            _ => {
                let manager = SqlConnectionManager::connect(descriptor).await?;
                self.sql_managers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(kind, Arc::new(manager));
            }
        }
        info!(engine = %kind, "registered engine");
        Ok(())
    }

    pub fn is_engine_registered(&self, kind: EngineKind) -> bool {
        match kind {
            EngineKind::Mongo => self
                .mongo_manager
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some(),
            _ => self
                .sql_managers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&kind),
        }
    }

    /// Register a creation strategy for one `(entity, key, engine)`
    /// binding. Re-registering the same key replaces the prior strategy,
    /// which is what test overrides want.
    pub fn register_strategy<E, F>(&self, engine: EngineKind, creator: F)
    where
        E: Entity,
        F: Fn() -> Box<dyn Repository<E>> + Send + Sync + 'static,
    {
        let key = (TypeId::of::<E>(), TypeId::of::<E::Key>(), engine);
        let strategy: Strategy = Arc::new(move || Box::new(creator()) as BoxedAny);
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, strategy);
        info!(engine = %engine, entity = E::type_name(), "registered repository strategy");
    }

    /// Create a repository for `E` bound to `engine` (or the default).
    ///
    /// Resolution order: caller-registered strategy, then the built-in
    /// creator for the engine kind, otherwise a configuration error.
    pub fn create_repository<E: Entity>(
        &self,
        engine: Option<EngineKind>,
    ) -> DalResult<Box<dyn Repository<E>>> {
        let kind = engine.unwrap_or(self.default_engine);
        debug!(engine = %kind, entity = E::type_name(), "creating repository");

        let strategy = {
            let key = (TypeId::of::<E>(), TypeId::of::<E::Key>(), kind);
            self.strategies
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&key)
                .cloned()
        };
        if let Some(strategy) = strategy {
            return strategy()
                .downcast::<Box<dyn Repository<E>>>()
                .map(|boxed| *boxed)
                .map_err(|_| {
                    DataAccessError::configuration(format!(
                        "registered strategy for {} produced a mismatched repository type",
                        E::type_name()
                    ))
                });
        }

        match kind {
            EngineKind::Mongo => self.build_mongo::<E>(),
            _ => self.build_sql::<E>(kind),
        }
    }

    /// Create a repository bound to a relational engine; rejects the
    /// document kind.
    pub fn create_sql_repository<E: Entity>(
        &self,
        engine: Option<EngineKind>,
    ) -> DalResult<Box<dyn Repository<E>>> {
        let kind = engine.unwrap_or(self.default_engine);
        if !kind.is_relational() {
            return Err(DataAccessError::configuration(format!(
                "{kind} is not a relational engine"
            )));
        }
        self.create_repository::<E>(Some(kind))
    }

    /// Create a repository bound to the document engine.
    pub fn create_mongo_repository<E: Entity>(&self) -> DalResult<Box<dyn Repository<E>>> {
        self.create_repository::<E>(Some(EngineKind::Mongo))
    }

    /// Pool snapshots for every registered engine.
    pub async fn pool_statuses(&self) -> Vec<ConnectionPoolStatus> {
        let sql: Vec<Arc<SqlConnectionManager>> = self
            .sql_managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mongo = self
            .mongo_manager
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut statuses = Vec::with_capacity(sql.len() + 1);
        for manager in sql {
            statuses.push(manager.pool_status().await);
        }
        if let Some(manager) = mongo {
            statuses.push(manager.pool_status().await);
        }
        statuses
    }

    fn build_sql<E: Entity>(&self, kind: EngineKind) -> DalResult<Box<dyn Repository<E>>> {
        let manager = self
            .sql_managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .ok_or_else(|| {
                DataAccessError::configuration(format!("no engine registered for kind '{kind}'"))
            })?;

        let mut repository = SqlRepository::<E>::new(manager).with_retry(self.retry.clone());
        if let Some(cache) = &self.cache {
            repository = repository.with_cache(Arc::clone(cache), self.cache_ttl_minutes);
        }
        if let Some(monitor) = &self.monitor {
            repository = repository.with_monitor(Arc::clone(monitor));
        }
        Ok(Box::new(repository))
    }

    fn build_mongo<E: Entity>(&self) -> DalResult<Box<dyn Repository<E>>> {
        let manager = self
            .mongo_manager
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                DataAccessError::configuration("no engine registered for kind 'mongo'")
            })?;

        let mut repository = MongoRepository::<E>::new(manager).with_retry(self.retry.clone());
        if let Some(cache) = &self.cache {
            repository = repository.with_cache(Arc::clone(cache), self.cache_ttl_minutes);
        }
        if let Some(monitor) = &self.monitor {
            repository = repository.with_monitor(Arc::clone(monitor));
        }
        Ok(Box::new(repository))
    }
}
