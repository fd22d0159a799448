//! The uniform repository contract.
//!
//! One trait per entity type, implemented once per engine binding.
//! Callers depend only on this trait (usually as `Box<dyn Repository<E>>`
//! from the factory) and never downcast to an engine-specific type.
//!
//! Absence is a value: `get_by_id` returns `Ok(None)` for a missing row,
//! deletes report affected counts. Errors always come from the
//! [`DataAccessError`] taxonomy, never a raw driver type.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::descriptor::EngineKind;
use crate::entity::Entity;
use crate::error::{DalResult, DataAccessError};
use crate::filter::Filter;
use crate::page::{PagedResult, PageRequest};

/// Write surface available inside a transaction. Operations observe
/// read-your-writes consistency as provided by the underlying transaction.
#[async_trait]
pub trait TransactionScope<E: Entity>: Send {
    async fn add(&mut self, entity: &E) -> DalResult<()>;

    async fn add_range(&mut self, entities: &[E]) -> DalResult<()>;

    async fn update(&mut self, entity: &E) -> DalResult<()>;

    async fn delete_by_id(&mut self, id: &E::Key) -> DalResult<bool>;

    async fn delete_by_condition(&mut self, filter: &Filter) -> DalResult<u64>;

    async fn get_by_id(&mut self, id: &E::Key) -> DalResult<Option<E>>;
}

/// Boxed transaction body: borrows the scope, returns a boxed future tied
/// to that borrow.
pub type TxAction<'a, E> = TxActionWith<'a, E, ()>;

/// Transaction body producing a value; see [`transact`].
pub type TxActionWith<'a, E, T> = Box<
    dyn for<'t> FnOnce(&'t mut (dyn TransactionScope<E> + 't)) -> BoxFuture<'t, DalResult<T>>
        + Send
        + 'a,
>;

/// CRUD, paging and transactions over one entity type.
#[async_trait]
pub trait Repository<E: Entity>: Send + Sync {
    /// Engine this repository is bound to.
    fn engine(&self) -> EngineKind;

    // -- reads ------------------------------------------------------------

    async fn get_all(&self) -> DalResult<Vec<E>>;

    /// `Ok(None)` when no row matches; absence is not an error.
    async fn get_by_id(&self, id: &E::Key) -> DalResult<Option<E>>;

    async fn get_by_condition(&self, filter: &Filter) -> DalResult<Vec<E>>;

    /// Page through all rows. Ordering falls back to the identity field
    /// when the request names none, keeping pagination deterministic.
    async fn get_paged(&self, page: &PageRequest) -> DalResult<PagedResult<E>>;

    async fn get_paged_by_condition(
        &self,
        filter: &Filter,
        page: &PageRequest,
    ) -> DalResult<PagedResult<E>>;

    async fn exists(&self, filter: &Filter) -> DalResult<bool>;

    async fn count(&self, filter: Option<&Filter>) -> DalResult<u64>;

    // -- writes -----------------------------------------------------------

    async fn add(&self, entity: &E) -> DalResult<()>;

    async fn add_range(&self, entities: &[E]) -> DalResult<()>;

    /// Insert in sequential chunks of `batch_size` to bound per-call
    /// payloads and driver parameter limits. Input order is preserved
    /// across chunks; a failure points at the offending chunk.
    async fn add_batched(&self, entities: &[E], batch_size: usize) -> DalResult<()>;

    async fn update(&self, entity: &E) -> DalResult<()>;

    /// Write only the named fields of `entity`.
    async fn update_partial(&self, entity: &E, fields: &[&str]) -> DalResult<()>;

    async fn update_range(&self, entities: &[E]) -> DalResult<()>;

    async fn delete(&self, entity: &E) -> DalResult<()>;

    /// Returns whether a row was affected. Entities declaring
    /// soft-delete fields get the marker written instead of a physical
    /// delete.
    async fn delete_by_id(&self, id: &E::Key) -> DalResult<bool>;

    async fn delete_by_condition(&self, filter: &Filter) -> DalResult<u64>;

    /// Delete in sequential chunks, mirroring `add_batched`.
    async fn delete_batched(&self, entities: &[E], batch_size: usize) -> DalResult<()>;

    /// Mark a row deleted (flag + timestamp + actor) without removing it.
    /// Requires the entity to declare [`soft_delete_fields`]
    /// (`Validation` error otherwise).
    ///
    /// [`soft_delete_fields`]: crate::entity::Entity::soft_delete_fields
    async fn soft_delete(&self, id: &E::Key, deleted_by: &str) -> DalResult<bool>;

    // -- transactions -----------------------------------------------------

    /// Run `action` inside a transaction: commit on success, roll back and
    /// propagate on any error. Callers never pair begin/commit/rollback by
    /// hand, and a future dropped mid-transaction rolls back.
    async fn execute_in_transaction(&self, action: TxAction<'_, E>) -> DalResult<()>;
}

/// Run a transaction that produces a value.
///
/// Wraps [`Repository::execute_in_transaction`], smuggling the closure's
/// result out through a slot.
pub async fn transact<E, R, T>(repo: &R, action: TxActionWith<'_, E, T>) -> DalResult<T>
where
    E: Entity,
    R: Repository<E> + ?Sized,
    T: Send + 'static,
{
    let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    let slot_in = Arc::clone(&slot);

    repo.execute_in_transaction(Box::new(move |scope| {
        let fut = action(scope);
        Box::pin(async move {
            let value = fut.await?;
            *slot_in.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
            Ok(())
        })
    }))
    .await?;

    let result = slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .ok_or_else(|| {
            DataAccessError::backend_msg(
                "execute_in_transaction",
                "transaction completed without producing a result",
            )
        });
    result
}
