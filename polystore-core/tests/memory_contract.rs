//! Contract tests against an in-memory reference implementation.
//!
//! Proves the repository trait stays object-safe (everything below goes
//! through `Box<dyn Repository<_>>`), that `transact` round-trips a
//! value, and that the paging/filter models behave without any driver.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use polystore_core::{
    transact, Cond, DalResult, DataAccessError, EngineKind, Entity, Filter, Op, PagedResult,
    PageRequest, Repository, TransactionScope, TxAction,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: String,
    name: String,
    age: i64,
}

impl Entity for User {
    type Key = String;

    fn table() -> &'static str {
        "users"
    }

    fn id(&self) -> String {
        self.id.clone()
    }
}

fn user(id: &str, age: i64) -> User {
    User {
        id: id.to_string(),
        name: format!("user-{id}"),
        age,
    }
}

fn matches<E: Entity>(entity: &E, filter: &Filter) -> DalResult<bool> {
    use polystore_core::Node;

    fn eval(row: &serde_json::Map<String, Value>, node: &Node) -> DalResult<bool> {
        match node {
            Node::And(nodes) => nodes.iter().try_fold(true, |acc, n| Ok(acc && eval(row, n)?)),
            Node::Or(nodes) => nodes.iter().try_fold(false, |acc, n| Ok(acc || eval(row, n)?)),
            Node::Cond(Cond { field, op, value }) => {
                let cell = row.get(field).unwrap_or(&Value::Null);
                Ok(match op {
                    Op::Eq => cell == value,
                    Op::Ne => cell != value,
                    Op::Gt | Op::Ge | Op::Lt | Op::Le => {
                        let (a, b) = match (cell.as_f64(), value.as_f64()) {
                            (Some(a), Some(b)) => (a, b),
                            _ => return Ok(false),
                        };
                        match op {
                            Op::Gt => a > b,
                            Op::Ge => a >= b,
                            Op::Lt => a < b,
                            _ => a <= b,
                        }
                    }
                    Op::In => value.as_array().map(|vs| vs.contains(cell)).unwrap_or(false),
                    Op::IsNull => cell.is_null(),
                    Op::NotNull => !cell.is_null(),
                    Op::Like => {
                        return Err(DataAccessError::validation("LIKE unsupported in memory"))
                    }
                })
            }
        }
    }

    let Some(root) = &filter.root else {
        return Ok(true);
    };
    let Value::Object(row) = serde_json::to_value(entity)
        .map_err(|e| DataAccessError::validation(e.to_string()))?
    else {
        return Err(DataAccessError::validation("not a record"));
    };
    eval(&row, root)
}

struct MemoryRepository<E: Entity> {
    rows: Arc<Mutex<Vec<E>>>,
}

impl<E: Entity> MemoryRepository<E> {
    fn new() -> Self {
        Self {
            rows: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn snapshot(&self) -> Vec<E>
    where
        E: Clone,
    {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct MemoryScope<E: Entity> {
    working: Vec<E>,
}

#[async_trait]
impl<E: Entity + Clone> TransactionScope<E> for MemoryScope<E> {
    async fn add(&mut self, entity: &E) -> DalResult<()> {
        self.working.push(entity.clone());
        Ok(())
    }

    async fn add_range(&mut self, entities: &[E]) -> DalResult<()> {
        self.working.extend_from_slice(entities);
        Ok(())
    }

    async fn update(&mut self, entity: &E) -> DalResult<()> {
        for row in &mut self.working {
            if row.id() == entity.id() {
                *row = entity.clone();
            }
        }
        Ok(())
    }

    async fn delete_by_id(&mut self, id: &E::Key) -> DalResult<bool> {
        let before = self.working.len();
        self.working.retain(|r| r.id() != *id);
        Ok(self.working.len() < before)
    }

    async fn delete_by_condition(&mut self, filter: &Filter) -> DalResult<u64> {
        let before = self.working.len();
        let mut kept = Vec::with_capacity(before);
        for row in self.working.drain(..) {
            if matches(&row, filter)? {
                continue;
            }
            kept.push(row);
        }
        self.working = kept;
        Ok((before - self.working.len()) as u64)
    }

    async fn get_by_id(&mut self, id: &E::Key) -> DalResult<Option<E>> {
        Ok(self.working.iter().find(|r| r.id() == *id).cloned())
    }
}

#[async_trait]
impl<E: Entity + Clone + PartialEq> Repository<E> for MemoryRepository<E> {
    fn engine(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    async fn get_all(&self) -> DalResult<Vec<E>> {
        Ok(self.snapshot())
    }

    async fn get_by_id(&self, id: &E::Key) -> DalResult<Option<E>> {
        Ok(self.snapshot().into_iter().find(|r| r.id() == *id))
    }

    async fn get_by_condition(&self, filter: &Filter) -> DalResult<Vec<E>> {
        let mut out = Vec::new();
        for row in self.snapshot() {
            if matches(&row, filter)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    async fn get_paged(&self, page: &PageRequest) -> DalResult<PagedResult<E>> {
        let all = self.snapshot();
        let total = all.len() as u64;
        let items: Vec<E> = all
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect();
        Ok(PagedResult::new(items, total, page))
    }

    async fn get_paged_by_condition(
        &self,
        filter: &Filter,
        page: &PageRequest,
    ) -> DalResult<PagedResult<E>> {
        let all = self.get_by_condition(filter).await?;
        let total = all.len() as u64;
        let items: Vec<E> = all
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect();
        Ok(PagedResult::new(items, total, page))
    }

    async fn exists(&self, filter: &Filter) -> DalResult<bool> {
        Ok(!self.get_by_condition(filter).await?.is_empty())
    }

    async fn count(&self, filter: Option<&Filter>) -> DalResult<u64> {
        match filter {
            Some(filter) => Ok(self.get_by_condition(filter).await?.len() as u64),
            None => Ok(self.snapshot().len() as u64),
        }
    }

    async fn add(&self, entity: &E) -> DalResult<()> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entity.clone());
        Ok(())
    }

    async fn add_range(&self, entities: &[E]) -> DalResult<()> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(entities);
        Ok(())
    }

    async fn add_batched(&self, entities: &[E], batch_size: usize) -> DalResult<()> {
        if batch_size == 0 {
            return Err(DataAccessError::validation("batch_size must be at least 1"));
        }
        for chunk in entities.chunks(batch_size) {
            self.add_range(chunk).await?;
        }
        Ok(())
    }

    async fn update(&self, entity: &E) -> DalResult<()> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        for row in rows.iter_mut() {
            if row.id() == entity.id() {
                *row = entity.clone();
            }
        }
        Ok(())
    }

    async fn update_partial(&self, entity: &E, _fields: &[&str]) -> DalResult<()> {
        self.update(entity).await
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
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|r| r.id() != *id);
        Ok(rows.len() < before)
    }

    async fn delete_by_condition(&self, filter: &Filter) -> DalResult<u64> {
        let survivors = {
            let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            rows.clone()
        };
        let mut kept = Vec::with_capacity(survivors.len());
        let mut removed = 0u64;
        for row in survivors {
            if matches(&row, filter)? {
                removed += 1;
            } else {
                kept.push(row);
            }
        }
        *self.rows.lock().unwrap_or_else(PoisonError::into_inner) = kept;
        Ok(removed)
    }

    async fn delete_batched(&self, entities: &[E], batch_size: usize) -> DalResult<()> {
        if batch_size == 0 {
            return Err(DataAccessError::validation("batch_size must be at least 1"));
        }
        for entity in entities {
            self.delete_by_id(&entity.id()).await?;
        }
        Ok(())
    }

    async fn soft_delete(&self, _id: &E::Key, _deleted_by: &str) -> DalResult<bool> {
        Err(DataAccessError::validation(
            "memory reference store has no soft delete",
        ))
    }

    async fn execute_in_transaction(&self, action: TxAction<'_, E>) -> DalResult<()> {
        let working = self.snapshot();
        let mut scope = MemoryScope { working };
        action(&mut scope).await?;
        *self.rows.lock().unwrap_or_else(PoisonError::into_inner) = scope.working;
        Ok(())
    }
}

fn boxed_repo() -> Box<dyn Repository<User>> {
    Box::new(MemoryRepository::<User>::new())
}

#[tokio::test]
async fn trait_is_object_safe_and_usable_through_dyn() {
    let repo = boxed_repo();

    repo.add(&user("a", 30)).await.unwrap();
    repo.add_range(&[user("b", 40), user("c", 50)]).await.unwrap();

    assert_eq!(repo.count(None).await.unwrap(), 3);
    assert_eq!(repo.get_by_id(&"b".to_string()).await.unwrap(), Some(user("b", 40)));
    assert_eq!(repo.get_by_id(&"zz".to_string()).await.unwrap(), None);

    let adults = Filter::by(Cond::ge("age", 40));
    assert_eq!(repo.get_by_condition(&adults).await.unwrap().len(), 2);
    assert_eq!(repo.delete_by_condition(&adults).await.unwrap(), 2);
    assert_eq!(repo.count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn paging_through_dyn_respects_clamps() {
    let repo = boxed_repo();
    let users: Vec<User> = (0..15).map(|i| user(&format!("u{i:02}"), i)).collect();
    repo.add_batched(&users, 4).await.unwrap();

    let page = repo.get_paged(&PageRequest::new(2, 10)).await.unwrap();
    assert_eq!(page.total_count, 15);
    assert_eq!(page.total_pages(), 2);
    assert_eq!(page.items.len(), 5);

    let clamped = repo.get_paged(&PageRequest::new(0, 0)).await.unwrap();
    assert_eq!(clamped.page_index, 1);
    assert_eq!(clamped.page_size, 1);
    assert_eq!(clamped.items.len(), 1);
}

#[tokio::test]
async fn failed_transaction_discards_all_writes() {
    let repo = boxed_repo();
    repo.add(&user("keep", 1)).await.unwrap();

    let result = repo
        .execute_in_transaction(Box::new(|scope| {
            Box::pin(async move {
                scope.add(&user("x", 2)).await?;
                scope.add(&user("y", 3)).await?;
                Err(DataAccessError::validation("boom"))
            })
        }))
        .await;
    assert!(result.is_err());
    assert_eq!(repo.count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn transact_returns_the_closure_value() {
    let repo = boxed_repo();

    let id: String = transact(
        repo.as_ref(),
        Box::new(|scope| {
            Box::pin(async move {
                let u = user("t", 9);
                scope.add(&u).await?;
                Ok(u.id)
            })
        }),
    )
    .await
    .unwrap();

    assert_eq!(id, "t");
    assert_eq!(repo.count(None).await.unwrap(), 1);
}
