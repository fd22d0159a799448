//! End-to-end repository tests against a file-backed SQLite database.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use uuid::Uuid;

use polystore::sql::SqlConnectionManager;
use polystore::{
    Cond, ConnectionDescriptor, DataAccessError, EngineKind, Entity, Filter, PageRequest,
    PerformanceMonitor, QueryCache, Repository, SoftDeleteFields, SqlRepository,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ticket {
    id: Uuid,
    title: String,
    status: String,
    priority: i64,
}

impl Entity for Ticket {
    type Key = Uuid;

    fn table() -> &'static str {
        "tickets"
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    id: String,
    body: String,
    is_deleted: bool,
    deleted_at: Option<String>,
    deleted_by: Option<String>,
}

impl Entity for Note {
    type Key = String;

    fn table() -> &'static str {
        "notes"
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn soft_delete_fields() -> Option<SoftDeleteFields> {
        Some(SoftDeleteFields::default())
    }
}

fn ticket(status: &str, priority: i64) -> Ticket {
    Ticket {
        id: Uuid::new_v4(),
        title: format!("ticket-{priority}"),
        status: status.to_string(),
        priority,
    }
}

struct Harness {
    _dir: TempDir,
    manager: Arc<SqlConnectionManager>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("repo.db");
        let descriptor = ConnectionDescriptor::builder(EngineKind::Sqlite)
            .database(path.to_string_lossy())
            .min_pool_size(1)
            .max_pool_size(4)
            .build()
            .expect("descriptor");

        let manager = Arc::new(
            SqlConnectionManager::connect(descriptor)
                .await
                .expect("connect"),
        );

        for ddl in [
            "CREATE TABLE tickets (id TEXT PRIMARY KEY, priority BIGINT NOT NULL, \
             status TEXT NOT NULL, title TEXT NOT NULL)",
            "CREATE TABLE notes (id TEXT PRIMARY KEY, body TEXT NOT NULL, \
             deleted_at TEXT, deleted_by TEXT, is_deleted BOOLEAN NOT NULL)",
        ] {
            sqlx::query(ddl)
                .execute(manager.pool())
                .await
                .expect("create table");
        }

        Self { _dir: dir, manager }
    }

    fn tickets(&self) -> SqlRepository<Ticket> {
        SqlRepository::new(Arc::clone(&self.manager))
    }

    fn notes(&self) -> SqlRepository<Note> {
        SqlRepository::new(Arc::clone(&self.manager))
    }
}

#[tokio::test]
async fn add_then_get_by_id_round_trips() {
    let harness = Harness::new().await;
    let repo = harness.tickets();

    let t = ticket("open", 3);
    repo.add(&t).await.expect("add");

    let found = repo.get_by_id(&t.id).await.expect("get_by_id");
    assert_eq!(found, Some(t));
}

#[tokio::test]
async fn missing_id_is_none_not_an_error() {
    let harness = Harness::new().await;
    let repo = harness.tickets();

    let found = repo.get_by_id(&Uuid::new_v4()).await.expect("get_by_id");
    assert_eq!(found, None);
}

#[tokio::test]
async fn condition_reads_and_counts() {
    let harness = Harness::new().await;
    let repo = harness.tickets();

    repo.add_range(&[ticket("open", 1), ticket("open", 2), ticket("closed", 3)])
        .await
        .expect("add_range");

    let open = Filter::by(Cond::eq("status", "open"));
    let found = repo.get_by_condition(&open).await.expect("get_by_condition");
    assert_eq!(found.len(), 2);

    assert_eq!(repo.count(Some(&open)).await.expect("count"), 2);
    assert_eq!(repo.count(None).await.expect("count all"), 3);
    assert!(repo.exists(&open).await.expect("exists"));
    assert!(!repo
        .exists(&Filter::by(Cond::eq("status", "missing")))
        .await
        .expect("exists"));
}

#[tokio::test]
async fn delete_by_condition_reports_affected_rows() {
    let harness = Harness::new().await;
    let repo = harness.tickets();

    repo.add_range(&[
        ticket("expired", 1),
        ticket("expired", 2),
        ticket("expired", 3),
        ticket("active", 4),
    ])
    .await
    .expect("add_range");

    let expired = Filter::by(Cond::eq("status", "expired"));
    let affected = repo
        .delete_by_condition(&expired)
        .await
        .expect("delete_by_condition");
    assert_eq!(affected, 3);

    let remaining = repo.get_all().await.expect("get_all");
    assert_eq!(remaining.len(), 1);
    assert!(remaining.iter().all(|t| t.status == "active"));
}

#[tokio::test]
async fn updates_full_and_partial() {
    let harness = Harness::new().await;
    let repo = harness.tickets();

    let mut t = ticket("open", 5);
    repo.add(&t).await.expect("add");

    t.status = "closed".to_string();
    t.priority = 9;
    repo.update(&t).await.expect("update");
    assert_eq!(repo.get_by_id(&t.id).await.unwrap(), Some(t.clone()));

    t.title = "renamed".to_string();
    t.priority = 1;
    repo.update_partial(&t, &["title"]).await.expect("partial");

    let stored = repo.get_by_id(&t.id).await.unwrap().expect("row");
    assert_eq!(stored.title, "renamed");
    // priority was not in the field list, so the old value stays
    assert_eq!(stored.priority, 9);
}

#[tokio::test]
async fn paging_clamps_and_orders_deterministically() {
    let harness = Harness::new().await;
    let repo = harness.tickets();

    let tickets: Vec<Ticket> = (1..=25).map(|i| ticket("open", i)).collect();
    repo.add_batched(&tickets, 10).await.expect("add_batched");

    let page = repo
        .get_paged(&PageRequest::new(2, 10).order_by("priority"))
        .await
        .expect("get_paged");
    assert_eq!(page.total_count, 25);
    assert_eq!(page.total_pages(), 3);
    assert!(page.items.len() <= 10);
    let priorities: Vec<i64> = page.items.iter().map(|t| t.priority).collect();
    assert_eq!(priorities, (11..=20).collect::<Vec<i64>>());

    // page_index below 1 clamps to the first page
    let first = repo
        .get_paged(&PageRequest::new(0, 10).order_by("priority"))
        .await
        .expect("get_paged");
    assert_eq!(first.page_index, 1);
    assert_eq!(first.items[0].priority, 1);

    let filtered = repo
        .get_paged_by_condition(
            &Filter::by(Cond::le("priority", 5)),
            &PageRequest::new(1, 3).order_by("priority").descending(true),
        )
        .await
        .expect("paged by condition");
    assert_eq!(filtered.total_count, 5);
    assert_eq!(filtered.total_pages(), 2);
    let priorities: Vec<i64> = filtered.items.iter().map(|t| t.priority).collect();
    assert_eq!(priorities, vec![5, 4, 3]);
}

#[tokio::test]
async fn transaction_commits_atomically() {
    let harness = Harness::new().await;
    let repo = harness.tickets();

    let a = ticket("open", 1);
    let b = ticket("open", 2);
    let (a_in, b_in) = (a.clone(), b.clone());
    repo.execute_in_transaction(Box::new(move |scope| {
        Box::pin(async move {
            scope.add(&a_in).await?;
            scope.add(&b_in).await?;
            // read-your-writes inside the transaction
            assert!(scope.get_by_id(&a_in.id).await?.is_some());
            Ok(())
        })
    }))
    .await
    .expect("transaction");

    assert_eq!(repo.count(None).await.unwrap(), 2);
}

#[tokio::test]
async fn failing_transaction_leaves_no_partial_writes() {
    let harness = Harness::new().await;
    let repo = harness.tickets();

    let existing = ticket("open", 1);
    repo.add(&existing).await.expect("add");
    let before = repo.get_all().await.expect("get_all");

    let (c, d) = (ticket("open", 2), ticket("open", 3));
    let result = repo
        .execute_in_transaction(Box::new(move |scope| {
            Box::pin(async move {
                scope.add(&c).await?;
                scope.add(&d).await?;
                Err(DataAccessError::validation("last step fails"))
            })
        }))
        .await;
    assert!(result.is_err());

    let after = repo.get_all().await.expect("get_all");
    assert_eq!(before, after);
}

#[tokio::test]
async fn transact_returns_a_value() {
    let harness = Harness::new().await;
    let repo = harness.tickets();

    let t = ticket("open", 7);
    let t_in = t.clone();
    let fetched: Option<Ticket> = polystore::transact(
        &repo,
        Box::new(move |scope| {
            Box::pin(async move {
                scope.add(&t_in).await?;
                scope.get_by_id(&t_in.id).await
            })
        }),
    )
    .await
    .expect("transact");

    assert_eq!(fetched, Some(t));
}

#[tokio::test]
async fn soft_delete_marks_instead_of_removing() {
    let harness = Harness::new().await;
    let repo = harness.notes();

    let note = Note {
        id: "n-1".into(),
        body: "keep me".into(),
        is_deleted: false,
        deleted_at: None,
        deleted_by: None,
    };
    repo.add(&note).await.expect("add");

    // delete_by_id routes through the marker for soft-delete entities
    assert!(repo.delete_by_id(&note.id).await.expect("delete_by_id"));

    let stored = repo.get_by_id(&note.id).await.unwrap().expect("still there");
    assert!(stored.is_deleted);
    assert_eq!(stored.deleted_by.as_deref(), Some("system"));
    assert!(stored.deleted_at.is_some());

    // explicit soft delete records the actor
    assert!(repo.soft_delete(&note.id, "auditor").await.expect("soft_delete"));
    let stored = repo.get_by_id(&note.id).await.unwrap().expect("row");
    assert_eq!(stored.deleted_by.as_deref(), Some("auditor"));
}

#[tokio::test]
async fn soft_delete_requires_declared_fields() {
    let harness = Harness::new().await;
    let repo = harness.tickets();

    let err = repo
        .soft_delete(&Uuid::new_v4(), "auditor")
        .await
        .unwrap_err();
    assert!(matches!(err, DataAccessError::Validation { .. }));
}

#[tokio::test]
async fn delete_batched_removes_in_chunks() {
    let harness = Harness::new().await;
    let repo = harness.tickets();

    let tickets: Vec<Ticket> = (1..=7).map(|i| ticket("open", i)).collect();
    repo.add_range(&tickets).await.expect("add_range");

    repo.delete_batched(&tickets[..5], 2).await.expect("delete_batched");
    assert_eq!(repo.count(None).await.unwrap(), 2);
}

#[tokio::test]
async fn cached_reads_are_idempotent_and_writes_invalidate() {
    let harness = Harness::new().await;
    let cache = Arc::new(QueryCache::new());
    let monitor = Arc::new(PerformanceMonitor::new());
    let repo = harness
        .tickets()
        .with_cache(Arc::clone(&cache), 5)
        .with_monitor(monitor);

    let t = ticket("open", 1);
    repo.add(&t).await.expect("add");

    let first = repo.get_by_id(&t.id).await.expect("first read");
    let second = repo.get_by_id(&t.id).await.expect("second read");
    assert_eq!(first, second);
    assert!(cache.stats().hits >= 1, "second read should hit the cache");

    // a write drops the entity's cached entries
    let mut updated = t.clone();
    updated.status = "closed".into();
    repo.update(&updated).await.expect("update");

    let third = repo.get_by_id(&t.id).await.expect("third read");
    assert_eq!(third.map(|x| x.status), Some("closed".to_string()));
}

#[tokio::test]
async fn update_partial_rejects_unknown_and_identity_fields() {
    let harness = Harness::new().await;
    let repo = harness.tickets();

    let t = ticket("open", 1);
    repo.add(&t).await.expect("add");

    assert!(matches!(
        repo.update_partial(&t, &["nope"]).await.unwrap_err(),
        DataAccessError::Validation { .. }
    ));
    assert!(matches!(
        repo.update_partial(&t, &["id"]).await.unwrap_err(),
        DataAccessError::Validation { .. }
    ));
    assert!(matches!(
        repo.add_batched(&[t.clone()], 0).await.unwrap_err(),
        DataAccessError::Validation { .. }
    ));
}
