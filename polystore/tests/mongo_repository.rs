//! Document-engine integration tests.
//!
//! Run with: MONGODB_HOST=localhost MONGODB_SECRET=... cargo test -p polystore -- --ignored

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use polystore::mongo::MongoConnectionManager;
use polystore::{
    Cond, ConnectionDescriptor, ConnectionManager, EngineKind, Entity, Filter, MongoRepository,
    PageRequest, Repository, SoftDeleteFields,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Article {
    id: String,
    title: String,
    status: String,
    views: i64,
    is_deleted: bool,
    deleted_at: Option<String>,
    deleted_by: Option<String>,
}

impl Entity for Article {
    type Key = String;

    fn table() -> &'static str {
        "articles"
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn soft_delete_fields() -> Option<SoftDeleteFields> {
        Some(SoftDeleteFields::default())
    }
}

fn article(status: &str, views: i64) -> Article {
    Article {
        id: Uuid::new_v4().to_string(),
        title: format!("article-{views}"),
        status: status.to_string(),
        views,
        is_deleted: false,
        deleted_at: None,
        deleted_by: None,
    }
}

async fn manager() -> Arc<MongoConnectionManager> {
    let host = std::env::var("MONGODB_HOST").unwrap_or_else(|_| "localhost".to_string());
    let descriptor = ConnectionDescriptor::builder(EngineKind::Mongo)
        .host(host)
        .database("polystore_tests")
        .trust_certificate(true)
        .min_pool_size(1)
        .max_pool_size(4)
        .build()
        .expect("descriptor");
    Arc::new(
        MongoConnectionManager::connect(descriptor)
            .await
            .expect("connect"),
    )
}

#[tokio::test]
#[ignore = "requires database"]
async fn crud_round_trip() {
    let manager = manager().await;
    let repo = MongoRepository::<Article>::new(Arc::clone(&manager));

    let a = article("draft", 1);
    repo.add(&a).await.expect("add");

    let found = repo.get_by_id(&a.id).await.expect("get_by_id");
    assert_eq!(found, Some(a.clone()));

    let mut updated = a.clone();
    updated.status = "published".into();
    repo.update(&updated).await.expect("update");
    assert_eq!(
        repo.get_by_id(&a.id).await.unwrap().map(|x| x.status),
        Some("published".to_string())
    );

    // soft-delete entity: delete_by_id writes the marker
    assert!(repo.delete_by_id(&a.id).await.expect("delete"));
    let stored = repo.get_by_id(&a.id).await.unwrap().expect("still present");
    assert!(stored.is_deleted);

    repo.delete_by_condition(&Filter::by(Cond::eq("id", a.id.clone())))
        .await
        .expect("cleanup");
}

#[tokio::test]
#[ignore = "requires database"]
async fn paged_queries_match_relational_semantics() {
    let manager = manager().await;
    let repo = MongoRepository::<Article>::new(Arc::clone(&manager));

    let run = Uuid::new_v4().to_string();
    let articles: Vec<Article> = (1..=12)
        .map(|i| {
            let mut a = article(&run, i);
            a.title = format!("{run}-{i}");
            a
        })
        .collect();
    repo.add_batched(&articles, 5).await.expect("add_batched");

    let filter = Filter::by(Cond::eq("status", run.clone()));
    let page = repo
        .get_paged_by_condition(&filter, &PageRequest::new(2, 5).order_by("views"))
        .await
        .expect("paged");
    assert_eq!(page.total_count, 12);
    assert_eq!(page.total_pages(), 3);
    let views: Vec<i64> = page.items.iter().map(|a| a.views).collect();
    assert_eq!(views, vec![6, 7, 8, 9, 10]);

    let affected = repo.delete_by_condition(&filter).await.expect("cleanup");
    assert_eq!(affected, 12);
}

#[tokio::test]
#[ignore = "requires database"]
async fn connectivity_probe_reports_latency() {
    let manager = manager().await;
    let result = manager.test_connection().await;
    assert!(result.success, "{:?}", result.error);
    assert!(result.latency_ms >= 0.0);
}

#[tokio::test]
#[ignore = "requires replica set"]
async fn transaction_aborts_on_error() {
    let manager = manager().await;
    let repo = MongoRepository::<Article>::new(Arc::clone(&manager));

    let a = article("tx", 1);
    let before = repo.count(None).await.expect("count");

    let a_in = a.clone();
    let result = repo
        .execute_in_transaction(Box::new(move |scope| {
            Box::pin(async move {
                scope.add(&a_in).await?;
                Err(polystore::DataAccessError::validation("fail on purpose"))
            })
        }))
        .await;
    assert!(result.is_err());
    assert_eq!(repo.count(None).await.expect("count"), before);
}
