//! Integration tests for transactions on the wire and recovery after a crash.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use common::MockCluster;
use ember_client::transaction::{
    is_metadata_key, KvStore, ManualClock, MemoryStore, Resolution, StoreOptions, StoredDocument,
};
use ember_client::{
    Cluster, CollectionName, EmberError, GetOptions, Result, TransactionOptions, TransactionState,
    Transactions, TransactionsConfig, UpsertOptions,
};

fn staged_keys(keys: &[String]) -> Vec<&String> {
    keys.iter()
        .filter(|key| key.starts_with("_txn:staged:"))
        .collect()
}

#[tokio::test]
async fn test_transfer_commits_over_the_wire() {
    common::init_tracing();
    let mock = MockCluster::start(2).await;
    let cluster = Cluster::connect(mock.config()).await.unwrap();
    let accounts = cluster.default_collection();
    accounts
        .upsert("alice", &json!({"balance": 100}), UpsertOptions::new())
        .await
        .unwrap();
    accounts
        .upsert("bob", &json!({"balance": 0}), UpsertOptions::new())
        .await
        .unwrap();

    let collection = CollectionName::default();
    let result = cluster
        .transactions()
        .run(TransactionOptions::new(), |ctx| {
            let collection = collection.clone();
            async move {
                let alice = ctx.get(&collection, "alice").await?.unwrap();
                let bob = ctx.get(&collection, "bob").await?.unwrap();
                let from: Value = alice.content_as()?;
                let to: Value = bob.content_as()?;
                let amount = 30;
                ctx.replace(
                    &alice,
                    &json!({"balance": from["balance"].as_i64().unwrap_or(0) - amount}),
                )
                .await?;
                ctx.replace(
                    &bob,
                    &json!({"balance": to["balance"].as_i64().unwrap_or(0) + amount}),
                )
                .await?;
                Ok(())
            }
        })
        .await
        .unwrap();
    assert!(result.unstaging_complete());

    let alice: Value = accounts
        .get("alice", GetOptions::new())
        .await
        .unwrap()
        .content_as()
        .unwrap();
    let bob: Value = accounts
        .get("bob", GetOptions::new())
        .await
        .unwrap()
        .content_as()
        .unwrap();
    assert_eq!(alice["balance"], 70);
    assert_eq!(bob["balance"], 30);
    assert!(staged_keys(&mock.keys(0)).is_empty());

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rollback_over_the_wire_leaves_documents() {
    let mock = MockCluster::start(1).await;
    let cluster = Cluster::connect(mock.config()).await.unwrap();
    let docs = cluster.default_collection();
    docs.upsert("stable", &json!({"v": 1}), UpsertOptions::new())
        .await
        .unwrap();

    let collection = CollectionName::default();
    let transactions = cluster.transactions();
    let ctx = transactions.begin(TransactionOptions::new());
    let doc = ctx.get(&collection, "stable").await.unwrap().unwrap();
    ctx.replace(&doc, &json!({"v": 2})).await.unwrap();
    ctx.insert(&collection, "fresh", &json!({"v": 3}))
        .await
        .unwrap();
    assert!(!staged_keys(&mock.keys(0)).is_empty());

    ctx.rollback().await.unwrap();

    let stable: Value = docs
        .get("stable", GetOptions::new())
        .await
        .unwrap()
        .content_as()
        .unwrap();
    assert_eq!(stable["v"], 1);
    assert!(matches!(
        docs.get("fresh", GetOptions::new()).await,
        Err(EmberError::DocumentNotFound { .. })
    ));
    assert!(staged_keys(&mock.keys(0)).is_empty());

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_writer_sees_write_write_conflict() {
    let mock = MockCluster::start(1).await;
    let cluster = Cluster::connect(mock.config()).await.unwrap();
    let docs = cluster.default_collection();
    docs.upsert("contended", &json!({"owner": "none"}), UpsertOptions::new())
        .await
        .unwrap();

    let collection = CollectionName::default();
    let transactions = cluster.transactions();
    let first = transactions.begin(TransactionOptions::new());
    let second = transactions.begin(TransactionOptions::new());

    let seen_by_first = first.get(&collection, "contended").await.unwrap().unwrap();
    let seen_by_second = second.get(&collection, "contended").await.unwrap().unwrap();

    first
        .replace(&seen_by_first, &json!({"owner": "first"}))
        .await
        .unwrap();
    let conflict = second
        .replace(&seen_by_second, &json!({"owner": "second"}))
        .await;
    assert!(matches!(
        conflict,
        Err(EmberError::WriteWriteConflict { .. })
    ));

    first.commit().await.unwrap();
    second.rollback().await.unwrap();

    let doc: Value = docs
        .get("contended", GetOptions::new())
        .await
        .unwrap()
        .content_as()
        .unwrap();
    assert_eq!(doc["owner"], "first");

    cluster.shutdown().await.unwrap();
}

/// Wraps a store and, once frozen, never completes a write to a regular
/// document. Reads and transaction metadata stay reachable.
#[derive(Debug)]
struct FreezingStore {
    inner: Arc<MemoryStore>,
    frozen: AtomicBool,
}

impl FreezingStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            frozen: AtomicBool::new(false),
        }
    }

    fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    async fn gate(&self, key: &str) {
        if self.frozen.load(Ordering::SeqCst) && !is_metadata_key(key) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl KvStore for FreezingStore {
    async fn get(
        &self,
        collection: &CollectionName,
        key: &str,
        options: &StoreOptions,
    ) -> Result<Option<StoredDocument>> {
        self.inner.get(collection, key, options).await
    }

    async fn insert(
        &self,
        collection: &CollectionName,
        key: &str,
        value: Bytes,
        options: &StoreOptions,
    ) -> Result<u64> {
        self.gate(key).await;
        self.inner.insert(collection, key, value, options).await
    }

    async fn replace(
        &self,
        collection: &CollectionName,
        key: &str,
        value: Bytes,
        cas: u64,
        options: &StoreOptions,
    ) -> Result<u64> {
        self.gate(key).await;
        self.inner.replace(collection, key, value, cas, options).await
    }

    async fn remove(
        &self,
        collection: &CollectionName,
        key: &str,
        cas: u64,
        options: &StoreOptions,
    ) -> Result<()> {
        self.gate(key).await;
        self.inner.remove(collection, key, cas, options).await
    }
}

fn json_bytes(value: &Value) -> Bytes {
    Bytes::from(serde_json::to_vec(value).unwrap())
}

fn read_json(store: &MemoryStore, collection: &CollectionName, key: &str) -> Option<Value> {
    store
        .peek(collection, key)
        .map(|doc| serde_json::from_slice(&doc.value).unwrap())
}

fn quiet_config() -> TransactionsConfig {
    TransactionsConfig::builder()
        .expiration(Duration::from_secs(15))
        .cleanup_lost_attempts(false)
        .cleanup_client_attempts(false)
        .build()
        .unwrap()
}

fn orders() -> CollectionName {
    CollectionName::new("shop", "orders")
}

/// Stages two changes in `collection`, freezes the store and lets commit
/// run until the attempt record says committed but nothing has been
/// applied, then drops the commit as if the client died.
async fn crash_after_commit_point(
    memory: &Arc<MemoryStore>,
    clock: &Arc<ManualClock>,
    collection: &CollectionName,
) -> String {
    memory
        .insert(
            collection,
            "order",
            json_bytes(&json!({"status": "new"})),
            &StoreOptions::default(),
        )
        .await
        .unwrap();

    let freezing = Arc::new(FreezingStore::new(Arc::clone(memory)));
    let crashed = Transactions::with_clock(freezing.clone(), quiet_config(), clock.clone());
    let ctx = crashed.begin(TransactionOptions::new());
    let order = ctx.get(collection, "order").await.unwrap().unwrap();
    ctx.replace(&order, &json!({"status": "paid"})).await.unwrap();
    ctx.insert(collection, "receipt", &json!({"order": "order"}))
        .await
        .unwrap();

    freezing.freeze();
    let commit = tokio::time::timeout(Duration::from_millis(300), ctx.commit()).await;
    assert!(commit.is_err(), "commit should hang while unstaging");
    assert_eq!(ctx.state(), TransactionState::Committed);
    let txn_id = ctx.id().to_string();
    drop(ctx);
    crashed.close().await;
    txn_id
}

#[tokio::test]
async fn test_lost_attempt_scan_completes_committed_attempt() {
    let memory = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let collection = orders();
    crash_after_commit_point(&memory, &clock, &collection).await;

    assert_eq!(
        read_json(&memory, &collection, "order"),
        Some(json!({"status": "new"}))
    );
    assert_eq!(read_json(&memory, &collection, "receipt"), None);
    assert!(!staged_keys(&memory.keys(&collection)).is_empty());

    // A fresh instance has never used the collection the record lives in.
    let recovering = Transactions::with_clock(memory.clone(), quiet_config(), clock.clone());
    let early = recovering.cleanup_now().await;
    assert_eq!(early.records_checked, 1);
    assert_eq!(early.attempts_resolved, 0);

    clock.advance(Duration::from_secs(60));
    let report = recovering.cleanup_now().await;
    assert_eq!(report.attempts_resolved, 1);
    assert_eq!(report.errors, 0);

    assert_eq!(
        read_json(&memory, &collection, "order"),
        Some(json!({"status": "paid"}))
    );
    assert_eq!(
        read_json(&memory, &collection, "receipt"),
        Some(json!({"order": "order"}))
    );
    assert!(staged_keys(&memory.keys(&collection)).is_empty());
    recovering.close().await;
}

#[tokio::test]
async fn test_next_transaction_rolls_expired_commit_forward() {
    let memory = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let collection = orders();
    crash_after_commit_point(&memory, &clock, &collection).await;

    let next = Transactions::with_clock(memory.clone(), quiet_config(), clock.clone());
    let early = next.begin(TransactionOptions::new());
    let order = early.get(&collection, "order").await.unwrap().unwrap();
    assert_eq!(order.content_as::<Value>().unwrap(), json!({"status": "paid"}));
    let blocked = early.replace(&order, &json!({"status": "shipped"})).await;
    assert!(matches!(blocked, Err(EmberError::WriteWriteConflict { .. })));
    early.rollback().await.unwrap();

    clock.advance(Duration::from_secs(60));
    let result = next
        .run(TransactionOptions::new(), |ctx| {
            let collection = collection.clone();
            async move {
                let order = ctx.get(&collection, "order").await?.ok_or_else(|| {
                    EmberError::DocumentNotFound {
                        key: "order".into(),
                    }
                })?;
                let mut body: Value = order.content_as()?;
                body["status"] = json!("shipped");
                ctx.replace(&order, &body).await?;
                Ok(())
            }
        })
        .await
        .unwrap();
    assert!(result.unstaging_complete());

    assert_eq!(
        read_json(&memory, &collection, "order"),
        Some(json!({"status": "shipped"}))
    );
    assert_eq!(
        read_json(&memory, &collection, "receipt"),
        Some(json!({"order": "order"}))
    );
    assert!(staged_keys(&memory.keys(&collection)).is_empty());
    next.close().await;
}

#[tokio::test]
async fn test_forced_resolution_completes_before_expiry() {
    let memory = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let collection = CollectionName::default();
    let txn_id = crash_after_commit_point(&memory, &clock, &collection).await;

    let atr_key = memory
        .keys(&collection)
        .into_iter()
        .find(|key| key.starts_with("_txn:atr-"))
        .unwrap();

    let recovering = Transactions::with_clock(memory.clone(), quiet_config(), clock.clone());
    let recovery = recovering.recovery();
    let polite = recovery
        .resolve_attempt(&collection, &atr_key, &txn_id, false)
        .await
        .unwrap();
    assert_eq!(polite, Resolution::NotExpired);

    let forced = recovery
        .resolve_attempt(&collection, &atr_key, &txn_id, true)
        .await
        .unwrap();
    assert_eq!(forced, Resolution::Completed);
    assert_eq!(
        read_json(&memory, &collection, "order"),
        Some(json!({"status": "paid"}))
    );

    let again = recovery
        .resolve_attempt(&collection, &atr_key, &txn_id, true)
        .await
        .unwrap();
    assert_eq!(again, Resolution::NotFound);
    recovering.close().await;
}

#[tokio::test]
async fn test_commit_over_the_wire_rejects_external_write() {
    let mock = MockCluster::start(2).await;
    let cluster = Cluster::connect(mock.config()).await.unwrap();
    let docs = cluster.default_collection();
    docs.upsert("stock", &json!({"count": 3}), UpsertOptions::new())
        .await
        .unwrap();

    let collection = CollectionName::default();
    let transactions = cluster.transactions();
    let ctx = transactions.begin(TransactionOptions::new());
    let stock = ctx.get(&collection, "stock").await.unwrap().unwrap();
    ctx.replace(&stock, &json!({"count": 2})).await.unwrap();

    docs.upsert("stock", &json!({"count": 0}), UpsertOptions::new())
        .await
        .unwrap();
    let result = ctx.commit().await;
    assert!(matches!(result, Err(EmberError::WriteWriteConflict { .. })));
    assert_eq!(ctx.state(), TransactionState::RolledBack);

    let doc: Value = docs
        .get("stock", GetOptions::new())
        .await
        .unwrap()
        .content_as()
        .unwrap();
    assert_eq!(doc["count"], 0);
    assert!(staged_keys(&mock.keys(0)).is_empty());

    cluster.shutdown().await.unwrap();
}
