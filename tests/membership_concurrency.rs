//! Concurrency tests for the store-backed membership table
//!
//! Transactions here run against a stepped store: every read yields to the
//! scheduler and commits can be held until another operation has made
//! progress. That forces genuinely overlapping transactions, so the commit
//! conflict and re-run path is exercised rather than sequential execution.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use ream_clustering::store::{Database, KeyRange, KeyValue, ReadTransaction, Transaction, Versionstamp};
use ream_clustering::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type CommitGate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Store wrapper that interleaves its read-write transactions
#[derive(Clone)]
struct SteppedDatabase {
    inner: MemoryDatabase,
    begins: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
    commit_gate: CommitGate,
}

impl SteppedDatabase {
    fn new(inner: MemoryDatabase) -> Self {
        Self {
            inner,
            begins: Arc::new(AtomicUsize::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
            commit_gate: Arc::new(|| true),
        }
    }

    /// Hold every commit until `gate` returns true
    fn with_commit_gate(mut self, gate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.commit_gate = Arc::new(gate);
        self
    }

    fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Database for SteppedDatabase {
    async fn begin_read(&self) -> StoreResult<Arc<dyn ReadTransaction>> {
        self.inner.begin_read().await
    }

    async fn begin(&self) -> StoreResult<Arc<dyn Transaction>> {
        let inner = self.inner.begin().await?;
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SteppedTransaction {
            inner,
            reads: self.reads.clone(),
            commit_gate: self.commit_gate.clone(),
        }))
    }
}

struct SteppedTransaction {
    inner: Arc<dyn Transaction>,
    reads: Arc<AtomicUsize>,
    commit_gate: CommitGate,
}

#[async_trait]
impl ReadTransaction for SteppedTransaction {
    fn read_version(&self) -> u64 {
        self.inner.read_version()
    }

    async fn get(&self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        tokio::task::yield_now().await;
        let value = self.inner.get(key).await;
        self.reads.fetch_add(1, Ordering::SeqCst);
        value
    }

    async fn get_range(&self, range: &KeyRange, limit: Option<usize>) -> StoreResult<Vec<KeyValue>> {
        tokio::task::yield_now().await;
        let rows = self.inner.get_range(range, limit).await;
        self.reads.fetch_add(1, Ordering::SeqCst);
        rows
    }
}

#[async_trait]
impl Transaction for SteppedTransaction {
    fn set(&self, key: &[u8], value: &[u8]) {
        self.inner.set(key, value)
    }

    fn clear(&self, key: &[u8]) {
        self.inner.clear(key)
    }

    fn clear_range(&self, range: &KeyRange) {
        self.inner.clear_range(range)
    }

    fn create_versionstamp(&self) -> Versionstamp {
        self.inner.create_versionstamp()
    }

    fn set_versionstamped_value(&self, key: &[u8], value: &[u8]) {
        self.inner.set_versionstamped_value(key, value)
    }

    fn cancel(&self) {
        self.inner.cancel()
    }

    async fn commit(&self) -> StoreResult<Option<Versionstamp>> {
        while !(self.commit_gate)() {
            tokio::task::yield_now().await;
        }
        self.inner.commit().await
    }
}

fn config(cluster_id: &str) -> ClusteringConfig {
    let mut config = ClusteringConfig::default();
    config.cluster.cluster_id = cluster_id.to_string();
    config
}

fn entry(addr: &str, status: SiloStatus) -> MembershipEntry {
    MembershipEntry::new(addr.parse().unwrap(), status, Utc::now()).with_proxy_port(30000)
}

async fn initialized(cluster_id: &str) -> (MemoryDatabase, Clustering) {
    let db = MemoryDatabase::new();
    let clustering = initialize_clustering(config(cluster_id), Arc::new(db.clone()))
        .await
        .unwrap();
    (db, clustering)
}

fn table_over(db: &SteppedDatabase, cluster_id: &str) -> StoreMembershipTable {
    StoreMembershipTable::from_config(Arc::new(db.clone()), &config(cluster_id)).unwrap()
}

#[tokio::test]
async fn test_concurrent_inserts_from_same_base() {
    let (db, clustering) = initialized("race").await;
    let base = clustering.table.read_all().await.unwrap().version;
    let proposed = base.next().unwrap();

    // Neither commit goes through before both transactions have started
    let stepped = SteppedDatabase::new(db);
    let begins = stepped.begins.clone();
    let stepped = stepped.with_commit_gate(move || begins.load(Ordering::SeqCst) >= 2);
    let table = table_over(&stepped, "race");

    let first = entry("10.0.0.1:11111@1", SiloStatus::Joining);
    let second = entry("10.0.0.2:11111@1", SiloStatus::Joining);
    let (a, b) = tokio::join!(
        table.insert_row(&first, &proposed),
        table.insert_row(&second, &proposed)
    );

    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(outcomes.iter().filter(|won| **won).count(), 1);
    // The loser's commit conflicted and its transaction was run again
    assert_eq!(stepped.begins(), 3);

    let snapshot = clustering.table.read_all().await.unwrap();
    assert_eq!(snapshot.version.version, base.version + 1);
    assert_eq!(snapshot.len(), 1);
}

#[tokio::test]
async fn test_many_handles_race_for_one_version() {
    let (db, clustering) = initialized("stampede").await;

    let stepped = SteppedDatabase::new(db);
    let begins = stepped.begins.clone();
    let stepped = stepped.with_commit_gate(move || begins.load(Ordering::SeqCst) >= 8);
    let handles: Vec<_> = (0..8).map(|_| Arc::new(table_over(&stepped, "stampede"))).collect();

    let attempts = handles.iter().enumerate().map(|(i, table)| {
        let member = entry(&format!("10.0.0.{}:11111@1", i + 1), SiloStatus::Joining);
        let table = table.clone();
        async move { table.insert_row(&member, &TableVersion::new(1)).await }
    });
    let outcomes: Vec<bool> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(outcomes.iter().filter(|won| **won).count(), 1);
    // Seven losers, each re-run once
    assert_eq!(stepped.begins(), 15);

    let snapshot = clustering.table.read_all().await.unwrap();
    assert_eq!(snapshot.version, TableVersion::new(1));
    assert_eq!(snapshot.len(), 1);
}

#[tokio::test]
async fn test_heartbeat_racing_an_update() {
    let (db, clustering) = initialized("heartbeat-race").await;
    let member = entry("10.0.0.1:11111@1", SiloStatus::Joining);
    assert!(clustering.table.insert_row(&member, &TableVersion::new(1)).await.unwrap());
    let (_, etag) = clustering.table.read_row(&member.silo_address).await.unwrap().members[0].clone();
    let committed = db.committed_version();

    // The heartbeat reads the row, then waits for the update to commit
    let watcher = db.clone();
    let heartbeat_db = SteppedDatabase::new(db.clone())
        .with_commit_gate(move || watcher.committed_version() > committed);
    // The update waits until the heartbeat has read the row
    let heartbeat_reads = heartbeat_db.reads.clone();
    let update_db =
        SteppedDatabase::new(db.clone()).with_commit_gate(move || heartbeat_reads.load(Ordering::SeqCst) >= 2);

    let heartbeat_table = table_over(&heartbeat_db, "heartbeat-race");
    let update_table = table_over(&update_db, "heartbeat-race");

    let mut active = member.clone();
    active.status = SiloStatus::Active;
    let mut alive = member.clone();
    alive.i_am_alive_time = member.i_am_alive_time + ChronoDuration::seconds(10);

    let next_version = TableVersion::new(2);
    let (updated, heartbeat) = tokio::join!(
        update_table.update_row(&active, &etag, &next_version),
        heartbeat_table.update_i_am_alive(&alive)
    );
    assert!(updated.unwrap());
    heartbeat.unwrap();

    assert_eq!(update_db.begins(), 1);
    assert_eq!(heartbeat_db.begins(), 2);

    // Both writes survive: the re-run heartbeat applied to the updated row
    let snapshot = clustering.table.read_row(&member.silo_address).await.unwrap();
    assert_eq!(snapshot.version, TableVersion::new(2));
    let (stored, stored_etag) = &snapshot.members[0];
    assert_eq!(stored.status, SiloStatus::Active);
    assert_eq!(stored.i_am_alive_time, alive.i_am_alive_time);
    assert_ne!(*stored_etag, etag);
}

#[tokio::test]
async fn test_heartbeats_keep_store_history_bounded() {
    let (db, clustering) = initialized("steady").await;
    let mut member = entry("10.0.0.1:11111@1", SiloStatus::Active);
    assert!(clustering.table.insert_row(&member, &TableVersion::new(1)).await.unwrap());

    for _ in 0..10_000 {
        member.i_am_alive_time = member.i_am_alive_time + ChronoDuration::milliseconds(1);
        clustering.table.update_i_am_alive(&member).await.unwrap();
    }

    let live = db.live_keys().len();
    assert_eq!(live, 4);
    assert!(db.revision_count() <= 2 * live);

    let snapshot = clustering.table.read_row(&member.silo_address).await.unwrap();
    assert_eq!(snapshot.members[0].0.i_am_alive_time, member.i_am_alive_time);
}
