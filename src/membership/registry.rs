//! Store-backed membership table
//!
//! The store has no row-level compare-and-swap, so every conditional write
//! is a read-compare-write inside one transaction: the table version and the
//! row's etag are read, compared in code, and the new values are written in
//! the same commit. The store's conflict check on the keys that were read
//! makes the sequence atomic; a conflicted commit is re-run from scratch by
//! the [`TransactionRunner`], which then observes the winner's writes.
//!
//! The table version is a single key per cluster. Every insert and update
//! reads and bumps it, which serializes all structural changes of the
//! cluster, including those of unrelated silos.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::codec;
use super::table::MembershipTable;
use super::types::{ConflictToken, MembershipEntry, MembershipTableData, SiloAddress, TableVersion};
use crate::config::{ClusterOptions, ClusteringConfig, StoreOptions};
use crate::error::{ClusteringError, ClusteringResult, OperationContext};
use crate::layout::{ClusterKeys, Directory, MemberKey, Subspace};
use crate::store::{Database, KeyRange, KeyValue, ReadTransaction, TransactionRunner};

/// Membership table kept in a transactional key-value store
///
/// Holds no cached rows or versions; every call reads the store.
#[derive(Debug)]
pub struct StoreMembershipTable {
    runner: TransactionRunner,
    directory: Directory,
    cluster_id: String,
    operation_timeout: Option<Duration>,
    initialized: AtomicBool,
}

impl StoreMembershipTable {
    pub fn new(runner: TransactionRunner, cluster: &ClusterOptions, store: &StoreOptions) -> Self {
        let root = Subspace::new(store.root_prefix.as_bytes().to_vec());
        Self {
            runner,
            directory: Directory::new(root, store.directory_name.clone()),
            cluster_id: cluster.cluster_id.clone(),
            operation_timeout: store.operation_timeout,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn from_config(database: Arc<dyn Database>, config: &ClusteringConfig) -> ClusteringResult<Self> {
        config.validate()?;
        let runner = TransactionRunner::new(database, config.store.retry.clone());
        Ok(Self::new(runner, &config.cluster, &config.store))
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn context(&self, operation: &'static str) -> OperationContext {
        OperationContext::new(operation, self.cluster_id.as_str())
    }

    /// Apply the operation deadline and annotate failures
    async fn guarded<T, F>(&self, context: OperationContext, operation: F) -> ClusteringResult<T>
    where
        F: Future<Output = ClusteringResult<T>>,
    {
        let result = match self.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, operation)
                .await
                .unwrap_or_else(|_| Err(ClusteringError::Timeout(limit))),
            None => operation.await,
        };
        result.map_err(|e| e.in_operation(context))
    }

    async fn cluster_keys<T>(&self, tx: &T) -> ClusteringResult<ClusterKeys>
    where
        T: ReadTransaction + ?Sized,
    {
        let subspace = self
            .directory
            .open(tx)
            .await?
            .ok_or_else(|| ClusteringError::DirectoryMissing(self.directory.name().to_string()))?;
        Ok(ClusterKeys::new(subspace, self.cluster_id.as_str()))
    }
}

async fn fetch<T>(tx: &T, key: &[u8]) -> ClusteringResult<Option<Bytes>>
where
    T: ReadTransaction + ?Sized,
{
    Ok(tx.get(key).await?)
}

async fn fetch_range<T>(tx: &T, range: &KeyRange) -> ClusteringResult<Vec<KeyValue>>
where
    T: ReadTransaction + ?Sized,
{
    Ok(tx.get_range(range, None).await?)
}

/// A cluster whose version key is absent (never initialised, or torn down)
/// is at version zero.
async fn read_table_version<T>(tx: &T, keys: &ClusterKeys) -> ClusteringResult<TableVersion>
where
    T: ReadTransaction + ?Sized,
{
    match tx.get(&keys.version_key()).await? {
        Some(bytes) => codec::decode_table_version(&bytes),
        None => Ok(TableVersion::default()),
    }
}

fn decode_etag(identity: &str, bytes: &[u8]) -> ClusteringResult<ConflictToken> {
    ConflictToken::from_stored(bytes).ok_or_else(|| {
        ClusteringError::Serialization(format!("malformed etag stored for silo {}", identity))
    })
}

/// Pair up record and etag keys of a member range scan
fn collate_members(
    keys: &ClusterKeys,
    rows: Vec<KeyValue>,
) -> ClusteringResult<Vec<(MembershipEntry, ConflictToken)>> {
    let mut slots: BTreeMap<String, (Option<MembershipEntry>, Option<ConflictToken>)> = BTreeMap::new();
    for row in rows {
        match keys.parse_member_key(&row.key)? {
            MemberKey::Record(identity) => {
                let entry = codec::decode_entry(&row.value)?;
                slots.entry(identity).or_default().0 = Some(entry);
            }
            MemberKey::Etag(identity) => {
                let etag = decode_etag(&identity, &row.value)?;
                slots.entry(identity).or_default().1 = Some(etag);
            }
        }
    }

    let mut members = Vec::with_capacity(slots.len());
    for (identity, slot) in slots {
        match slot {
            (Some(entry), Some(etag)) => members.push((entry, etag)),
            _ => warn!(
                cluster_id = keys.cluster_id(),
                silo = %identity,
                "skipping membership row without both record and etag"
            ),
        }
    }
    Ok(members)
}

#[async_trait]
impl MembershipTable for StoreMembershipTable {
    async fn initialize(&self, try_init_table_version: bool) -> ClusteringResult<()> {
        if try_init_table_version {
            let context = self.context("initialize");
            self.guarded(
                context,
                self.runner.read_write(move |tx| async move {
                    let subspace = self.directory.create_or_open(&*tx).await?;
                    let keys = ClusterKeys::new(subspace, self.cluster_id.as_str());
                    if tx.get(&keys.version_key()).await?.is_none() {
                        let initial = codec::encode_table_version(&TableVersion::default())?;
                        tx.set(&keys.version_key(), &initial);
                        info!(cluster_id = %self.cluster_id, "created membership table version");
                    }
                    Ok::<(), ClusteringError>(())
                }),
            )
            .await?;
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn delete_membership_table_entries(&self, cluster_id: &str) -> ClusteringResult<()> {
        let context = OperationContext::new("delete_membership_table_entries", cluster_id);
        self.guarded(
            context,
            self.runner.read_write(move |tx| async move {
                if let Some(subspace) = self.directory.open(&*tx).await? {
                    tx.clear_range(&ClusterKeys::new(subspace, cluster_id).cluster_range());
                }
                Ok::<(), ClusteringError>(())
            }),
        )
        .await?;

        info!(cluster_id, "deleted membership table entries");
        Ok(())
    }

    async fn cleanup_defunct_silo_entries(&self, before: DateTime<Utc>) -> ClusteringResult<usize> {
        let context = self.context("cleanup_defunct_silo_entries");
        let removed = self
            .guarded(
                context,
                self.runner.read_write(move |tx| async move {
                    let keys = self.cluster_keys(&*tx).await?;
                    let rows = fetch_range(&*tx, &keys.members_range()).await?;

                    let mut removed = 0;
                    for row in rows {
                        let identity = match keys.parse_member_key(&row.key)? {
                            MemberKey::Record(identity) => identity,
                            MemberKey::Etag(_) => continue,
                        };
                        let entry = codec::decode_entry(&row.value)?;
                        if entry.is_defunct(before) {
                            debug!(
                                cluster_id = %self.cluster_id,
                                silo = %identity,
                                status = %entry.status,
                                "removing defunct membership entry"
                            );
                            tx.clear(&keys.member_key(&identity));
                            tx.clear(&keys.etag_key(&identity));
                            removed += 1;
                        }
                    }
                    Ok::<usize, ClusteringError>(removed)
                }),
            )
            .await?;

        info!(cluster_id = %self.cluster_id, removed, %before, "cleaned up defunct silo entries");
        Ok(removed)
    }

    async fn read_row(&self, silo: &SiloAddress) -> ClusteringResult<MembershipTableData> {
        let identity = silo.to_string();
        let context = self.context("read_row").with_identity(identity.as_str());
        let identity = identity.as_str();
        self.guarded(
            context,
            self.runner.read(move |tx| async move {
                let keys = self.cluster_keys(&*tx).await?;
                let member_key = keys.member_key(identity);
                let etag_key = keys.etag_key(identity);
                let (version, record, etag) = tokio::try_join!(
                    read_table_version(&*tx, &keys),
                    fetch(&*tx, &member_key),
                    fetch(&*tx, &etag_key),
                )?;

                let members = match (record, etag) {
                    (Some(record), Some(etag)) => {
                        vec![(codec::decode_entry(&record)?, decode_etag(identity, &etag)?)]
                    }
                    (None, _) => Vec::new(),
                    (Some(_), None) => {
                        return Err(ClusteringError::Serialization(format!(
                            "membership row for silo {} has no etag",
                            identity
                        )))
                    }
                };
                Ok::<_, ClusteringError>(MembershipTableData::new(members, version))
            }),
        )
        .await
    }

    async fn read_all(&self) -> ClusteringResult<MembershipTableData> {
        let context = self.context("read_all");
        self.guarded(
            context,
            self.runner.read(move |tx| async move {
                let keys = self.cluster_keys(&*tx).await?;
                let members_range = keys.members_range();
                let (version, rows) = tokio::try_join!(
                    read_table_version(&*tx, &keys),
                    fetch_range(&*tx, &members_range),
                )?;
                let members = collate_members(&keys, rows)?;
                Ok::<_, ClusteringError>(MembershipTableData::new(members, version))
            }),
        )
        .await
    }

    async fn insert_row(
        &self,
        entry: &MembershipEntry,
        table_version: &TableVersion,
    ) -> ClusteringResult<bool> {
        let identity = entry.silo_address.to_string();
        let context = self.context("insert_row").with_identity(identity.as_str());
        let identity = identity.as_str();
        self.guarded(context, async move {
            let payload = codec::encode_entry(entry)?;
            let version_payload = codec::encode_table_version(table_version)?;
            let (payload, version_payload) = (&payload, &version_payload);

            self.runner
                .read_write(move |tx| async move {
                    let keys = self.cluster_keys(&*tx).await?;
                    let stored = read_table_version(&*tx, &keys).await?;
                    if !stored.precedes(table_version) {
                        debug!(
                            cluster_id = %self.cluster_id,
                            silo = identity,
                            stored = stored.version,
                            proposed = table_version.version,
                            "insert rejected: table version moved"
                        );
                        return Ok(false);
                    }

                    let member_key = keys.member_key(identity);
                    if tx.get(&member_key).await?.is_some() {
                        debug!(cluster_id = %self.cluster_id, silo = identity, "insert rejected: silo already present");
                        return Ok(false);
                    }

                    tx.set(&keys.version_key(), version_payload);
                    tx.set(&member_key, payload);
                    let stamp = tx.create_versionstamp();
                    tx.set_versionstamped_value(&keys.etag_key(identity), stamp.as_bytes());
                    Ok::<bool, ClusteringError>(true)
                })
                .await
        })
        .await
    }

    async fn update_row(
        &self,
        entry: &MembershipEntry,
        etag: &ConflictToken,
        table_version: &TableVersion,
    ) -> ClusteringResult<bool> {
        let identity = entry.silo_address.to_string();
        let context = self.context("update_row").with_identity(identity.as_str());
        let identity = identity.as_str();
        self.guarded(context, async move {
            let payload = codec::encode_entry(entry)?;
            let version_payload = codec::encode_table_version(table_version)?;
            let (payload, version_payload) = (&payload, &version_payload);

            self.runner
                .read_write(move |tx| async move {
                    let keys = self.cluster_keys(&*tx).await?;
                    let stored = read_table_version(&*tx, &keys).await?;
                    if !stored.precedes(table_version) {
                        debug!(
                            cluster_id = %self.cluster_id,
                            silo = identity,
                            stored = stored.version,
                            proposed = table_version.version,
                            "update rejected: table version moved"
                        );
                        return Ok(false);
                    }

                    let etag_key = keys.etag_key(identity);
                    let stored_etag = match tx.get(&etag_key).await? {
                        Some(bytes) => decode_etag(identity, &bytes)?,
                        None => {
                            debug!(cluster_id = %self.cluster_id, silo = identity, "update rejected: no such silo");
                            return Ok(false);
                        }
                    };
                    if stored_etag != *etag {
                        debug!(
                            cluster_id = %self.cluster_id,
                            silo = identity,
                            %stored_etag,
                            supplied = %etag,
                            "update rejected: etag mismatch"
                        );
                        return Ok(false);
                    }

                    tx.set(&keys.version_key(), version_payload);
                    tx.set(&keys.member_key(identity), payload);
                    let stamp = tx.create_versionstamp();
                    tx.set_versionstamped_value(&etag_key, stamp.as_bytes());
                    Ok::<bool, ClusteringError>(true)
                })
                .await
        })
        .await
    }

    async fn update_i_am_alive(&self, entry: &MembershipEntry) -> ClusteringResult<()> {
        let identity = entry.silo_address.to_string();
        let context = self.context("update_i_am_alive").with_identity(identity.as_str());
        let identity = identity.as_str();
        let alive_at = entry.i_am_alive_time;
        self.guarded(
            context,
            self.runner.read_write(move |tx| async move {
                let keys = self.cluster_keys(&*tx).await?;
                let member_key = keys.member_key(identity);
                let stored = tx
                    .get(&member_key)
                    .await?
                    .ok_or_else(|| ClusteringError::EntryNotFound(identity.to_string()))?;

                let mut current = codec::decode_entry(&stored)?;
                current.i_am_alive_time = alive_at;
                tx.set(&member_key, &codec::encode_entry(&current)?);
                Ok::<(), ClusteringError>(())
            }),
        )
        .await
    }
}
