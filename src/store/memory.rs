//! In-process multi-version store
//!
//! Every key keeps its full revision history so that a transaction reads
//! the snapshot taken when it began. Commits are checked against the ranges
//! the transaction read: if any key in them was written after the read
//! version, the commit fails with [`StoreError::Conflict`].
//!
//! Open transactions pin their read version. Revisions no pinned snapshot
//! can observe are dropped as keys are written, and deleted keys are
//! forgotten once no open transaction can still see them.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{Database, KeyRange, KeyValue, ReadTransaction, Transaction, Versionstamp};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Revision {
    version: u64,
    value: Option<Bytes>,
}

#[derive(Debug, Default)]
struct StoreState {
    data: BTreeMap<Vec<u8>, Vec<Revision>>,
    version: u64,
    /// Open transactions per read version
    snapshots: BTreeMap<u64, usize>,
    /// Keys whose latest revision is a tombstone
    retired: BTreeSet<Vec<u8>>,
}

impl StoreState {
    fn value_at(history: &[Revision], version: u64) -> Option<&Bytes> {
        history
            .iter()
            .rev()
            .find(|r| r.version <= version)
            .and_then(|r| r.value.as_ref())
    }

    fn span(&self, range: &KeyRange) -> impl Iterator<Item = (&Vec<u8>, &Vec<Revision>)> {
        let span = (!range.is_empty()).then(|| {
            self.data.range::<[u8], _>((
                Bound::Included(range.begin.as_slice()),
                Bound::Excluded(range.end.as_slice()),
            ))
        });
        span.into_iter().flatten()
    }

    fn modified_since(&self, range: &KeyRange, version: u64) -> bool {
        self.span(range)
            .any(|(_, history)| history.last().map_or(false, |r| r.version > version))
    }

    fn write(&mut self, key: &[u8], version: u64, value: Option<Bytes>) {
        if value.is_none() {
            self.retired.insert(key.to_vec());
        } else {
            self.retired.remove(key);
        }
        self.data
            .entry(key.to_vec())
            .or_default()
            .push(Revision { version, value });
        self.compact(key);
    }

    fn pin(&mut self) -> u64 {
        *self.snapshots.entry(self.version).or_default() += 1;
        self.version
    }

    fn unpin(&mut self, version: u64) {
        if let Some(count) = self.snapshots.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                self.snapshots.remove(&version);
                self.purge_retired();
            }
        }
    }

    /// Oldest version any open transaction reads at
    fn horizon(&self) -> u64 {
        self.snapshots.keys().next().copied().unwrap_or(self.version)
    }

    /// Keep the latest revision of `key` and the newest one below each pinned snapshot
    fn compact(&mut self, key: &[u8]) {
        let snapshots = &self.snapshots;
        if let Some(history) = self.data.get_mut(key) {
            let successors: Vec<u64> = history.iter().skip(1).map(|r| r.version).collect();
            let mut index = 0;
            history.retain(|revision| {
                let keep = match successors.get(index) {
                    Some(&next) => snapshots.range(revision.version..next).next().is_some(),
                    None => true,
                };
                index += 1;
                keep
            });
        }
    }

    /// Forget deleted keys once every open snapshot sees them deleted
    fn purge_retired(&mut self) {
        let horizon = self.horizon();
        let data = &mut self.data;
        self.retired.retain(|key| {
            let expired = data
                .get(key)
                .and_then(|history| history.last())
                .map_or(true, |r| r.value.is_none() && r.version <= horizon);
            if expired {
                data.remove(key);
            }
            !expired
        });
    }
}

/// In-memory [`Database`]
///
/// Cloning yields another handle to the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<StoreState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) connectivity to the store
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Latest committed version
    pub fn committed_version(&self) -> u64 {
        self.state.lock().version
    }

    /// Revisions retained across all keys, tombstones included
    pub fn revision_count(&self) -> usize {
        self.state.lock().data.values().map(Vec::len).sum()
    }

    /// Keys holding a value at the latest version
    pub fn live_keys(&self) -> Vec<Vec<u8>> {
        let state = self.state.lock();
        state
            .data
            .iter()
            .filter(|(_, history)| history.last().map_or(false, |r| r.value.is_some()))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn open(&self) -> StoreResult<MemoryTransaction> {
        self.check_available()?;
        Ok(MemoryTransaction {
            db: self.clone(),
            read_version: self.state.lock().pin(),
            local: Mutex::new(LocalState::default()),
        })
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin_read(&self) -> StoreResult<Arc<dyn ReadTransaction>> {
        Ok(Arc::new(self.open()?))
    }

    async fn begin(&self) -> StoreResult<Arc<dyn Transaction>> {
        Ok(Arc::new(self.open()?))
    }
}

#[derive(Debug, Clone)]
enum Mutation {
    Set(Vec<u8>, Bytes),
    Clear(Vec<u8>),
    ClearRange(KeyRange),
    SetVersionstamped(Vec<u8>, Vec<u8>),
}

impl Mutation {
    /// Effect on `key`: `None` if untouched, `Some(None)` if cleared
    fn apply_to(&self, key: &[u8]) -> Option<Option<Bytes>> {
        match self {
            Mutation::Set(k, v) if k.as_slice() == key => Some(Some(v.clone())),
            Mutation::SetVersionstamped(k, v) if k.as_slice() == key => {
                Some(Some(Bytes::copy_from_slice(v)))
            }
            Mutation::Clear(k) if k.as_slice() == key => Some(None),
            Mutation::ClearRange(r) if r.contains(key) => Some(None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TxStatus {
    #[default]
    Open,
    Committed,
    Cancelled,
}

#[derive(Debug, Default)]
struct LocalState {
    mutations: Vec<Mutation>,
    read_ranges: Vec<KeyRange>,
    next_user_version: u16,
    status: TxStatus,
}

impl LocalState {
    fn check_open(&self) -> StoreResult<()> {
        match self.status {
            TxStatus::Open => Ok(()),
            TxStatus::Committed => Err(StoreError::Committed),
            TxStatus::Cancelled => Err(StoreError::Cancelled),
        }
    }

    fn push(&mut self, mutation: Mutation) {
        if self.status == TxStatus::Open {
            self.mutations.push(mutation);
        }
    }
}

/// Transaction over a [`MemoryDatabase`]
#[derive(Debug)]
pub struct MemoryTransaction {
    db: MemoryDatabase,
    read_version: u64,
    local: Mutex<LocalState>,
}

impl MemoryTransaction {
    fn begin_read_op(&self, range: KeyRange) -> StoreResult<Vec<Mutation>> {
        self.db.check_available()?;
        let mut local = self.local.lock();
        local.check_open()?;
        local.read_ranges.push(range);
        Ok(local.mutations.clone())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.db.state.lock().unpin(self.read_version);
    }
}

#[async_trait]
impl ReadTransaction for MemoryTransaction {
    fn read_version(&self) -> u64 {
        self.read_version
    }

    async fn get(&self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        let mutations = self.begin_read_op(KeyRange::single(key))?;

        let mut value = {
            let state = self.db.state.lock();
            state
                .data
                .get(key)
                .and_then(|history| StoreState::value_at(history, self.read_version))
                .cloned()
        };
        for mutation in &mutations {
            if let Some(effect) = mutation.apply_to(key) {
                value = effect;
            }
        }
        Ok(value)
    }

    async fn get_range(&self, range: &KeyRange, limit: Option<usize>) -> StoreResult<Vec<KeyValue>> {
        let mutations = self.begin_read_op(range.clone())?;

        let mut view: BTreeMap<Vec<u8>, Bytes> = {
            let state = self.db.state.lock();
            state
                .span(range)
                .filter_map(|(key, history)| {
                    StoreState::value_at(history, self.read_version).map(|v| (key.clone(), v.clone()))
                })
                .collect()
        };
        for mutation in &mutations {
            match mutation {
                Mutation::Set(k, v) if range.contains(k) => {
                    view.insert(k.clone(), v.clone());
                }
                Mutation::SetVersionstamped(k, v) if range.contains(k) => {
                    view.insert(k.clone(), Bytes::copy_from_slice(v));
                }
                Mutation::Clear(k) => {
                    view.remove(k);
                }
                Mutation::ClearRange(r) => view.retain(|k, _| !r.contains(k)),
                _ => {}
            }
        }

        Ok(view
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(key, value)| KeyValue {
                key: Bytes::from(key),
                value,
            })
            .collect())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn set(&self, key: &[u8], value: &[u8]) {
        self.local
            .lock()
            .push(Mutation::Set(key.to_vec(), Bytes::copy_from_slice(value)));
    }

    fn clear(&self, key: &[u8]) {
        self.local.lock().push(Mutation::Clear(key.to_vec()));
    }

    fn clear_range(&self, range: &KeyRange) {
        self.local.lock().push(Mutation::ClearRange(range.clone()));
    }

    fn create_versionstamp(&self) -> Versionstamp {
        let mut local = self.local.lock();
        let stamp = Versionstamp::incomplete(local.next_user_version);
        local.next_user_version = local.next_user_version.wrapping_add(1);
        stamp
    }

    fn set_versionstamped_value(&self, key: &[u8], value: &[u8]) {
        self.local
            .lock()
            .push(Mutation::SetVersionstamped(key.to_vec(), value.to_vec()));
    }

    fn cancel(&self) {
        let mut local = self.local.lock();
        if local.status == TxStatus::Open {
            local.status = TxStatus::Cancelled;
            local.mutations.clear();
        }
    }

    async fn commit(&self) -> StoreResult<Option<Versionstamp>> {
        self.db.check_available()?;
        let (mutations, read_ranges) = {
            let mut local = self.local.lock();
            local.check_open()?;
            local.status = TxStatus::Committed;
            (
                std::mem::take(&mut local.mutations),
                std::mem::take(&mut local.read_ranges),
            )
        };
        if mutations.is_empty() {
            return Ok(None);
        }

        let mut state = self.db.state.lock();
        if let Some(range) = read_ranges
            .iter()
            .find(|range| state.modified_since(range, self.read_version))
        {
            return Err(StoreError::Conflict(format!(
                "range {} changed after version {}",
                range, self.read_version
            )));
        }

        let version = state.version + 1;
        state.version = version;
        let stamp = Versionstamp::complete(version, 0, 0);

        for mutation in mutations {
            match mutation {
                Mutation::Set(key, value) => state.write(&key, version, Some(value)),
                Mutation::Clear(key) => {
                    if state.data.contains_key(&key) {
                        state.write(&key, version, None);
                    }
                }
                Mutation::ClearRange(range) => {
                    let cleared: Vec<Vec<u8>> = state
                        .span(&range)
                        .filter(|(_, history)| history.last().map_or(false, |r| r.value.is_some()))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in cleared {
                        state.write(&key, version, None);
                    }
                }
                Mutation::SetVersionstamped(key, mut value) => {
                    fill_versionstamp(&mut value, &stamp);
                    state.write(&key, version, Some(Bytes::from(value)));
                }
            }
        }

        Ok(Some(stamp))
    }
}

/// Replace the first incomplete stamp placeholder in `value`
fn fill_versionstamp(value: &mut [u8], stamp: &Versionstamp) {
    let placeholder = [0xFFu8; Versionstamp::TRANSACTION_LEN];
    if let Some(pos) = value
        .windows(Versionstamp::TRANSACTION_LEN)
        .position(|w| w == placeholder)
    {
        value[pos..pos + Versionstamp::TRANSACTION_LEN].copy_from_slice(&stamp.transaction_version());
    }
}
