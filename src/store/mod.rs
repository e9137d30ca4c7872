//! Transactional store facade
//!
//! The membership table talks to the backing store only through the traits
//! in this module: ordered byte keys, snapshot reads, range scans, atomic
//! multi-key commits and per-commit version stamps. Conflict detection is
//! the store's job; re-running a conflicted transaction is the job of the
//! [`TransactionRunner`].

pub mod memory;

pub use memory::MemoryDatabase;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::config::duration_ms;
use crate::error::{StoreError, StoreResult};

/// Half-open key range `[begin, end)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(begin: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// Range holding exactly `key`
    pub fn single(key: &[u8]) -> Self {
        let mut end = key.to_vec();
        end.push(0x00);
        Self::new(key.to_vec(), end)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.begin.as_slice() && key < self.end.as_slice()
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", hex::encode(&self.begin), hex::encode(&self.end))
    }
}

/// A key/value pair returned by a range read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
}

/// Store-assigned commit stamp
///
/// Ten bytes of transaction version (8-byte commit version, 2-byte batch
/// order, both big-endian) followed by a 2-byte user version that orders
/// stamps created inside the same transaction. An incomplete stamp carries
/// `0xFF` in the transaction bytes until the store fills them in at commit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Versionstamp {
    bytes: [u8; Versionstamp::LEN],
}

impl Versionstamp {
    /// Length of the transaction part
    pub const TRANSACTION_LEN: usize = 10;
    /// Full encoded length
    pub const LEN: usize = 12;

    /// Placeholder stamp, to be completed by the store on commit
    pub fn incomplete(user_version: u16) -> Self {
        let mut bytes = [0xFF; Self::LEN];
        bytes[Self::TRANSACTION_LEN..].copy_from_slice(&user_version.to_be_bytes());
        Self { bytes }
    }

    pub fn complete(commit_version: u64, batch_order: u16, user_version: u16) -> Self {
        let mut bytes = [0u8; Self::LEN];
        bytes[..8].copy_from_slice(&commit_version.to_be_bytes());
        bytes[8..10].copy_from_slice(&batch_order.to_be_bytes());
        bytes[10..].copy_from_slice(&user_version.to_be_bytes());
        Self { bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; Self::LEN] = bytes.try_into().ok()?;
        Some(Self { bytes })
    }

    pub fn is_incomplete(&self) -> bool {
        self.bytes[..Self::TRANSACTION_LEN].iter().all(|b| *b == 0xFF)
    }

    pub fn transaction_version(&self) -> [u8; Self::TRANSACTION_LEN] {
        let mut out = [0u8; Self::TRANSACTION_LEN];
        out.copy_from_slice(&self.bytes[..Self::TRANSACTION_LEN]);
        out
    }

    pub fn user_version(&self) -> u16 {
        u16::from_be_bytes([self.bytes[10], self.bytes[11]])
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.bytes
    }
}

impl fmt::Debug for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_incomplete() {
            write!(f, "Versionstamp(incomplete, {})", self.user_version())
        } else {
            write!(f, "Versionstamp({})", hex::encode(self.bytes))
        }
    }
}

/// Snapshot reads against the store
#[async_trait]
pub trait ReadTransaction: Send + Sync {
    /// Version every read in this transaction observes
    fn read_version(&self) -> u64;

    async fn get(&self, key: &[u8]) -> StoreResult<Option<Bytes>>;

    /// Keys in `range`, ascending, at most `limit` of them
    async fn get_range(&self, range: &KeyRange, limit: Option<usize>) -> StoreResult<Vec<KeyValue>>;
}

/// Buffered writes, committed atomically
#[async_trait]
pub trait Transaction: ReadTransaction {
    fn set(&self, key: &[u8], value: &[u8]);

    fn clear(&self, key: &[u8]);

    fn clear_range(&self, range: &KeyRange);

    /// A fresh incomplete stamp, unique within this transaction
    fn create_versionstamp(&self) -> Versionstamp;

    /// Write `value`, replacing the embedded incomplete stamp with the commit stamp
    fn set_versionstamped_value(&self, key: &[u8], value: &[u8]);

    /// Abort; later reads and the commit fail with [`StoreError::Cancelled`]
    fn cancel(&self);

    /// Commit every buffered write or none of them
    ///
    /// Returns the commit stamp, or `None` when nothing was written.
    async fn commit(&self) -> StoreResult<Option<Versionstamp>>;
}

/// Handle to a transactional store
#[async_trait]
pub trait Database: Send + Sync {
    async fn begin_read(&self) -> StoreResult<Arc<dyn ReadTransaction>>;

    async fn begin(&self) -> StoreResult<Arc<dyn Transaction>>;
}

/// How conflicted read-write transactions are re-run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "initial_backoff_ms")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_ms", rename = "max_backoff_ms")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Run once, never retry
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, with up to 50% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        capped.mul_f64(jitter)
    }
}

/// Runs closures inside store transactions
///
/// `read_write` re-runs the whole closure against a new transaction when the
/// commit conflicts, so the closure must not have effects outside the
/// transaction it is handed.
#[derive(Clone)]
pub struct TransactionRunner {
    database: Arc<dyn Database>,
    retry: RetryPolicy,
}

impl TransactionRunner {
    pub fn new(database: Arc<dyn Database>, retry: RetryPolicy) -> Self {
        Self { database, retry }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `read` against one snapshot
    pub async fn read<T, E, F, Fut>(&self, read: F) -> Result<T, E>
    where
        F: FnOnce(Arc<dyn ReadTransaction>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StoreError>,
    {
        let tx = self.database.begin_read().await?;
        read(tx).await
    }

    /// Run `body` and commit, re-running it on commit conflicts
    ///
    /// Errors returned by `body` abort the transaction and are returned as-is.
    pub async fn read_write<T, E, F, Fut>(&self, mut body: F) -> Result<T, E>
    where
        F: FnMut(Arc<dyn Transaction>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StoreError>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let tx = self.database.begin().await?;
            let value = match body(tx.clone()).await {
                Ok(value) => value,
                Err(e) => {
                    tx.cancel();
                    return Err(e);
                }
            };

            match tx.commit().await {
                Ok(stamp) => {
                    trace!(attempt, ?stamp, "transaction committed");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(attempt, ?delay, error = %e, "transaction conflicted, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(StoreError::RetryLimitExceeded {
                        attempts: attempt,
                        last: Box::new(e),
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl fmt::Debug for TransactionRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionRunner")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
