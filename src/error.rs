//! Error types for REAM clustering

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type for store facade operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for membership operations
pub type ClusteringResult<T> = Result<T, ClusteringError>;

/// Errors raised by the transactional store facade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Commit-time serialization failure; the whole transaction may be re-run
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    /// The store cannot be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time
    #[error("Store operation timed out")]
    TimedOut,

    /// The transaction was cancelled before commit
    #[error("Transaction cancelled")]
    Cancelled,

    /// The transaction was used after it committed
    #[error("Transaction already committed")]
    Committed,

    /// A retryable error persisted across every attempt
    #[error("Gave up after {attempts} attempts: {last}")]
    RetryLimitExceeded { attempts: u32, last: Box<StoreError> },
}

impl StoreError {
    /// Whether re-running the transaction from scratch can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Main error type for membership operations
///
/// Precondition failures (stale table version, stale or missing etag,
/// duplicate identity) are not errors; they surface as `Ok(false)`.
#[derive(Error, Debug)]
pub enum ClusteringError {
    /// Store facade errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The clustering directory has not been created yet
    #[error("Directory '{0}' does not exist")]
    DirectoryMissing(String),

    /// A heartbeat targeted a row that is not stored
    #[error("Membership entry {0} not found")]
    EntryNotFound(String),

    /// Payload encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The operation exceeded its configured deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Any of the above, annotated with where it happened
    #[error("{context}: {source}")]
    Operation {
        context: OperationContext,
        #[source]
        source: Box<ClusteringError>,
    },
}

impl ClusteringError {
    /// Attach operation, cluster and identity to an error
    pub fn in_operation(self, context: OperationContext) -> Self {
        match self {
            already @ ClusteringError::Operation { .. } => already,
            source => ClusteringError::Operation {
                context,
                source: Box::new(source),
            },
        }
    }

    /// Innermost error, with the operation context stripped
    pub fn root(&self) -> &ClusteringError {
        match self {
            ClusteringError::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the caller may simply re-attempt the operation
    pub fn is_transient(&self) -> bool {
        match self.root() {
            ClusteringError::Store(e) => matches!(
                e,
                StoreError::Conflict(_) | StoreError::RetryLimitExceeded { .. } | StoreError::TimedOut
            ),
            ClusteringError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Where a membership error occurred
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub operation: &'static str,
    pub cluster_id: String,
    pub identity: Option<String>,
}

impl OperationContext {
    pub fn new(operation: &'static str, cluster_id: impl Into<String>) -> Self {
        Self {
            operation,
            cluster_id: cluster_id.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed for cluster '{}'", self.operation, self.cluster_id)?;
        if let Some(identity) = &self.identity {
            write!(f, " (silo {})", identity)?;
        }
        Ok(())
    }
}

impl From<serde_json::Error> for ClusteringError {
    fn from(err: serde_json::Error) -> Self {
        ClusteringError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ClusteringError {
    fn from(err: toml::de::Error) -> Self {
        ClusteringError::Configuration(err.to_string())
    }
}
