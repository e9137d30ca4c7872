//! # REAM Clustering
//!
//! Cluster membership for the REAM actor runtime, kept in an external
//! transactional, strictly ordered key-value store.
//!
//! The store offers only ordered keys, range scans, atomic multi-key commits
//! and a per-commit version stamp. On top of that this crate builds a
//! linearizable membership table with optimistic concurrency: a per-row etag
//! derived from the commit stamp, and a cluster-wide table version that every
//! structural change must advance by exactly one.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod layout;
pub mod membership;
pub mod store;

// Re-export main types
pub use config::{ClusterOptions, ClusteringConfig, GatewayOptions, StoreOptions};
pub use error::{ClusteringError, ClusteringResult, OperationContext, StoreError, StoreResult};
pub use membership::{
    initialize_clustering, Clustering, ConflictToken, GatewayAddress, GatewayListProvider,
    MembershipEntry, MembershipTable, MembershipTableData, SiloAddress, SiloStatus,
    StoreGatewayListProvider, StoreMembershipTable, TableVersion,
};
pub use store::{Database, MemoryDatabase, RetryPolicy, TransactionRunner};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
