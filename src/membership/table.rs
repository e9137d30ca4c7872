//! Membership table contract used by the runtime's membership oracle

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{ConflictToken, MembershipEntry, MembershipTableData, SiloAddress, TableVersion};
use crate::error::ClusteringResult;

/// Linearizable membership table
///
/// `insert_row` and `update_row` return `Ok(false)` when a precondition
/// does not hold (stale table version, stale or missing etag, duplicate
/// silo). Callers re-read and retry; implementations never do.
#[async_trait]
pub trait MembershipTable: Send + Sync {
    /// Prepare the table; with `try_init_table_version`, create the table
    /// version if it does not exist yet
    async fn initialize(&self, try_init_table_version: bool) -> ClusteringResult<()>;

    /// Remove every row and the table version of `cluster_id`
    async fn delete_membership_table_entries(&self, cluster_id: &str) -> ClusteringResult<()>;

    /// Remove rows that are not active and have been silent since `before`
    ///
    /// Returns the number of rows removed.
    async fn cleanup_defunct_silo_entries(&self, before: DateTime<Utc>) -> ClusteringResult<usize>;

    async fn read_row(&self, silo: &SiloAddress) -> ClusteringResult<MembershipTableData>;

    async fn read_all(&self) -> ClusteringResult<MembershipTableData>;

    async fn insert_row(
        &self,
        entry: &MembershipEntry,
        table_version: &TableVersion,
    ) -> ClusteringResult<bool>;

    async fn update_row(
        &self,
        entry: &MembershipEntry,
        etag: &ConflictToken,
        table_version: &TableVersion,
    ) -> ClusteringResult<bool>;

    /// Refresh only the heartbeat time of an existing row
    async fn update_i_am_alive(&self, entry: &MembershipEntry) -> ClusteringResult<()>;
}
