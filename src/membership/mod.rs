//! Cluster membership on a transactional key-value store
//!
//! Provides the membership table the runtime's membership oracle drives,
//! the gateway list clients use to find the cluster, and the sweep that
//! removes long-dead silos.

pub mod codec;
pub mod gateway;
pub mod registry;
pub mod table;
pub mod types;

pub use gateway::{project_gateways, GatewayAddress, GatewayListProvider, StoreGatewayListProvider};
pub use registry::StoreMembershipTable;
pub use table::MembershipTable;
pub use types::*;

use std::sync::Arc;

use crate::config::ClusteringConfig;
use crate::error::ClusteringResult;
use crate::store::Database;

/// Membership table and gateway provider sharing one store handle
#[derive(Debug, Clone)]
pub struct Clustering {
    pub table: Arc<StoreMembershipTable>,
    pub gateways: Arc<StoreGatewayListProvider>,
}

/// Initialize clustering for a silo
///
/// Validates the configuration, creates the clustering directory and the
/// table version if they do not exist yet, and returns both handles.
pub async fn initialize_clustering(
    config: ClusteringConfig,
    database: Arc<dyn Database>,
) -> ClusteringResult<Clustering> {
    let table = Arc::new(StoreMembershipTable::from_config(database, &config)?);
    table.initialize(true).await?;
    let gateways = Arc::new(StoreGatewayListProvider::new(table.clone(), config.gateway));
    Ok(Clustering { table, gateways })
}
