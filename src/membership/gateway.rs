//! Gateway list derived from the membership table
//!
//! Clients connect through silos that are `Active` and expose a proxy port.
//! The list is recomputed from a fresh snapshot on every call; how long a
//! client may keep using it is bounded by [`GatewayListProvider::max_staleness`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::registry::StoreMembershipTable;
use super::table::MembershipTable;
use super::types::{MembershipEntry, MembershipTableData, SiloAddress};
use crate::config::GatewayOptions;
use crate::error::ClusteringResult;

/// Client-facing endpoint of a gateway silo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatewayAddress {
    endpoint: SocketAddr,
    generation: i32,
}

impl GatewayAddress {
    /// The gateway exposed by `entry`, if it is active and has a proxy port
    pub fn from_entry(entry: &MembershipEntry) -> Option<Self> {
        if !entry.status.is_active() || entry.proxy_port == 0 {
            return None;
        }
        let mut endpoint = entry.silo_address.endpoint();
        endpoint.set_port(entry.proxy_port);
        Some(Self {
            endpoint,
            generation: entry.silo_address.generation(),
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn generation(&self) -> i32 {
        self.generation
    }

    pub fn silo_address(&self) -> SiloAddress {
        SiloAddress::new(self.endpoint, self.generation)
    }
}

/// `gwy.tcp://ip:port/generation`
impl fmt::Display for GatewayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gwy.tcp://{}/{}", self.endpoint, self.generation)
    }
}

/// Gateways of a membership snapshot
pub fn project_gateways(data: &MembershipTableData) -> Vec<GatewayAddress> {
    data.members
        .iter()
        .filter_map(|(entry, _)| GatewayAddress::from_entry(entry))
        .collect()
}

/// Source of gateway addresses for clients
#[async_trait]
pub trait GatewayListProvider: Send + Sync {
    async fn initialize(&self) -> ClusteringResult<()>;

    async fn get_gateways(&self) -> ClusteringResult<Vec<GatewayAddress>>;

    /// How long a fetched list may be used before asking again
    fn max_staleness(&self) -> Duration;

    /// Whether the list can change while the client runs
    fn is_updatable(&self) -> bool;
}

/// [`GatewayListProvider`] over a [`StoreMembershipTable`]
#[derive(Debug, Clone)]
pub struct StoreGatewayListProvider {
    table: Arc<StoreMembershipTable>,
    options: GatewayOptions,
}

impl StoreGatewayListProvider {
    pub fn new(table: Arc<StoreMembershipTable>, options: GatewayOptions) -> Self {
        Self { table, options }
    }
}

#[async_trait]
impl GatewayListProvider for StoreGatewayListProvider {
    async fn initialize(&self) -> ClusteringResult<()> {
        self.table.initialize(true).await
    }

    async fn get_gateways(&self) -> ClusteringResult<Vec<GatewayAddress>> {
        if !self.table.is_initialized() {
            self.table.initialize(true).await?;
        }

        let snapshot = self.table.read_all().await?;
        let gateways = project_gateways(&snapshot);
        debug!(
            cluster_id = self.table.cluster_id(),
            members = snapshot.len(),
            gateways = gateways.len(),
            "computed gateway list"
        );
        Ok(gateways)
    }

    fn max_staleness(&self) -> Duration {
        self.options.gateway_list_refresh_period
    }

    fn is_updatable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::types::{ConflictToken, SiloStatus, TableVersion};
    use crate::store::Versionstamp;
    use chrono::Utc;

    fn member(addr: &str, status: SiloStatus, proxy_port: u16) -> (MembershipEntry, ConflictToken) {
        let entry = MembershipEntry::new(addr.parse().unwrap(), status, Utc::now()).with_proxy_port(proxy_port);
        (entry, ConflictToken::from_versionstamp(&Versionstamp::complete(1, 0, 0)))
    }

    #[test]
    fn test_projection_filters_inactive_and_portless() {
        let data = MembershipTableData::new(
            vec![
                member("10.0.0.1:11111@1", SiloStatus::Active, 5),
                member("10.0.0.2:11111@1", SiloStatus::Dead, 5),
                member("10.0.0.3:11111@1", SiloStatus::Active, 0),
            ],
            TableVersion::new(3),
        );

        let gateways = project_gateways(&data);
        assert_eq!(gateways.len(), 1);
        let expected: SocketAddr = "10.0.0.1:5".parse().unwrap();
        assert_eq!(gateways[0].endpoint(), expected);
        assert_eq!(gateways[0].generation(), 1);
    }

    #[test]
    fn test_gateway_uri() {
        let (entry, _) = member("10.0.0.1:11111@42", SiloStatus::Active, 30000);
        let gateway = GatewayAddress::from_entry(&entry).unwrap();
        assert_eq!(gateway.to_string(), "gwy.tcp://10.0.0.1:30000/42");
        assert_eq!(gateway.silo_address().to_string(), "10.0.0.1:30000@42");

        let (entry, _) = member("[fe80::1]:11111@2", SiloStatus::Active, 30000);
        assert_eq!(
            GatewayAddress::from_entry(&entry).unwrap().to_string(),
            "gwy.tcp://[fe80::1]:30000/2"
        );
    }
}
