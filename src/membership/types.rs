//! Membership table data types

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClusteringError;
use crate::store::Versionstamp;

/// Identity of one silo incarnation: endpoint plus generation
///
/// The string form `ip:port@generation` (IPv6 in brackets) is what the
/// member keys are built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiloAddress {
    endpoint: SocketAddr,
    generation: i32,
}

impl SiloAddress {
    pub fn new(endpoint: SocketAddr, generation: i32) -> Self {
        Self {
            endpoint,
            generation,
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn generation(&self) -> i32 {
        self.generation
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.endpoint, self.generation)
    }
}

impl FromStr for SiloAddress {
    type Err = ClusteringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| {
            ClusteringError::Serialization(format!("invalid silo address '{}': {}", s, reason))
        };
        let (endpoint, generation) = s
            .rsplit_once('@')
            .ok_or_else(|| invalid("missing '@generation'".into()))?;
        let endpoint = endpoint.parse::<SocketAddr>().map_err(|e| invalid(format!("{}", e)))?;
        let generation = generation.parse::<i32>().map_err(|e| invalid(format!("{}", e)))?;
        Ok(Self::new(endpoint, generation))
    }
}

/// Membership status of a silo
///
/// The usual progression is `Joining -> Active -> ShuttingDown -> Stopping
/// -> Dead`; the table stores whatever the caller writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiloStatus {
    None,
    Created,
    Joining,
    Active,
    ShuttingDown,
    Stopping,
    Dead,
}

impl SiloStatus {
    pub fn is_active(&self) -> bool {
        *self == SiloStatus::Active
    }

    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            SiloStatus::ShuttingDown | SiloStatus::Stopping | SiloStatus::Dead
        )
    }
}

impl fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One row of the membership table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipEntry {
    #[serde(with = "super::codec::silo_address")]
    pub silo_address: SiloAddress,
    pub status: SiloStatus,
    /// Who suspects this silo, and since when
    #[serde(default, with = "super::codec::suspect_times")]
    pub suspect_times: Vec<(SiloAddress, DateTime<Utc>)>,
    /// Gateway port; zero when the silo does not accept clients
    #[serde(default)]
    pub proxy_port: u16,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub silo_name: String,
    #[serde(default)]
    pub role_name: String,
    #[serde(default)]
    pub update_zone: i32,
    #[serde(default)]
    pub fault_zone: i32,
    pub start_time: DateTime<Utc>,
    pub i_am_alive_time: DateTime<Utc>,
}

impl MembershipEntry {
    pub fn new(silo_address: SiloAddress, status: SiloStatus, start_time: DateTime<Utc>) -> Self {
        Self {
            silo_address,
            status,
            suspect_times: Vec::new(),
            proxy_port: 0,
            host_name: String::new(),
            silo_name: String::new(),
            role_name: String::new(),
            update_zone: 0,
            fault_zone: 0,
            start_time,
            i_am_alive_time: start_time,
        }
    }

    pub fn with_proxy_port(mut self, proxy_port: u16) -> Self {
        self.proxy_port = proxy_port;
        self
    }

    pub fn with_names(mut self, silo_name: impl Into<String>, host_name: impl Into<String>) -> Self {
        self.silo_name = silo_name.into();
        self.host_name = host_name.into();
        self
    }

    pub fn add_suspector(&mut self, suspecting_silo: SiloAddress, time: DateTime<Utc>) {
        self.suspect_times.push((suspecting_silo, time));
    }

    /// Not active, and neither started nor heard from since `before`
    pub fn is_defunct(&self, before: DateTime<Utc>) -> bool {
        !self.status.is_active() && self.start_time < before && self.i_am_alive_time < before
    }
}

/// Global sequence number of the membership table
///
/// Every insert or update must present `stored + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableVersion {
    pub version: i32,
    pub version_etag: String,
}

impl TableVersion {
    pub fn new(version: i32) -> Self {
        Self {
            version,
            version_etag: version.to_string(),
        }
    }

    /// The version a write based on this one must present, if representable
    pub fn next(&self) -> Option<Self> {
        self.version.checked_add(1).map(Self::new)
    }

    /// Whether `proposed` is the immediate successor of this version
    pub fn precedes(&self, proposed: &TableVersion) -> bool {
        self.version.checked_add(1) == Some(proposed.version)
    }
}

impl Default for TableVersion {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}, {}>", self.version, self.version_etag)
    }
}

/// Per-row optimistic concurrency token
///
/// The transaction part of the version stamp written with the row. Only
/// equality is meaningful.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConflictToken([u8; Versionstamp::TRANSACTION_LEN]);

impl ConflictToken {
    pub fn from_versionstamp(stamp: &Versionstamp) -> Self {
        Self(stamp.transaction_version())
    }

    /// Decode a stored etag value (a full version stamp)
    pub fn from_stored(bytes: &[u8]) -> Option<Self> {
        Versionstamp::from_bytes(bytes)
            .filter(|stamp| !stamp.is_incomplete())
            .map(|stamp| Self::from_versionstamp(&stamp))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ConflictToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ConflictToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConflictToken({})", self)
    }
}

impl FromStr for ConflictToken {
    type Err = ClusteringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; Versionstamp::TRANSACTION_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ClusteringError::Serialization(format!("invalid etag '{}': {}", s, e)))?;
        Ok(Self(bytes))
    }
}

/// Snapshot of the membership table
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipTableData {
    pub members: Vec<(MembershipEntry, ConflictToken)>,
    pub version: TableVersion,
}

impl MembershipTableData {
    pub fn new(members: Vec<(MembershipEntry, ConflictToken)>, version: TableVersion) -> Self {
        Self { members, version }
    }

    pub fn get(&self, silo: &SiloAddress) -> Option<&(MembershipEntry, ConflictToken)> {
        self.members
            .iter()
            .find(|(entry, _)| entry.silo_address == *silo)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn silo(s: &str) -> SiloAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_silo_address_parse() {
        let v4 = silo("10.0.0.1:11111@42");
        assert_eq!(v4.endpoint(), "10.0.0.1:11111".parse().unwrap());
        assert_eq!(v4.generation(), 42);
        assert_eq!(v4.to_string(), "10.0.0.1:11111@42");

        let v6 = silo("[::1]:30000@-3");
        assert_eq!(v6.generation(), -3);
        assert_eq!(v6.to_string(), "[::1]:30000@-3");

        assert!("10.0.0.1:11111".parse::<SiloAddress>().is_err());
        assert!("10.0.0.1@1".parse::<SiloAddress>().is_err());
        assert!("10.0.0.1:1@x".parse::<SiloAddress>().is_err());
    }

    #[test]
    fn test_status_helpers() {
        assert!(SiloStatus::Active.is_active());
        assert!(!SiloStatus::Joining.is_terminating());
        assert!(SiloStatus::ShuttingDown.is_terminating());
        assert!(SiloStatus::Dead.is_terminating());
    }

    #[test]
    fn test_is_defunct() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut entry = MembershipEntry::new(silo("10.0.0.1:1@1"), SiloStatus::Dead, t0);
        assert!(entry.is_defunct(t0 + Duration::seconds(1)));
        assert!(!entry.is_defunct(t0));

        entry.i_am_alive_time = t0 + Duration::hours(1);
        assert!(!entry.is_defunct(t0 + Duration::seconds(1)));

        entry.status = SiloStatus::Active;
        assert!(!entry.is_defunct(t0 + Duration::days(1)));
    }

    #[test]
    fn test_conflict_token_text_form() {
        let token = ConflictToken::from_versionstamp(&Versionstamp::complete(258, 1, 0));
        assert_eq!(token.to_string(), "00000000000001020001");
        assert_eq!(token.to_string().parse::<ConflictToken>().unwrap(), token);
        assert!("zz".parse::<ConflictToken>().is_err());

        assert!(ConflictToken::from_stored(Versionstamp::incomplete(0).as_bytes()).is_none());
        assert!(ConflictToken::from_stored(b"short").is_none());
    }

    #[test]
    fn test_table_version_next() {
        let v = TableVersion::default().next().and_then(|v| v.next()).unwrap();
        assert_eq!(v, TableVersion::new(2));
        assert_eq!(v.version_etag, "2");

        assert!(TableVersion::new(i32::MAX).next().is_none());
        assert!(TableVersion::new(4).precedes(&TableVersion::new(5)));
        assert!(!TableVersion::new(4).precedes(&TableVersion::new(4)));
        assert!(!TableVersion::new(i32::MAX).precedes(&TableVersion::new(i32::MIN)));
    }
}
