//! Stored payload encoding
//!
//! Records and the table version are JSON. Field types that have no natural
//! JSON form get a dedicated encoder/decoder pair here, wired to the record
//! through `#[serde(with = ...)]`:
//!
//! | type | stored as |
//! |---|---|
//! | `SiloAddress` | `"ip:port@generation"` |
//! | suspect list | `[["ip:port@generation", "<rfc3339>"], ...]` |
//! | `TableVersion` | bare integer |

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::types::{MembershipEntry, TableVersion};
use crate::error::ClusteringResult;

pub mod silo_address {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::membership::types::SiloAddress;

    pub fn serialize<S: Serializer>(value: &SiloAddress, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SiloAddress, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

pub mod suspect_times {
    use chrono::{DateTime, Utc};
    use serde::de::Error;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::membership::types::SiloAddress;

    pub fn serialize<S: Serializer>(
        value: &[(SiloAddress, DateTime<Utc>)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(value.len()))?;
        for (silo, time) in value {
            seq.serialize_element(&(silo.to_string(), time))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(SiloAddress, DateTime<Utc>)>, D::Error> {
        let raw = Vec::<(String, DateTime<Utc>)>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(silo, time)| {
                silo.parse::<SiloAddress>()
                    .map(|silo| (silo, time))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

impl Serialize for TableVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.version)
    }
}

impl<'de> Deserialize<'de> for TableVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i32::deserialize(deserializer).map(TableVersion::new)
    }
}

pub fn encode_entry(entry: &MembershipEntry) -> ClusteringResult<Vec<u8>> {
    Ok(serde_json::to_vec(entry)?)
}

pub fn decode_entry(bytes: &[u8]) -> ClusteringResult<MembershipEntry> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_table_version(version: &TableVersion) -> ClusteringResult<Vec<u8>> {
    Ok(serde_json::to_vec(version)?)
}

pub fn decode_table_version(bytes: &[u8]) -> ClusteringResult<TableVersion> {
    Ok(serde_json::from_slice(bytes)?)
}
