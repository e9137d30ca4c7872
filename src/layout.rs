//! Key layout
//!
//! Keys are order-preserving tuple encodings, scoped under a directory
//! subspace so several clusters can share one store:
//!
//! ```text
//! <dir>/(cluster_id, "version")                         -> table version
//! <dir>/(cluster_id, "member", silo)                    -> member record
//! <dir>/(cluster_id, "member", silo, "etag")            -> version stamp
//! ```
//!
//! Because tuples sort element by element, a member's record key sorts
//! directly before its etag key, and every key of a cluster falls inside
//! `range((cluster_id,))`.

use std::fmt;

use crate::error::{ClusteringError, ClusteringResult, StoreResult};
use crate::store::{KeyRange, ReadTransaction, Transaction};

const BYTES_CODE: u8 = 0x01;
const STRING_CODE: u8 = 0x02;
const NIL: u8 = 0x00;
const ESCAPE: u8 = 0xFF;
const DIRECTORY_MARKER: u8 = 0xFE;

/// One tuple element
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Element {
    Bytes(Vec<u8>),
    String(String),
}

impl Element {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Element::String(s) => Some(s),
            Element::Bytes(_) => None,
        }
    }
}

impl From<&str> for Element {
    fn from(s: &str) -> Self {
        Element::String(s.to_string())
    }
}

impl From<String> for Element {
    fn from(s: String) -> Self {
        Element::String(s)
    }
}

impl From<&[u8]> for Element {
    fn from(b: &[u8]) -> Self {
        Element::Bytes(b.to_vec())
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Element::String(s) => write!(f, "{:?}", s),
        }
    }
}

fn encode_escaped(out: &mut Vec<u8>, code: u8, data: &[u8]) {
    out.push(code);
    for &byte in data {
        out.push(byte);
        if byte == NIL {
            out.push(ESCAPE);
        }
    }
    out.push(NIL);
}

/// Encode a tuple
pub fn pack(elements: &[Element]) -> Vec<u8> {
    let mut out = Vec::new();
    for element in elements {
        match element {
            Element::Bytes(b) => encode_escaped(&mut out, BYTES_CODE, b),
            Element::String(s) => encode_escaped(&mut out, STRING_CODE, s.as_bytes()),
        }
    }
    out
}

/// Decode a tuple produced by [`pack`]
pub fn unpack(mut input: &[u8]) -> ClusteringResult<Vec<Element>> {
    let mut elements = Vec::new();
    while let Some((&code, rest)) = input.split_first() {
        let mut data = Vec::new();
        let mut i = 0;
        loop {
            match rest.get(i) {
                None => {
                    return Err(ClusteringError::Serialization(
                        "unterminated tuple element".into(),
                    ))
                }
                Some(&NIL) if rest.get(i + 1) == Some(&ESCAPE) => {
                    data.push(NIL);
                    i += 2;
                }
                Some(&NIL) => break,
                Some(&byte) => {
                    data.push(byte);
                    i += 1;
                }
            }
        }
        input = &rest[i + 1..];

        elements.push(match code {
            BYTES_CODE => Element::Bytes(data),
            STRING_CODE => Element::String(String::from_utf8(data).map_err(|e| {
                ClusteringError::Serialization(format!("invalid utf-8 in key: {}", e))
            })?),
            other => {
                return Err(ClusteringError::Serialization(format!(
                    "unsupported tuple type code 0x{:02x}",
                    other
                )))
            }
        });
    }
    Ok(elements)
}

/// A key prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn child(&self, elements: &[Element]) -> Subspace {
        Subspace::new(self.pack(elements))
    }

    pub fn pack(&self, elements: &[Element]) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(&pack(elements));
        key
    }

    /// Every key strictly inside the tuple `elements`
    pub fn range(&self, elements: &[Element]) -> KeyRange {
        let base = self.pack(elements);
        let mut begin = base.clone();
        begin.push(0x00);
        let mut end = base;
        end.push(0xFF);
        KeyRange::new(begin, end)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix)
    }

    pub fn unpack(&self, key: &[u8]) -> ClusteringResult<Vec<Element>> {
        let suffix = key.strip_prefix(self.prefix.as_slice()).ok_or_else(|| {
            ClusteringError::Serialization(format!(
                "key {} is outside subspace {}",
                hex::encode(key),
                hex::encode(&self.prefix)
            ))
        })?;
        unpack(suffix)
    }
}

/// A named subspace that exists only once created
///
/// Creation writes a marker key next to (not inside) the directory's own
/// subspace, so clearing a cluster never removes the directory itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    root: Subspace,
    name: String,
}

impl Directory {
    pub fn new(root: Subspace, name: impl Into<String>) -> Self {
        Self {
            root,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn marker_key(&self) -> Vec<u8> {
        let mut key = self.root.prefix().to_vec();
        key.push(DIRECTORY_MARKER);
        key.extend_from_slice(&pack(&["dir".into(), self.name.as_str().into()]));
        key
    }

    fn subspace(&self) -> Subspace {
        self.root.child(&[self.name.as_str().into()])
    }

    /// The directory's subspace, or `None` if it was never created
    pub async fn open<T>(&self, tx: &T) -> StoreResult<Option<Subspace>>
    where
        T: ReadTransaction + ?Sized,
    {
        Ok(tx
            .get(&self.marker_key())
            .await?
            .map(|_| self.subspace()))
    }

    pub async fn create_or_open<T>(&self, tx: &T) -> StoreResult<Subspace>
    where
        T: Transaction + ?Sized,
    {
        if tx.get(&self.marker_key()).await?.is_none() {
            tx.set(&self.marker_key(), self.name.as_bytes());
        }
        Ok(self.subspace())
    }
}

/// Key builders for one cluster inside the clustering directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterKeys {
    subspace: Subspace,
    cluster_id: String,
}

impl ClusterKeys {
    const VERSION: &'static str = "version";
    const MEMBER: &'static str = "member";
    const ETAG: &'static str = "etag";

    pub fn new(subspace: Subspace, cluster_id: impl Into<String>) -> Self {
        Self {
            subspace,
            cluster_id: cluster_id.into(),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn member_tuple(&self, identity: &str) -> Vec<Element> {
        vec![
            self.cluster_id.as_str().into(),
            Self::MEMBER.into(),
            identity.into(),
        ]
    }

    pub fn version_key(&self) -> Vec<u8> {
        self.subspace
            .pack(&[self.cluster_id.as_str().into(), Self::VERSION.into()])
    }

    pub fn member_key(&self, identity: &str) -> Vec<u8> {
        self.subspace.pack(&self.member_tuple(identity))
    }

    pub fn etag_key(&self, identity: &str) -> Vec<u8> {
        let mut tuple = self.member_tuple(identity);
        tuple.push(Self::ETAG.into());
        self.subspace.pack(&tuple)
    }

    /// Every record and etag key of the cluster
    pub fn members_range(&self) -> KeyRange {
        self.subspace
            .range(&[self.cluster_id.as_str().into(), Self::MEMBER.into()])
    }

    /// Every key of the cluster, version included
    pub fn cluster_range(&self) -> KeyRange {
        self.subspace.range(&[self.cluster_id.as_str().into()])
    }

    /// Classify a key from [`members_range`](Self::members_range)
    pub fn parse_member_key(&self, key: &[u8]) -> ClusteringResult<MemberKey> {
        let elements = self.subspace.unpack(key)?;
        let strings: Vec<&str> = elements.iter().filter_map(Element::as_str).collect();
        match strings.as_slice() {
            [cluster, Self::MEMBER, identity] if *cluster == self.cluster_id => {
                Ok(MemberKey::Record(identity.to_string()))
            }
            [cluster, Self::MEMBER, identity, Self::ETAG] if *cluster == self.cluster_id => {
                Ok(MemberKey::Etag(identity.to_string()))
            }
            _ => Err(ClusteringError::Serialization(format!(
                "unexpected key in member range: {}",
                elements
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// What a member-range key holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberKey {
    Record(String),
    Etag(String),
}
