use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use bitcoin::Txid;
use bitcoin::hashes::Hash;
use chrono::Utc;
use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::storage::encdec::{DecodingError, malformed_input};

pub mod payload;

pub use payload::Payload;

/// Monotonic ordering key combining block height and in-block position, or
/// wall-clock recency for unconfirmed entries.
pub type Score = u64;

/// Key space reserved per block: room for up to 1e9 in-block positions.
pub const SCORE_PER_BLOCK: u64 = 1_000_000_000;

/// Scores at or above this value are wall-clock (mempool) keys. 1e18 ns is
/// September 2001, far above any realistic `height * SCORE_PER_BLOCK` key.
pub const MEMPOOL_SCORE_FLOOR: u64 = 1_000_000_000_000_000_000;

/// Ordering key for a transaction at the given chain position. Height zero
/// means unconfirmed; the wall-clock key interleaves with future confirmed
/// scores once the transaction is mined.
pub fn score(height: u32, idx: u64) -> Score {
    if height == 0 {
        Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX) as u64
    } else {
        height as u64 * SCORE_PER_BLOCK + idx
    }
}

pub fn is_mempool_score(score: Score) -> bool {
    score >= MEMPOOL_SCORE_FLOOR
}

/// Identity of one transaction output, stable for the life of the chain.
/// Serializes to the fixed string form `txid_index`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Outpoint {
    pub txid: Txid,
    pub vout: u32,
}

impl Outpoint {
    pub fn new(txid: Txid, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.txid, self.vout)
    }
}

impl FromStr for Outpoint {
    type Err = DecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, vout) = s
            .split_once('_')
            .ok_or_else(|| malformed_input("outpoint missing separator", s.as_bytes()))?;

        Ok(Self {
            txid: Txid::from_str(txid)
                .map_err(|_| malformed_input("outpoint txid", s.as_bytes()))?,
            vout: vout
                .parse()
                .map_err(|_| malformed_input("outpoint index", s.as_bytes()))?,
        })
    }
}

impl From<bitcoin::OutPoint> for Outpoint {
    fn from(outpoint: bitcoin::OutPoint) -> Self {
        Self {
            txid: outpoint.txid,
            vout: outpoint.vout,
        }
    }
}

impl From<Outpoint> for bitcoin::OutPoint {
    fn from(outpoint: Outpoint) -> Self {
        Self {
            txid: outpoint.txid,
            vout: outpoint.vout,
        }
    }
}

impl Serialize for Outpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Outpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A derived `(id, value)` search key attached to a TXO by a protocol
/// indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub value: String,
}

impl Event {
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
        }
    }
}

/// Everything one protocol indexer derived from one output: the typed
/// payload, secondary search events, and the outpoints the fact depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexData {
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<Outpoint>,
}

impl IndexData {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            events: Vec::new(),
            deps: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }

    pub fn with_deps(mut self, deps: Vec<Outpoint>) -> Self {
        self.deps = deps;
        self
    }
}

/// One transaction output and every fact derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txo {
    pub outpoint: Outpoint,
    /// Block height, zero while unconfirmed.
    pub height: u32,
    /// Position within the block, or mempool arrival order.
    pub idx: u64,
    /// Unset until the defining transaction has been resolved.
    pub satoshis: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub owners: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub data: IndexMap<String, IndexData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spend: Option<Txid>,
}

impl Txo {
    pub fn new(outpoint: Outpoint, height: u32, idx: u64) -> Self {
        Self {
            outpoint,
            height,
            idx,
            satoshis: None,
            owners: BTreeSet::new(),
            data: IndexMap::new(),
            spend: None,
        }
    }

    pub fn add_owner(&mut self, owner: impl Into<String>) {
        self.owners.insert(owner.into());
    }

    pub fn data_for(&self, tag: &str) -> Option<&IndexData> {
        self.data.get(tag)
    }

    pub fn is_spent(&self) -> bool {
        self.spend.is_some()
    }
}

/// Placeholder txid used where no real transaction exists yet.
pub fn null_txid() -> Txid {
    Txid::from_byte_array([0u8; 32])
}
