use async_trait::async_trait;
use bitcoin::hashes::{Hash, HashEngine, sha256d};
use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::model::Score;

pub mod replay;

/// Merkle inclusion path proving a transaction's position in a block,
/// validated against that block's header root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerklePath {
    pub height: u32,
    /// Position of the transaction within the block.
    pub idx: u64,
    /// Sibling hashes from leaf to root.
    pub path: Vec<[u8; 32]>,
}

impl MerklePath {
    /// Fold the path over the txid, taking left/right placement from the
    /// index bits.
    pub fn compute_root(&self, txid: &Txid) -> [u8; 32] {
        let mut node = txid.to_byte_array();
        let mut idx = self.idx;

        for sibling in &self.path {
            let mut engine = sha256d::Hash::engine();
            if idx & 1 == 1 {
                engine.input(sibling);
                engine.input(&node);
            } else {
                engine.input(&node);
                engine.input(sibling);
            }
            node = sha256d::Hash::from_engine(engine).to_byte_array();
            idx >>= 1;
        }

        node
    }
}

/// Supplies raw transactions and inclusion proofs; typically backed by the
/// network, here only its contract.
#[async_trait]
pub trait TxSource: Send + Sync {
    /// Fetch a raw transaction. `NotFound` means the network no longer knows
    /// it; `NotReady` means try again later.
    async fn fetch_tx(&self, txid: &Txid) -> Result<Transaction, Error>;

    /// Fetch the transaction's merkle path, or `None` while unconfirmed.
    async fn fetch_proof(&self, txid: &Txid) -> Result<Option<MerklePath>, Error>;
}

/// Block header access for SPV proof validation.
#[async_trait]
pub trait HeaderSource: Send + Sync {
    async fn merkle_root(&self, height: u32) -> Result<[u8; 32], Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastStatus {
    Accepted,
    Rejected(String),
}

/// Transaction relay collaborator; consumed by rollback-adjacent flows only.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, raw: &[u8]) -> Result<BroadcastStatus, Error>;
}

/// Block fully delivered up to the carried height.
pub const STATUS_BLOCK_DONE: u32 = 200;
/// Subscription terminated by the feed.
pub const STATUS_TERMINATE: u32 = 999;

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Transaction { raw: Vec<u8>, height: u32, idx: u64 },
    Status { code: u32, height: u32 },
}

/// Delivers the transaction stream for a subscribed topic, resuming from a
/// cursor score. A `STATUS_BLOCK_DONE` control event follows every block
/// boundary.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn subscribe(&self, topic: &str, from: Score) -> Result<mpsc::Receiver<FeedEvent>, Error>;
}
