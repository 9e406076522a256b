use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::Error;
use crate::model::{Score, score};

use super::{FeedClient, FeedEvent, MerklePath, STATUS_BLOCK_DONE, STATUS_TERMINATE, TxSource};

/// One line of a replay file.
#[derive(Debug, Deserialize)]
struct ReplayRecord {
    /// Raw transaction, hex encoded.
    raw: String,
    height: u32,
    idx: u64,
}

struct ReplayEntry {
    raw: Vec<u8>,
    tx: Transaction,
    height: u32,
    idx: u64,
}

/// File-backed feed for development runs and deterministic tests: a JSONL
/// file of `{raw, height, idx}` records, in delivery order. Block-boundary
/// status events are synthesized whenever the height advances. Also serves
/// as the transaction source for input resolution, since it holds every
/// transaction it will ever deliver.
pub struct ReplayFeed {
    entries: Arc<Vec<ReplayEntry>>,
    by_txid: HashMap<Txid, usize>,
}

impl ReplayFeed {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|err| Error::Config(format!("replay file: {err}")))?;

        let mut entries = Vec::new();
        let mut by_txid = HashMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let record: ReplayRecord = serde_json::from_str(line)?;
            let raw = hex::decode(&record.raw)
                .map_err(|err| Error::Config(format!("replay hex: {err}")))?;
            let tx: Transaction = bitcoin::consensus::deserialize(&raw)?;

            by_txid.insert(tx.compute_txid(), entries.len());
            entries.push(ReplayEntry {
                raw,
                tx,
                height: record.height,
                idx: record.idx,
            });
        }

        info!(count = entries.len(), "loaded replay feed");

        Ok(Self {
            entries: Arc::new(entries),
            by_txid,
        })
    }
}

#[async_trait]
impl FeedClient for ReplayFeed {
    async fn subscribe(&self, topic: &str, from: Score) -> Result<mpsc::Receiver<FeedEvent>, Error> {
        let (sender, receiver) = mpsc::channel(64);
        let entries = self.entries.clone();

        info!(topic, from, "replaying feed");

        tokio::spawn(async move {
            let mut last_height: Option<u32> = None;

            for entry in entries.iter() {
                if entry.height != 0 && score(entry.height, entry.idx) < from {
                    continue;
                }

                if let Some(previous) = last_height {
                    if entry.height > previous
                        && sender
                            .send(FeedEvent::Status {
                                code: STATUS_BLOCK_DONE,
                                height: previous,
                            })
                            .await
                            .is_err()
                    {
                        return;
                    }
                }
                last_height = Some(entry.height);

                if sender
                    .send(FeedEvent::Transaction {
                        raw: entry.raw.clone(),
                        height: entry.height,
                        idx: entry.idx,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }

            if let Some(height) = last_height {
                let _ = sender
                    .send(FeedEvent::Status {
                        code: STATUS_BLOCK_DONE,
                        height,
                    })
                    .await;
            }

            let _ = sender
                .send(FeedEvent::Status {
                    code: STATUS_TERMINATE,
                    height: last_height.unwrap_or_default(),
                })
                .await;
        });

        Ok(receiver)
    }
}

#[async_trait]
impl TxSource for ReplayFeed {
    async fn fetch_tx(&self, txid: &Txid) -> Result<Transaction, Error> {
        self.by_txid
            .get(txid)
            .map(|&i| self.entries[i].tx.clone())
            .ok_or_else(|| Error::not_found(format!("tx {txid} not in replay")))
    }

    async fn fetch_proof(&self, _txid: &Txid) -> Result<Option<MerklePath>, Error> {
        // a replay file carries no proofs
        Ok(None)
    }
}
