use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::Error;
use crate::model::{IndexData, Outpoint, Score, Txo};
use crate::storage::keys;

/// One row of the storage primitive: a member of a search key at a score.
/// Uniqueness holds on `(search_key, member)`, last write wins on score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub member: String,
    pub score: Score,
}

/// Persisted projection of a [`Txo`]; protocol data and spend state live in
/// their own tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxoRecord {
    pub outpoint: Outpoint,
    pub height: u32,
    pub idx: u64,
    pub satoshis: Option<u64>,
    #[serde(default)]
    pub owners: BTreeSet<String>,
}

impl From<&Txo> for TxoRecord {
    fn from(txo: &Txo) -> Self {
        Self {
            outpoint: txo.outpoint,
            height: txo.height,
            idx: txo.idx,
            satoshis: txo.satoshis,
            owners: txo.owners.clone(),
        }
    }
}

/// Contract every storage backend satisfies. All score ordering, pagination
/// and merge logic lives above this trait; backends stay thin adapters over
/// their native encoding.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Upsert one entry.
    async fn log(&self, key: &str, member: &str, score: Score) -> Result<(), Error>;

    /// Insert only if absent; the claim-once primitive.
    async fn log_once(&self, key: &str, member: &str, score: Score) -> Result<bool, Error>;

    async fn delog(&self, key: &str, members: &[String]) -> Result<(), Error>;

    /// Point lookup. Absence is a routine outcome, not an error, and is
    /// distinct from a legitimate zero score.
    async fn log_score(&self, key: &str, member: &str) -> Result<Option<Score>, Error>;

    /// Score-ordered page over one key. `from..to` is half open; `after` is
    /// an exclusive resume position from a previous page.
    async fn range(
        &self,
        key: &str,
        from: Score,
        to: Score,
        reverse: bool,
        after: Option<&LogEntry>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, Error>;

    async fn get_spend(&self, outpoint: &Outpoint) -> Result<Option<Txid>, Error>;

    async fn get_spends(&self, outpoints: &[Outpoint]) -> Result<Vec<Option<Txid>>, Error>;

    /// Record the spend only if none exists, giving at-most-one-spender
    /// semantics under concurrent writers. A repeat claim by the recorded
    /// spender succeeds (idempotent retry).
    async fn set_new_spend(&self, outpoint: &Outpoint, spend: &Txid) -> Result<bool, Error>;

    async fn unset_spends(&self, outpoints: &[Outpoint]) -> Result<(), Error>;

    async fn put_txo(&self, record: &TxoRecord) -> Result<(), Error>;

    async fn get_txo(&self, outpoint: &Outpoint) -> Result<Option<TxoRecord>, Error>;

    async fn get_txos(&self, outpoints: &[Outpoint]) -> Result<Vec<Option<TxoRecord>>, Error>;

    async fn delete_txo(&self, outpoint: &Outpoint) -> Result<(), Error>;

    async fn put_data(&self, outpoint: &Outpoint, tag: &str, data: &[u8]) -> Result<(), Error>;

    async fn get_data(&self, outpoint: &Outpoint, tag: &str) -> Result<Option<Vec<u8>>, Error>;

    async fn get_all_data(&self, outpoint: &Outpoint) -> Result<Vec<(String, Vec<u8>)>, Error>;

    async fn delete_data(&self, outpoint: &Outpoint, tag: &str) -> Result<(), Error>;
}

/// Published after a successful write so downstream consumers can follow
/// keys they care about.
#[derive(Debug, Clone)]
pub struct KeyUpdate {
    pub key: String,
    pub member: String,
}

const PUBLISH_CAPACITY: usize = 256;

/// The Event Log Store: a backend plus the derived-key fan-out that turns
/// one output into every index it participates in.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn EventLogStore>,
    publish: broadcast::Sender<KeyUpdate>,
}

impl Store {
    pub fn new(backend: Arc<dyn EventLogStore>) -> Self {
        let (publish, _) = broadcast::channel(PUBLISH_CAPACITY);
        Self { backend, publish }
    }

    /// Ephemeral in-memory store.
    pub fn memory() -> Self {
        Self::new(Arc::new(super::memory::MemoryStore::new()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeyUpdate> {
        self.publish.subscribe()
    }

    fn announce(&self, key: &str, member: &str) {
        // receivers are optional; a lagging or absent subscriber is not an error
        let _ = self.publish.send(KeyUpdate {
            key: key.to_string(),
            member: member.to_string(),
        });
    }

    pub async fn log(&self, key: &str, member: &str, score: Score) -> Result<(), Error> {
        self.backend.log(key, member, score).await
    }

    pub async fn log_once(&self, key: &str, member: &str, score: Score) -> Result<bool, Error> {
        self.backend.log_once(key, member, score).await
    }

    pub async fn delog(&self, key: &str, members: &[String]) -> Result<(), Error> {
        self.backend.delog(key, members).await
    }

    pub async fn log_score(&self, key: &str, member: &str) -> Result<Option<Score>, Error> {
        self.backend.log_score(key, member).await
    }

    pub async fn range(
        &self,
        key: &str,
        from: Score,
        to: Score,
        reverse: bool,
        after: Option<&LogEntry>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, Error> {
        self.backend.range(key, from, to, reverse, after, limit).await
    }

    pub async fn get_spend(&self, outpoint: &Outpoint) -> Result<Option<Txid>, Error> {
        self.backend.get_spend(outpoint).await
    }

    pub async fn get_spends(&self, outpoints: &[Outpoint]) -> Result<Vec<Option<Txid>>, Error> {
        self.backend.get_spends(outpoints).await
    }

    pub async fn get_txo(&self, outpoint: &Outpoint) -> Result<Option<TxoRecord>, Error> {
        self.backend.get_txo(outpoint).await
    }

    pub async fn get_txos(&self, outpoints: &[Outpoint]) -> Result<Vec<Option<TxoRecord>>, Error> {
        self.backend.get_txos(outpoints).await
    }

    /// Persist one output and fan it out to every derived index key it
    /// participates in, then publish the touched keys.
    pub async fn save_txo(&self, txo: &Txo, score: Score) -> Result<(), Error> {
        let member = txo.outpoint.to_string();

        self.backend.put_txo(&TxoRecord::from(txo)).await?;

        let mut touched = vec![keys::tx(&txo.outpoint.txid)];

        for owner in &txo.owners {
            touched.push(keys::owner(owner));
        }

        for (tag, data) in &txo.data {
            self.backend
                .put_data(&txo.outpoint, tag, &serde_json::to_vec(data)?)
                .await?;

            touched.push(keys::tag(tag));

            for event in &data.events {
                touched.push(keys::event(tag, &event.id, &event.value));
            }

            for dep in &data.deps {
                self.backend.log(&keys::dep(dep), &member, score).await?;
            }
        }

        for key in &touched {
            self.backend.log(key, &member, score).await?;
        }

        for key in &touched {
            self.announce(key, &member);
        }

        Ok(())
    }

    /// Persist one tag's parsed payload for an already-saved output.
    pub async fn save_txo_data(
        &self,
        outpoint: &Outpoint,
        tag: &str,
        data: &IndexData,
        score: Score,
    ) -> Result<(), Error> {
        let member = outpoint.to_string();

        self.backend
            .put_data(outpoint, tag, &serde_json::to_vec(data)?)
            .await?;

        let mut touched = vec![keys::tag(tag)];
        for event in &data.events {
            touched.push(keys::event(tag, &event.id, &event.value));
        }
        for dep in &data.deps {
            self.backend.log(&keys::dep(dep), &member, score).await?;
        }

        for key in &touched {
            self.backend.log(key, &member, score).await?;
        }
        for key in &touched {
            self.announce(key, &member);
        }

        Ok(())
    }

    /// Mark an input as spent. Returns false when a different transaction
    /// already claimed the spend.
    pub async fn save_spend(&self, spent: &Txo, spend: &Txid, score: Score) -> Result<bool, Error> {
        let member = spent.outpoint.to_string();

        if !self.backend.set_new_spend(&spent.outpoint, spend).await? {
            warn!(outpoint = %spent.outpoint, spend = %spend, "spend already claimed");
            return Ok(false);
        }

        self.backend
            .log(&keys::tx_inputs(spend), &member, score)
            .await?;

        for owner in &spent.owners {
            self.announce(&keys::owner(owner), &member);
        }

        Ok(true)
    }

    /// Load an output with its protocol data and spend state hydrated.
    pub async fn load_txo(&self, outpoint: &Outpoint) -> Result<Option<Txo>, Error> {
        let Some(record) = self.backend.get_txo(outpoint).await? else {
            return Ok(None);
        };

        let mut txo = Txo {
            outpoint: record.outpoint,
            height: record.height,
            idx: record.idx,
            satoshis: record.satoshis,
            owners: record.owners,
            data: Default::default(),
            spend: self.backend.get_spend(outpoint).await?,
        };

        for (tag, bytes) in self.backend.get_all_data(outpoint).await? {
            match serde_json::from_slice::<IndexData>(&bytes) {
                Ok(data) => {
                    txo.data.insert(tag, data);
                }
                Err(err) => warn!(%outpoint, tag = %tag, %err, "undecodable stored payload"),
            }
        }

        Ok(Some(txo))
    }

    pub async fn load_txos(&self, outpoints: &[Outpoint]) -> Result<Vec<Option<Txo>>, Error> {
        let mut out = Vec::with_capacity(outpoints.len());
        for outpoint in outpoints {
            out.push(self.load_txo(outpoint).await?);
        }
        Ok(out)
    }

    /// Remove every log entry and stored payload the transaction produced,
    /// cascading through recorded dependents. Safe to call for a transaction
    /// that was never fully indexed; repeating the call is a no-op.
    pub async fn rollback(&self, txid: &Txid) -> Result<(), Error> {
        let mut seen = HashSet::new();
        self.rollback_inner(*txid, &mut seen).await
    }

    fn rollback_inner<'a>(
        &'a self,
        txid: Txid,
        seen: &'a mut HashSet<Txid>,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(async move {
            if !seen.insert(txid) {
                return Ok(());
            }

            let tx_key = keys::tx(&txid);
            let members = self.all_members(&tx_key).await?;

            // dependents first, so their derived keys don't dangle
            for member in &members {
                let Ok(outpoint) = Outpoint::from_str(member) else {
                    continue;
                };

                for dependent in self.all_members(&keys::dep(&outpoint)).await? {
                    if let Ok(dep_outpoint) = Outpoint::from_str(&dependent) {
                        self.rollback_inner(dep_outpoint.txid, seen).await?;
                    }
                }
            }

            for member in &members {
                let Ok(outpoint) = Outpoint::from_str(member) else {
                    continue;
                };

                if let Some(record) = self.backend.get_txo(&outpoint).await? {
                    for owner in &record.owners {
                        self.backend
                            .delog(&keys::owner(owner), std::slice::from_ref(member))
                            .await?;
                    }
                }

                for (tag, bytes) in self.backend.get_all_data(&outpoint).await? {
                    if let Ok(data) = serde_json::from_slice::<IndexData>(&bytes) {
                        for event in &data.events {
                            self.backend
                                .delog(
                                    &keys::event(&tag, &event.id, &event.value),
                                    std::slice::from_ref(member),
                                )
                                .await?;
                        }
                        for dep in &data.deps {
                            self.backend
                                .delog(&keys::dep(dep), std::slice::from_ref(member))
                                .await?;
                        }
                    }

                    self.backend
                        .delog(&keys::tag(&tag), std::slice::from_ref(member))
                        .await?;
                    self.backend.delete_data(&outpoint, &tag).await?;
                }

                self.backend.delete_txo(&outpoint).await?;
            }

            // release spend claims this transaction made
            let input_key = keys::tx_inputs(&txid);
            let inputs = self.all_members(&input_key).await?;

            let mut to_unset = Vec::new();
            for input in &inputs {
                if let Ok(outpoint) = Outpoint::from_str(input) {
                    if self.backend.get_spend(&outpoint).await? == Some(txid) {
                        to_unset.push(outpoint);
                    }
                }
            }
            self.backend.unset_spends(&to_unset).await?;
            self.backend.delog(&input_key, &inputs).await?;

            self.backend.delog(&tx_key, &members).await?;

            debug!(%txid, outputs = members.len(), "rolled back");

            Ok(())
        })
    }

    async fn all_members(&self, key: &str) -> Result<Vec<String>, Error> {
        const PAGE: usize = 256;

        let mut out = Vec::new();
        let mut after = None;

        loop {
            let page = self
                .backend
                .range(key, 0, u64::MAX, false, after.as_ref(), PAGE)
                .await?;
            let exhausted = page.len() < PAGE;

            after = page.last().cloned();
            out.extend(page.into_iter().map(|entry| entry.member));

            if exhausted {
                return Ok(out);
            }
        }
    }
}
