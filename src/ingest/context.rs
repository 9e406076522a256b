use std::sync::Arc;

use bitcoin::{Transaction, Txid};
use mini_moka::sync::Cache;

use crate::chain::TxSource;
use crate::error::Error;
use crate::ingest::indexers::address::owner_of;
use crate::model::{Outpoint, Score, Txo, score};
use crate::storage::Store;

/// Everything the protocol indexer chain sees while one transaction is in
/// flight: the resolved spent inputs and the outputs being assembled.
pub struct TxContext {
    pub txid: Txid,
    pub tx: Transaction,
    /// Block height, zero while unconfirmed.
    pub height: u32,
    /// Position within the block, or mempool arrival order.
    pub idx: u64,
    /// Ordering score, fixed at construction so every write for this
    /// transaction shares it.
    pub score: Score,
    /// Hydrated source outputs for each input, in input order. Empty for
    /// coinbase transactions.
    pub spends: Vec<Txo>,
    /// One entry per output, accumulating owner and indexer data.
    pub txos: Vec<Txo>,
}

impl TxContext {
    pub fn new(tx: Transaction, height: u32, idx: u64) -> Self {
        let txid = tx.compute_txid();

        let txos = tx
            .output
            .iter()
            .enumerate()
            .map(|(vout, output)| {
                let mut txo = Txo::new(Outpoint::new(txid, vout as u32), height, idx);
                txo.satoshis = Some(output.value.to_sat());
                txo
            })
            .collect();

        Self {
            txid,
            tx,
            height,
            idx,
            score: score(height, idx),
            spends: Vec::new(),
            txos,
        }
    }
}

const TX_CACHE_CAPACITY: u64 = 4096;

/// Resolves spent outpoints to their source outputs: from the store when the
/// parent is already indexed, otherwise by hydrating a bare output from the
/// fetched source transaction.
pub struct Resolver {
    store: Store,
    source: Arc<dyn TxSource>,
    cache: Cache<Txid, Arc<Transaction>>,
}

impl Resolver {
    pub fn new(store: Store, source: Arc<dyn TxSource>) -> Self {
        Self {
            store,
            source,
            cache: Cache::new(TX_CACHE_CAPACITY),
        }
    }

    pub async fn resolve(&self, outpoint: &Outpoint) -> Result<Txo, Error> {
        if let Some(txo) = self.store.load_txo(outpoint).await? {
            return Ok(txo);
        }

        let tx = match self.cache.get(&outpoint.txid) {
            Some(tx) => tx,
            None => {
                let tx = Arc::new(self.source.fetch_tx(&outpoint.txid).await?);
                self.cache.insert(outpoint.txid, tx.clone());
                tx
            }
        };

        let output = tx.output.get(outpoint.vout as usize).ok_or_else(|| {
            Error::not_found(format!("{outpoint} out of range"))
        })?;

        // bare output: value and ownership only, no derived protocol data
        let mut txo = Txo::new(*outpoint, 0, 0);
        txo.satoshis = Some(output.value.to_sat());
        if let Some(owner) = owner_of(&output.script_pubkey) {
            txo.add_owner(owner);
        }

        Ok(txo)
    }
}

#[cfg(test)]
pub(crate) fn test_ctx(scripts: Vec<bitcoin::ScriptBuf>) -> TxContext {
    let outputs = scripts
        .into_iter()
        .map(|script_pubkey| bitcoin::TxOut {
            value: bitcoin::Amount::from_sat(1),
            script_pubkey,
        })
        .collect();

    test_ctx_outputs(outputs)
}

#[cfg(test)]
pub(crate) fn test_ctx_with_values(satoshis: Vec<u64>) -> TxContext {
    let outputs = satoshis
        .into_iter()
        .map(|value| bitcoin::TxOut {
            value: bitcoin::Amount::from_sat(value),
            script_pubkey: bitcoin::ScriptBuf::new(),
        })
        .collect();

    test_ctx_outputs(outputs)
}

#[cfg(test)]
fn test_ctx_outputs(output: Vec<bitcoin::TxOut>) -> TxContext {
    let tx = Transaction {
        version: bitcoin::transaction::Version::ONE,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![bitcoin::TxIn {
            previous_output: bitcoin::OutPoint::null(),
            script_sig: bitcoin::ScriptBuf::new(),
            sequence: bitcoin::Sequence::MAX,
            witness: bitcoin::Witness::default(),
        }],
        output,
    };

    TxContext::new(tx, 100, 0)
}
