use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::chain::TxSource;
use crate::error::Error;
use crate::model::score;
use crate::storage::{Store, keys};

pub mod audit;
pub mod context;
pub mod indexers;
pub mod scheduler;

use context::{Resolver, TxContext};
use indexers::{Indexer, IndexerFactory};
use scheduler::ProcessTx;

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Name of this pipeline's pending queue and completion log.
    #[serde(default = "default_tag")]
    pub tag: String,
    /// Worker pool size.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Indexer chain, in execution order. Empty means the full default
    /// chain.
    #[serde(default)]
    pub indexers: Vec<IndexerFactory>,
}

fn default_tag() -> String {
    "ingest".to_string()
}

fn default_concurrency() -> usize {
    8
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            tag: default_tag(),
            concurrency: default_concurrency(),
            indexers: Vec::new(),
        }
    }
}

impl IngestConfig {
    pub fn build_chain(&self) -> Vec<Box<dyn Indexer>> {
        if self.indexers.is_empty() {
            indexers::default_chain()
        } else {
            self.indexers
                .iter()
                .cloned()
                .map(IndexerFactory::create_indexer)
                .collect()
        }
    }
}

/// Per-transaction pipeline: resolve spends, run the indexer chain, persist
/// through the event log store.
pub struct Ingest {
    store: Store,
    chain: Vec<Box<dyn Indexer>>,
    resolver: Resolver,
    tag: String,
}

impl Ingest {
    pub fn new(
        store: Store,
        chain: Vec<Box<dyn Indexer>>,
        source: Arc<dyn TxSource>,
        tag: String,
    ) -> Arc<Self> {
        let resolver = Resolver::new(store.clone(), source);

        Arc::new(Self {
            store,
            chain,
            resolver,
            tag,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Record a transaction in the pending-ingest queue at admission time.
    /// Claim-once, so a redelivered transaction keeps its original age.
    pub async fn mark_pending(&self, txid: &Txid) -> Result<(), Error> {
        self.store
            .log_once(&keys::queue(&self.tag), &txid.to_string(), score(0, 0))
            .await
            .map(drop)
    }

    /// Parse one transaction without persisting: resolve spends, run every
    /// indexer over every output, then every indexer's cross-output pass.
    pub async fn parse_tx(
        &self,
        tx: &Transaction,
        height: u32,
        idx: u64,
    ) -> Result<TxContext, Error> {
        let mut ctx = TxContext::new(tx.clone(), height, idx);

        if !tx.is_coinbase() {
            for input in &tx.input {
                let outpoint = input.previous_output.into();
                let txo = self.resolver.resolve(&outpoint).await.map_err(|err| {
                    match err {
                        // an unresolved source is a scheduling concern here
                        Error::NotFound(msg) => Error::NotReady(msg),
                        other => other,
                    }
                })?;
                ctx.spends.push(txo);
            }
        }

        for vout in 0..ctx.txos.len() {
            for indexer in &self.chain {
                if let Some(data) = indexer.parse(&mut ctx, vout) {
                    ctx.txos[vout].data.insert(indexer.tag().to_string(), data);
                }
            }
        }

        for indexer in &self.chain {
            indexer.pre_save(&mut ctx);
        }

        Ok(ctx)
    }

    /// Persist a parsed transaction, then move it from the pending queue to
    /// the completion log. Bookkeeping strictly follows persistence.
    pub async fn save(&self, ctx: &TxContext) -> Result<(), Error> {
        for spent in &ctx.spends {
            self.store.save_spend(spent, &ctx.txid, ctx.score).await?;
        }

        for txo in &ctx.txos {
            self.store.save_txo(txo, ctx.score).await?;
        }

        let member = ctx.txid.to_string();
        self.store
            .delog(&keys::queue(&self.tag), std::slice::from_ref(&member))
            .await?;
        self.store
            .log(&keys::log(&self.tag), &member, ctx.score)
            .await?;

        debug!(txid = %ctx.txid, score = ctx.score, "ingested");

        Ok(())
    }

    /// Full pipeline for one transaction.
    pub async fn ingest_tx(
        &self,
        tx: &Transaction,
        height: u32,
        idx: u64,
    ) -> Result<TxContext, Error> {
        let ctx = self.parse_tx(tx, height, idx).await?;
        self.save(&ctx).await?;
        Ok(ctx)
    }
}

#[async_trait]
impl ProcessTx for Ingest {
    async fn process(&self, tx: &Transaction, height: u32, idx: u64) -> Result<(), Error> {
        self.ingest_tx(tx, height, idx).await.map(drop)
    }

    async fn discard(&self, txid: &Txid) {
        // tear down whatever partial state the failed attempts left behind
        if let Err(err) = self.store.rollback(txid).await {
            warn!(%txid, %err, "rollback of discarded transaction failed");
        }

        if let Err(err) = self
            .store
            .delog(&keys::queue(&self.tag), &[txid.to_string()])
            .await
        {
            warn!(%txid, %err, "dropping pending marker failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use async_trait::async_trait;
    use bitcoin::hashes::Hash;
    use bitcoin::{
        Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
    };

    use crate::chain::{MerklePath, TxSource};
    use crate::error::Error;
    use crate::storage::Store;

    use super::Ingest;

    /// Source with no network behind it: everything is gone.
    pub struct EmptySource;

    #[async_trait]
    impl TxSource for EmptySource {
        async fn fetch_tx(&self, txid: &Txid) -> Result<Transaction, Error> {
            Err(Error::not_found(format!("tx {txid}")))
        }

        async fn fetch_proof(&self, _txid: &Txid) -> Result<Option<MerklePath>, Error> {
            Ok(None)
        }
    }

    pub fn test_ingest(store: Store) -> Arc<Ingest> {
        Ingest::new(
            store,
            super::indexers::default_chain(),
            Arc::new(EmptySource),
            "ingest".to_string(),
        )
    }

    pub fn tx_with(inputs: Vec<OutPoint>, outputs: Vec<TxOut>) -> Transaction {
        let input = if inputs.is_empty() {
            // coinbase shape: single null input
            vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::builder().push_slice([0u8; 4]).into_script(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }]
        } else {
            inputs
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect()
        };

        Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input,
            output: outputs,
        }
    }

    pub fn unit_output(script_pubkey: ScriptBuf) -> TxOut {
        TxOut {
            value: Amount::from_sat(1),
            script_pubkey,
        }
    }

    pub fn p2pkh_output(seed: u8, satoshis: u64) -> TxOut {
        let hash = bitcoin::PubkeyHash::from_raw_hash(bitcoin::hashes::hash160::Hash::hash(&[
            seed, seed, seed,
        ]));

        TxOut {
            value: Amount::from_sat(satoshis),
            script_pubkey: ScriptBuf::new_p2pkh(&hash),
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::OutPoint;

    use crate::ingest::indexers::{inscription, origin};
    use crate::model::{Outpoint, Payload, score};
    use crate::search::{SearchCfg, search};
    use crate::storage::{Store, keys};

    use super::testutil::*;

    /// The lineage scenario end to end: a genesis inscription, a transfer
    /// inheriting its origin, and a rollback that restores the world.
    #[tokio::test]
    async fn lineage_survives_transfer_and_rollback() {
        let store = Store::memory();
        let ingest = test_ingest(store.clone());

        // transaction A: no inputs, one 1-sat inscribed output
        let tx_a = tx_with(
            vec![],
            vec![unit_output(inscription::envelope_script(
                "text/plain",
                b"genesis",
            ))],
        );
        let a_txid = tx_a.compute_txid();
        let a_out = Outpoint::new(a_txid, 0);

        ingest.ingest_tx(&tx_a, 100, 0).await.unwrap();

        let txo_a = store.load_txo(&a_out).await.unwrap().unwrap();
        let Payload::Origin(origin_a) = &txo_a.data_for(origin::TAG).unwrap().payload else {
            panic!("missing lineage record")
        };
        assert_eq!(origin_a.origin, a_out);
        assert_eq!(origin_a.nonce, 0);

        // transaction B spends A's output into one new 1-sat output
        let tx_b = tx_with(
            vec![OutPoint::from(a_out)],
            vec![unit_output(bitcoin::ScriptBuf::new())],
        );
        let b_txid = tx_b.compute_txid();
        let b_out = Outpoint::new(b_txid, 0);

        ingest.ingest_tx(&tx_b, 100, 1).await.unwrap();

        let txo_b = store.load_txo(&b_out).await.unwrap().unwrap();
        let Payload::Origin(origin_b) = &txo_b.data_for(origin::TAG).unwrap().payload else {
            panic!("missing lineage record")
        };
        assert_eq!(origin_b.origin, a_out);
        assert_eq!(origin_b.nonce, 1);

        // A's output is marked spent by B
        assert_eq!(store.get_spend(&a_out).await.unwrap(), Some(b_txid));

        let lineage_key = keys::event(origin::TAG, "outpoint", &a_out.to_string());
        let hits = search(&store, &SearchCfg::key(lineage_key.clone()))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);

        // roll B back
        store.rollback(&b_txid).await.unwrap();

        assert!(store.load_txo(&b_out).await.unwrap().is_none());
        assert_eq!(store.get_spend(&a_out).await.unwrap(), None);
        assert!(store.load_txo(&a_out).await.unwrap().is_some());

        let hits = search(&store, &SearchCfg::key(lineage_key)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].member, a_out.to_string());

        // rolling back an absent transaction is a no-op
        store.rollback(&b_txid).await.unwrap();
    }

    #[tokio::test]
    async fn missing_source_is_not_ready() {
        use bitcoin::hashes::Hash;

        let store = Store::memory();
        let ingest = test_ingest(store.clone());

        let phantom = Outpoint::new(bitcoin::Txid::from_byte_array([0x77; 32]), 0);

        let tx = tx_with(vec![OutPoint::from(phantom)], vec![p2pkh_output(1, 50)]);

        let err = ingest.ingest_tx(&tx, 100, 0).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::NotReady(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn completion_moves_queue_to_log() {
        let store = Store::memory();
        let ingest = test_ingest(store.clone());

        let tx = tx_with(vec![], vec![p2pkh_output(1, 50)]);
        let member = tx.compute_txid().to_string();

        ingest.mark_pending(&tx.compute_txid()).await.unwrap();
        assert!(
            store
                .log_score(&keys::queue("ingest"), &member)
                .await
                .unwrap()
                .is_some()
        );

        ingest.ingest_tx(&tx, 42, 7).await.unwrap();

        assert!(
            store
                .log_score(&keys::queue("ingest"), &member)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            store.log_score(&keys::log("ingest"), &member).await.unwrap(),
            Some(score(42, 7))
        );
    }

    #[tokio::test]
    async fn owners_are_attributed_and_searchable() {
        let store = Store::memory();
        let ingest = test_ingest(store.clone());

        let tx = tx_with(vec![], vec![p2pkh_output(3, 5000)]);
        let ctx = ingest.ingest_tx(&tx, 10, 0).await.unwrap();

        let owner = ctx.txos[0].owners.iter().next().cloned().unwrap();

        let hits = search(&store, &SearchCfg::key(keys::owner(&owner)))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].member, ctx.txos[0].outpoint.to_string());
        assert_eq!(hits[0].score, score(10, 0));
    }
}
