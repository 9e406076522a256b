use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Txid;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::chain::{HeaderSource, TxSource};
use crate::error::Error;
use crate::ingest::Ingest;
use crate::model::{MEMPOOL_SCORE_FLOOR, Score, score};
use crate::storage::{Store, keys};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Deployment parameters of the audit sweep; the grace windows and finality
/// depth are policy, not algorithm.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Seconds before an uncompleted pending transaction is re-examined.
    #[serde(default = "default_pending_grace")]
    pub pending_grace_secs: u64,
    /// Seconds before a mempool transaction is re-examined.
    #[serde(default = "default_mempool_grace")]
    pub mempool_grace_secs: u64,
    /// Confirmations after which mined state is marked immutable.
    #[serde(default = "default_finality")]
    pub finality_depth: u32,
    /// Concurrent proof checks per sweep, independent of the ingest pool.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Candidates examined per population per sweep.
    #[serde(default = "default_batch")]
    pub batch: usize,
}

fn default_pending_grace() -> u64 {
    120
}

fn default_mempool_grace() -> u64 {
    3600
}

fn default_finality() -> u32 {
    6
}

fn default_concurrency() -> usize {
    4
}

fn default_interval() -> u64 {
    60
}

fn default_batch() -> usize {
    256
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            pending_grace_secs: default_pending_grace(),
            mempool_grace_secs: default_mempool_grace(),
            finality_depth: default_finality(),
            concurrency: default_concurrency(),
            interval_secs: default_interval(),
            batch: default_batch(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AuditStats {
    pub checked: usize,
    pub rolled_back: usize,
    pub reindexed: usize,
    pub finalized: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Still unconfirmed; try again next sweep.
    Unconfirmed,
    /// Source unavailable; derived state reversed.
    RolledBack,
    /// Chain position changed; re-indexed at the new score.
    Reindexed,
    /// Deep enough past the finality window; marked immutable.
    Finalized,
    /// Transient disagreement (proof/header mismatch, fetch failure).
    Skipped,
    /// Already immutable or otherwise settled.
    Settled,
}

/// Periodically reconciles pending, recently mined and stale mempool
/// transactions against current chain state using SPV proofs.
#[derive(Clone)]
pub struct Auditor {
    store: Store,
    ingest: Arc<Ingest>,
    source: Arc<dyn TxSource>,
    headers: Arc<dyn HeaderSource>,
    cfg: AuditConfig,
}

impl Auditor {
    pub fn new(
        ingest: Arc<Ingest>,
        source: Arc<dyn TxSource>,
        headers: Arc<dyn HeaderSource>,
        cfg: AuditConfig,
    ) -> Self {
        Self {
            store: ingest.store().clone(),
            ingest,
            source,
            headers,
            cfg,
        }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.cfg.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.sweep().await {
                Ok(stats) => info!(?stats, "audit sweep"),
                Err(err) => warn!(%err, "audit sweep failed"),
            }
        }
    }

    /// One pass over the three audited populations.
    pub async fn sweep(&self) -> Result<AuditStats, Error> {
        let now = score(0, 0);
        let tip = self
            .store
            .log_score(&keys::log("progress"), "tip")
            .await?
            .unwrap_or_default() as u32;

        let queue_key = keys::queue(self.ingest.tag());
        let log_key = keys::log(self.ingest.tag());

        let mut candidates: Vec<Txid> = Vec::new();
        let mut seen: HashSet<Txid> = HashSet::new();

        let mut push = |txids: Vec<Txid>, candidates: &mut Vec<Txid>| {
            for txid in txids {
                if seen.insert(txid) {
                    candidates.push(txid);
                }
            }
        };

        // (a) pending transactions older than the short grace window
        let stale_pending = self
            .members_in(
                &queue_key,
                0,
                now.saturating_sub(self.cfg.pending_grace_secs * NANOS_PER_SEC),
            )
            .await?;
        push(stale_pending, &mut candidates);

        // (b) believed mined but not yet marked immutable
        let mined = self
            .members_in(&log_key, 0, MEMPOOL_SCORE_FLOOR)
            .await?;
        let mut unsettled = Vec::new();
        for txid in mined {
            let immutable = self
                .store
                .log_score(&keys::log("immutable"), &txid.to_string())
                .await?
                .is_some();
            if !immutable {
                unsettled.push(txid);
            }
        }
        push(unsettled, &mut candidates);

        // (c) mempool transactions older than the long grace window
        let stale_mempool = self
            .members_in(
                &log_key,
                MEMPOOL_SCORE_FLOOR,
                now.saturating_sub(self.cfg.mempool_grace_secs * NANOS_PER_SEC),
            )
            .await?;
        push(stale_mempool, &mut candidates);

        // audit checks run under their own limiter, independent of ingest
        let limiter = Arc::new(Semaphore::new(self.cfg.concurrency.max(1)));
        let mut handles = Vec::with_capacity(candidates.len());

        for txid in candidates {
            let auditor = self.clone();
            let limiter = limiter.clone();

            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.expect("limiter closed");
                auditor.check_tx(txid, tip).await
            }));
        }

        let mut stats = AuditStats::default();

        for handle in handles {
            let outcome = handle
                .await
                .map_err(|err| Error::storage(format!("audit task: {err}")))??;

            stats.checked += 1;
            match outcome {
                Outcome::RolledBack => stats.rolled_back += 1,
                Outcome::Reindexed => stats.reindexed += 1,
                Outcome::Finalized => stats.finalized += 1,
                Outcome::Skipped => stats.skipped += 1,
                Outcome::Unconfirmed | Outcome::Settled => {}
            }
        }

        Ok(stats)
    }

    async fn members_in(&self, key: &str, from: Score, to: Score) -> Result<Vec<Txid>, Error> {
        if from >= to {
            return Ok(Vec::new());
        }

        let entries = self
            .store
            .range(key, from, to, false, None, self.cfg.batch)
            .await?;

        Ok(entries
            .iter()
            .filter_map(|entry| entry.member.parse().ok())
            .collect())
    }

    async fn check_tx(&self, txid: Txid, tip: u32) -> Result<Outcome, Error> {
        let member = txid.to_string();
        let queue_key = keys::queue(self.ingest.tag());
        let log_key = keys::log(self.ingest.tag());

        // the source transaction disappearing invalidates everything derived
        let tx = match self.source.fetch_tx(&txid).await {
            Ok(tx) => tx,
            Err(Error::NotFound(_)) => {
                warn!(%txid, "source transaction gone, rolling back");
                self.store.rollback(&txid).await?;
                self.store
                    .delog(&queue_key, std::slice::from_ref(&member))
                    .await?;
                self.store
                    .delog(&log_key, std::slice::from_ref(&member))
                    .await?;
                return Ok(Outcome::RolledBack);
            }
            Err(err) => {
                debug!(%txid, %err, "source fetch failed, retrying next sweep");
                return Ok(Outcome::Skipped);
            }
        };

        let Some(proof) = self.source.fetch_proof(&txid).await? else {
            return Ok(Outcome::Unconfirmed);
        };

        // on mismatch do not roll back: headers may still be catching up
        let want = self.headers.merkle_root(proof.height).await?;
        if proof.compute_root(&txid) != want {
            warn!(%txid, height = proof.height, "merkle root mismatch, retrying next sweep");
            return Ok(Outcome::Skipped);
        }

        let proven_score = score(proof.height, proof.idx);
        let stored = self.store.log_score(&log_key, &member).await?;

        let mut outcome = Outcome::Settled;

        if stored != Some(proven_score) {
            // height changed: reorg or delayed confirmation
            self.ingest
                .ingest_tx(&tx, proof.height, proof.idx)
                .await?;
            outcome = Outcome::Reindexed;
        }

        if proof.height + self.cfg.finality_depth <= tip {
            self.store
                .log(&keys::log("immutable"), &member, proven_score)
                .await?;
            self.store
                .delog(&queue_key, std::slice::from_ref(&member))
                .await?;
            outcome = Outcome::Finalized;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bitcoin::Transaction;

    use crate::chain::MerklePath;
    use crate::ingest::testutil::{p2pkh_output, test_ingest, tx_with};
    use crate::model::score;
    use crate::search::{SearchCfg, search};
    use crate::storage::Store;

    use super::*;

    #[derive(Default)]
    struct MockSource {
        txs: Mutex<HashMap<Txid, Transaction>>,
        proofs: Mutex<HashMap<Txid, MerklePath>>,
    }

    #[async_trait]
    impl TxSource for MockSource {
        async fn fetch_tx(&self, txid: &Txid) -> Result<Transaction, Error> {
            self.txs
                .lock()
                .unwrap()
                .get(txid)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("tx {txid}")))
        }

        async fn fetch_proof(&self, txid: &Txid) -> Result<Option<MerklePath>, Error> {
            Ok(self.proofs.lock().unwrap().get(txid).cloned())
        }
    }

    #[derive(Default)]
    struct MockHeaders {
        roots: Mutex<HashMap<u32, [u8; 32]>>,
    }

    #[async_trait]
    impl HeaderSource for MockHeaders {
        async fn merkle_root(&self, height: u32) -> Result<[u8; 32], Error> {
            self.roots
                .lock()
                .unwrap()
                .get(&height)
                .copied()
                .ok_or_else(|| Error::not_ready(format!("no header at {height}")))
        }
    }

    fn single_tx_proof(height: u32) -> MerklePath {
        MerklePath {
            height,
            idx: 0,
            path: Vec::new(),
        }
    }

    async fn set_tip(store: &Store, height: u32) {
        store
            .log(&keys::log("progress"), "tip", height as u64)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reorged_transaction_is_reindexed_and_finalized() {
        let store = Store::memory();
        let ingest = test_ingest(store.clone());

        let source = Arc::new(MockSource::default());
        let headers = Arc::new(MockHeaders::default());

        let tx = tx_with(vec![], vec![p2pkh_output(1, 1000)]);
        let txid = tx.compute_txid();
        let member = txid.to_string();

        ingest.ingest_tx(&tx, 100, 0).await.unwrap();

        // the chain now places the transaction at height 101
        let proof = single_tx_proof(101);
        let root = proof.compute_root(&txid);
        source.txs.lock().unwrap().insert(txid, tx.clone());
        source.proofs.lock().unwrap().insert(txid, proof);
        headers.roots.lock().unwrap().insert(101, root);

        set_tip(&store, 110).await;

        let auditor = Auditor::new(ingest, source, headers, AuditConfig::default());
        let stats = auditor.sweep().await.unwrap();

        assert_eq!(stats.reindexed, 0);
        assert_eq!(stats.finalized, 1);

        assert_eq!(
            store.log_score(&keys::log("ingest"), &member).await.unwrap(),
            Some(score(101, 0))
        );
        assert_eq!(
            store
                .log_score(&keys::log("immutable"), &member)
                .await
                .unwrap(),
            Some(score(101, 0))
        );
    }

    #[tokio::test]
    async fn missing_source_rolls_back_pending() {
        let store = Store::memory();
        let ingest = test_ingest(store.clone());

        let tx = tx_with(vec![], vec![p2pkh_output(1, 1000)]);
        let txid = tx.compute_txid();
        let member = txid.to_string();

        let ctx = ingest.ingest_tx(&tx, 100, 0).await.unwrap();
        let owner = ctx.txos[0].owners.iter().next().cloned().unwrap();

        // stale pending marker, well past the grace window
        store
            .log(&keys::queue("ingest"), &member, 1_500_000_000_000_000_000)
            .await
            .unwrap();

        let auditor = Auditor::new(
            ingest,
            Arc::new(MockSource::default()),
            Arc::new(MockHeaders::default()),
            AuditConfig::default(),
        );
        let stats = auditor.sweep().await.unwrap();

        assert!(stats.rolled_back >= 1);
        assert!(
            store
                .log_score(&keys::queue("ingest"), &member)
                .await
                .unwrap()
                .is_none()
        );

        let hits = search(&store, &SearchCfg::key(keys::owner(&owner)))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn root_mismatch_is_transient() {
        let store = Store::memory();
        let ingest = test_ingest(store.clone());

        let source = Arc::new(MockSource::default());
        let headers = Arc::new(MockHeaders::default());

        let tx = tx_with(vec![], vec![p2pkh_output(1, 1000)]);
        let txid = tx.compute_txid();
        let member = txid.to_string();

        ingest.ingest_tx(&tx, 100, 0).await.unwrap();

        source.txs.lock().unwrap().insert(txid, tx.clone());
        source
            .proofs
            .lock()
            .unwrap()
            .insert(txid, single_tx_proof(101));
        // header disagrees with the proof
        headers.roots.lock().unwrap().insert(101, [0xFF; 32]);

        set_tip(&store, 110).await;

        let auditor = Auditor::new(ingest, source, headers, AuditConfig::default());
        let stats = auditor.sweep().await.unwrap();

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.rolled_back, 0);

        // stored score untouched
        assert_eq!(
            store.log_score(&keys::log("ingest"), &member).await.unwrap(),
            Some(score(100, 0))
        );
    }
}
