use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::Error;

/// Work a scheduler worker runs for each runnable transaction.
#[async_trait]
pub trait ProcessTx: Send + Sync + 'static {
    async fn process(&self, tx: &Transaction, height: u32, idx: u64) -> Result<(), Error>;

    /// Cleanup hook for a transaction dropped after a terminal failure.
    async fn discard(&self, _txid: &Txid) {}
}

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(5);

/// Scheduler unit, ephemeral: created on admission, destroyed on
/// completion.
struct TxnStatus {
    tx: Transaction,
    height: u32,
    idx: u64,
    /// Admitted ancestors still in flight.
    parents: HashSet<Txid>,
    /// Admitted descendants waiting on this transaction.
    children: HashSet<Txid>,
    attempts: u32,
}

#[derive(Default)]
struct InFlight {
    entries: HashMap<Txid, TxnStatus>,
}

/// Turns an out-of-order stream of interdependent transactions into a safe
/// processing order with bounded concurrency. A transaction whose parent is
/// still in flight waits; completion promotes any child whose last parent
/// just finished. The shared outstanding count reaches zero exactly when an
/// admitted batch has fully completed.
///
/// All edge bookkeeping happens in short, lock-only critical sections;
/// parsing, validation and storage never run under the lock.
pub struct Scheduler {
    state: Mutex<InFlight>,
    runnable: mpsc::UnboundedSender<Txid>,
    outstanding: watch::Sender<u64>,
}

impl Scheduler {
    /// Start the worker pool and return the shared scheduler handle.
    pub fn spawn(processor: Arc<dyn ProcessTx>, concurrency: usize) -> Arc<Self> {
        let (runnable, queue) = mpsc::unbounded_channel();
        let (outstanding, _) = watch::channel(0u64);

        let scheduler = Arc::new(Self {
            state: Mutex::new(InFlight::default()),
            runnable,
            outstanding,
        });

        let queue = Arc::new(tokio::sync::Mutex::new(queue));

        for _ in 0..concurrency.max(1) {
            tokio::spawn(worker(scheduler.clone(), processor.clone(), queue.clone()));
        }

        scheduler
    }

    /// Register a transaction. It becomes runnable immediately unless one of
    /// its input-source transactions is itself still in flight.
    pub fn admit(&self, tx: Transaction, height: u32, idx: u64) {
        let txid = tx.compute_txid();

        let ready = {
            let mut state = self.state.lock().unwrap();

            if state.entries.contains_key(&txid) {
                debug!(%txid, "duplicate admission ignored");
                return;
            }

            let parents: HashSet<Txid> = tx
                .input
                .iter()
                .map(|input| input.previous_output.txid)
                .filter(|parent| state.entries.contains_key(parent))
                .collect();

            for parent in &parents {
                state
                    .entries
                    .get_mut(parent)
                    .unwrap()
                    .children
                    .insert(txid);
            }

            let ready = parents.is_empty();

            state.entries.insert(
                txid,
                TxnStatus {
                    tx,
                    height,
                    idx,
                    parents,
                    children: HashSet::new(),
                    attempts: 0,
                },
            );

            ready
        };

        self.outstanding.send_modify(|n| *n += 1);

        if ready {
            let _ = self.runnable.send(txid);
        }
    }

    /// Number of admitted transactions not yet completed.
    pub fn in_flight(&self) -> u64 {
        *self.outstanding.borrow()
    }

    /// Block until every admitted transaction has completed. Safe to call
    /// from multiple waiters; each is released once the count hits zero.
    pub async fn wait_idle(&self) {
        let mut watcher = self.outstanding.subscribe();
        let _ = watcher.wait_for(|outstanding| *outstanding == 0).await;
    }

    /// Remove a finished transaction and promote any child whose parent set
    /// just became empty.
    fn complete(&self, txid: &Txid) {
        let promoted = {
            let mut state = self.state.lock().unwrap();

            let Some(entry) = state.entries.remove(txid) else {
                return;
            };

            let mut promoted = Vec::new();
            for child in entry.children {
                if let Some(status) = state.entries.get_mut(&child) {
                    status.parents.remove(txid);
                    if status.parents.is_empty() {
                        promoted.push(child);
                    }
                }
            }

            promoted
        };

        for child in promoted {
            let _ = self.runnable.send(child);
        }

        self.outstanding
            .send_modify(|n| *n = n.saturating_sub(1));
    }

    fn snapshot(&self, txid: &Txid) -> Option<(Transaction, u32, u64, u32)> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .get(txid)
            .map(|entry| (entry.tx.clone(), entry.height, entry.idx, entry.attempts))
    }

    fn bump_attempts(&self, txid: &Txid) {
        if let Some(entry) = self.state.lock().unwrap().entries.get_mut(txid) {
            entry.attempts += 1;
        }
    }
}

async fn worker(
    scheduler: Arc<Scheduler>,
    processor: Arc<dyn ProcessTx>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Txid>>>,
) {
    loop {
        let txid = {
            let mut queue = queue.lock().await;
            match queue.recv().await {
                Some(txid) => txid,
                None => return,
            }
        };

        // snapshot the unit outside any further locking
        let Some((tx, height, idx, attempts)) = scheduler.snapshot(&txid) else {
            continue;
        };

        match processor.process(&tx, height, idx).await {
            Ok(()) => scheduler.complete(&txid),
            Err(err) if err.is_retryable() => {
                scheduler.bump_attempts(&txid);

                let backoff = RETRY_BASE
                    .saturating_mul(1 << attempts.min(6))
                    .min(RETRY_CAP);

                debug!(%txid, %err, attempts, ?backoff, "retrying transaction");

                // requeue on a timer so the worker stays available
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = scheduler.runnable.send(txid);
                });
            }
            Err(err) => {
                warn!(%txid, %err, "dropping transaction after terminal failure");
                processor.discard(&txid).await;
                scheduler.complete(&txid);
            }
        }
    }
}
