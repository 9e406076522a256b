use std::sync::Arc;

use bitcoin::Transaction;
use gasket::framework::*;
use tracing::{info, warn};

use crate::chain::{FeedEvent, STATUS_BLOCK_DONE};
use crate::ingest::Ingest;
use crate::ingest::scheduler::Scheduler;
use crate::storage::{Store, keys};

/*
    Ingest Stage

    Admits feed transactions into the dependency-ordered scheduler. A
    block-done status waits for the admitted batch to drain before advancing
    the persisted progress height, so everything up to the boundary is fully
    indexed before the boundary becomes visible.
*/

pub type UpstreamPort = gasket::messaging::InputPort<FeedEvent>;

#[derive(Stage)]
#[stage(name = "ingest", unit = "FeedEvent", worker = "Worker")]
pub struct Stage {
    ingest: Arc<Ingest>,
    scheduler: Arc<Scheduler>,
    store: Store,

    pub upstream: UpstreamPort,
}

impl Stage {
    pub fn new(ingest: Arc<Ingest>, scheduler: Arc<Scheduler>, store: Store) -> Self {
        Self {
            ingest,
            scheduler,
            store,
            upstream: Default::default(),
        }
    }
}

pub struct Worker;

#[async_trait::async_trait(?Send)]
impl gasket::framework::Worker<Stage> for Worker {
    async fn bootstrap(_stage: &Stage) -> Result<Self, WorkerError> {
        Ok(Worker)
    }

    async fn schedule(
        &mut self,
        stage: &mut Stage,
    ) -> Result<WorkSchedule<FeedEvent>, WorkerError> {
        let event = stage.upstream.recv().await.or_panic()?.payload;

        Ok(WorkSchedule::Unit(event))
    }

    async fn execute(&mut self, unit: &FeedEvent, stage: &mut Stage) -> Result<(), WorkerError> {
        match unit {
            FeedEvent::Transaction { raw, height, idx } => {
                let tx: Transaction = match bitcoin::consensus::deserialize(raw) {
                    Ok(tx) => tx,
                    Err(err) => {
                        warn!(%err, "skipping undecodable feed transaction");
                        return Ok(());
                    }
                };

                stage
                    .ingest
                    .mark_pending(&tx.compute_txid())
                    .await
                    .or_restart()?;

                stage.scheduler.admit(tx, *height, *idx);
            }
            FeedEvent::Status { code, height } if *code == STATUS_BLOCK_DONE => {
                // everything admitted up to the boundary must land first
                stage.scheduler.wait_idle().await;

                stage
                    .store
                    .log(&keys::log("progress"), "tip", *height as u64)
                    .await
                    .or_restart()?;

                info!(height, "block fully indexed");
            }
            FeedEvent::Status { code, height } => {
                info!(code, height, "ignoring feed status");
            }
        }

        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }
}
