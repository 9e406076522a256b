use std::sync::Arc;

use gasket::framework::*;
use tokio::sync::mpsc;
use tracing::info;

use crate::chain::{FeedClient, FeedEvent, STATUS_TERMINATE};
use crate::model::Score;

/*
    Source Stage

    Subscribes to the transaction feed and forwards its events downstream to
    the ingest stage. The feed's terminate sentinel ends the pipeline.
*/

pub type DownstreamPort = gasket::messaging::tokio::OutputPort<FeedEvent>;

#[derive(Stage)]
#[stage(name = "source", unit = "FeedEvent", worker = "Worker")]
pub struct Stage {
    feed: Arc<dyn FeedClient>,
    topic: String,
    cursor: Score,

    pub downstream: DownstreamPort,
}

impl Stage {
    pub fn new(feed: Arc<dyn FeedClient>, topic: String, cursor: Score) -> Self {
        Self {
            feed,
            topic,
            cursor,
            downstream: Default::default(),
        }
    }
}

pub struct Worker {
    events: mpsc::Receiver<FeedEvent>,
}

#[async_trait::async_trait(?Send)]
impl gasket::framework::Worker<Stage> for Worker {
    async fn bootstrap(stage: &Stage) -> Result<Self, WorkerError> {
        info!(topic = %stage.topic, cursor = stage.cursor, "subscribing to feed");

        let events = stage
            .feed
            .subscribe(&stage.topic, stage.cursor)
            .await
            .or_retry()?;

        Ok(Worker { events })
    }

    async fn schedule(&mut self, _stage: &mut Stage) -> Result<WorkSchedule<FeedEvent>, WorkerError> {
        match self.events.recv().await {
            Some(FeedEvent::Status { code, .. }) if code == STATUS_TERMINATE => {
                info!("feed terminated subscription");
                Ok(WorkSchedule::Done)
            }
            Some(event) => Ok(WorkSchedule::Unit(event)),
            None => Ok(WorkSchedule::Done),
        }
    }

    async fn execute(&mut self, unit: &FeedEvent, stage: &mut Stage) -> Result<(), WorkerError> {
        stage.downstream.send(unit.clone().into()).await.or_panic()?;

        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }
}
