use std::sync::Arc;
use std::time::Duration;

use crate::chain::{FeedClient, TxSource};
use crate::error::Error;
use crate::ingest::Ingest;
use crate::ingest::scheduler::Scheduler;
use crate::storage::{Store, keys};

use super::Config;
use super::stages::{ingest, source};

const DEFAULT_STAGE_QUEUE_SIZE: usize = 20;
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 600;

fn gasket_policy(stage_timeout: u64) -> gasket::runtime::Policy {
    let default_retries = gasket::retries::Policy {
        max_retries: 20,
        backoff_unit: Duration::from_secs(1),
        backoff_factor: 2,
        max_backoff: Duration::from_secs(60),
        ..Default::default()
    };

    gasket::runtime::Policy {
        tick_timeout: Duration::from_secs(stage_timeout).into(),
        bootstrap_retry: default_retries.clone(),
        work_retry: default_retries.clone(),
        teardown_retry: default_retries,
    }
}

/// Wire the source and ingest stages into a running daemon: feed events in,
/// fully indexed blocks out.
pub async fn pipeline(
    config: &Config,
    store: Store,
    feed: Arc<dyn FeedClient>,
    tx_source: Arc<dyn TxSource>,
) -> Result<gasket::daemon::Daemon, Error> {
    let engine = Ingest::new(
        store.clone(),
        config.ingest.build_chain(),
        tx_source,
        config.ingest.tag.clone(),
    );

    let scheduler = Scheduler::spawn(engine.clone(), config.ingest.concurrency);

    // resume past the last fully indexed block
    let cursor = store
        .log_score(&keys::log("progress"), "tip")
        .await?
        .map(|height| crate::model::score(height as u32 + 1, 0))
        .unwrap_or_default();

    let mut source_stage = source::Stage::new(feed, config.topic.clone(), cursor);
    let mut ingest_stage = ingest::Stage::new(engine, scheduler, store);

    let queue_size = config.stage_queue_size.unwrap_or(DEFAULT_STAGE_QUEUE_SIZE);
    let stage_timeout = config
        .stage_timeout_secs
        .unwrap_or(DEFAULT_STAGE_TIMEOUT_SECS);

    let (source_to_ingest, ingest_from_source) = gasket::messaging::tokio::mpsc_channel(queue_size);
    source_stage.downstream.connect(source_to_ingest);
    ingest_stage.upstream.connect(ingest_from_source);

    let policy = gasket_policy(stage_timeout);

    let source_tether = gasket::runtime::spawn_stage(source_stage, policy.clone());
    let ingest_tether = gasket::runtime::spawn_stage(ingest_stage, policy);

    Ok(gasket::daemon::Daemon::new(vec![source_tether, ingest_tether]))
}
