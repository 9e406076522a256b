use std::path::PathBuf;

use serde::Deserialize;

use crate::ingest::IngestConfig;
use crate::ingest::audit::AuditConfig;

pub mod pipeline;
pub mod stages;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,

    /// Feed topic to subscribe to.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Replay file driving the `run` command.
    pub replay: Option<PathBuf>,

    /// Max in-flight messages between the source and ingest stage.
    pub stage_queue_size: Option<usize>,
    pub stage_timeout_secs: Option<u64>,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub audit: AuditConfig,
}

fn default_topic() -> String {
    "main".to_string()
}

#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// RocksDB memory budget in GB (default 1.0).
    pub memory_budget: Option<f64>,
}

impl StorageConfig {
    pub fn memory_budget_bytes(&self) -> u64 {
        (self.memory_budget.unwrap_or(1.0) * 1024.0 * 1024.0 * 1024.0) as u64
    }
}
