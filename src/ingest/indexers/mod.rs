use serde::Deserialize;

use crate::error::Error;
use crate::ingest::context::TxContext;
use crate::model::IndexData;

pub mod address;
pub mod bitcom;
pub mod bsv21;
pub mod inscription;
pub mod ordlock;
pub mod origin;

pub use address::AddressIndexer;
pub use bitcom::BitcomIndexer;
pub use bsv21::{Bsv21Config, Bsv21Indexer};
pub use inscription::InscriptionIndexer;
pub use ordlock::OrdLockIndexer;
pub use origin::OriginIndexer;

/// Contract implemented by every protocol indexer. Indexers run in a fixed
/// configured order per output, so later indexers may read payloads earlier
/// ones attached to the shared per-output data map.
pub trait Indexer: Send + Sync {
    /// Unique namespace for this indexer's stored payload and derived
    /// events.
    fn tag(&self) -> &'static str;

    /// Examine one output and return a payload plus events, or nothing if
    /// not applicable.
    fn parse(&self, ctx: &mut TxContext, vout: usize) -> Option<IndexData>;

    /// Cross-output reconciliation, run once after every output of the
    /// transaction has been parsed by every indexer.
    fn pre_save(&self, _ctx: &mut TxContext) {}

    /// Deserialize a previously stored payload.
    fn from_bytes(&self, bytes: &[u8]) -> Result<IndexData, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Configurable indexer set, deserialized from the deployment config.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum IndexerFactory {
    Address,
    Bitcom,
    Inscription,
    Bsv21(Bsv21Config),
    OrdLock,
    Origin,
}

impl IndexerFactory {
    pub fn create_indexer(self) -> Box<dyn Indexer> {
        match self {
            Self::Address => Box::new(AddressIndexer::new()),
            Self::Bitcom => Box::new(BitcomIndexer::new()),
            Self::Inscription => Box::new(InscriptionIndexer::new()),
            Self::Bsv21(config) => Box::new(Bsv21Indexer::new(config)),
            Self::OrdLock => Box::new(OrdLockIndexer::new()),
            Self::Origin => Box::new(OriginIndexer::new()),
        }
    }
}

/// The full chain in canonical order: ownership and envelope dispatch before
/// payload semantics, valuation and lineage last.
pub fn default_chain() -> Vec<Box<dyn Indexer>> {
    vec![
        Box::new(AddressIndexer::new()),
        Box::new(BitcomIndexer::new()),
        Box::new(InscriptionIndexer::new()),
        Box::new(Bsv21Indexer::new(Bsv21Config::default())),
        Box::new(OrdLockIndexer::new()),
        Box::new(OriginIndexer::new()),
    ]
}
