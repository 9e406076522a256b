//! Real-time indexer for UTXO transaction streams. Consumes a live or
//! historical feed, extracts structured facts from each transaction's
//! outputs through a pluggable protocol-indexer chain, and persists them
//! into a score-ordered event log serving range and set queries.

pub mod chain;
mod error;
pub mod ingest;
pub mod model;
pub mod search;
pub mod shutdown;
pub mod storage;
pub mod sync;

pub use error::Error;
pub use storage::encdec::{DecodingError, DecodingResult};
