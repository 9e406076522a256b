pub mod encdec;
pub mod event_log;
pub mod keys;
pub mod memory;
pub mod rocks;

pub use event_log::{EventLogStore, KeyUpdate, LogEntry, Store, TxoRecord};
pub use memory::MemoryStore;
pub use rocks::RocksStore;
