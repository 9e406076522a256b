//! Search-key layout. Every higher-level index (owner, protocol tag, derived
//! event, per-transaction membership) is a projection of the one
//! `(search_key, member, score)` primitive; these builders are the only place
//! key strings are assembled.

use bitcoin::Txid;

use crate::model::Outpoint;

/// Outputs attributable to one address.
pub fn owner(address: &str) -> String {
    format!("own:{address}")
}

/// Outputs carrying a payload for one indexer tag.
pub fn tag(tag: &str) -> String {
    format!("tag:{tag}")
}

/// Outputs matching one derived event of one indexer.
pub fn event(tag: &str, id: &str, value: &str) -> String {
    format!("evt:{tag}:{id}:{value}")
}

/// Outputs produced by one transaction; drives rollback discovery.
pub fn tx(txid: &Txid) -> String {
    format!("tx:{txid}")
}

/// Outpoints spent by one transaction; drives spend-map rollback.
pub fn tx_inputs(txid: &Txid) -> String {
    format!("txi:{txid}")
}

/// Outputs whose derived facts depend on one outpoint; drives rollback
/// cascades.
pub fn dep(outpoint: &Outpoint) -> String {
    format!("dep:{outpoint}")
}

/// Pending-work queue for one pipeline.
pub fn queue(name: &str) -> String {
    format!("que:{name}")
}

/// Completion log for one pipeline.
pub fn log(name: &str) -> String {
    format!("log:{name}")
}
