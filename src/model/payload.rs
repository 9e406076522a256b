use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Outpoint;

/// Closed set of protocol payloads. Each variant belongs to exactly one
/// indexer tag; the serde boundary below is the only place payloads cross
/// between typed and raw form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    Bitcom(BitcomData),
    Inscription(InscriptionData),
    Bsv21(Bsv21Data),
    Listing(ListingData),
    Origin(OriginData),
}

/// Sub-protocols recognized inside one OP_RETURN envelope, in script order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BitcomData {
    pub protos: Vec<BitcomProto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "proto", rename_all = "lowercase")]
pub enum BitcomProto {
    /// Magic Attribute Protocol `SET` payload.
    Map {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        app: Option<String>,
        cmd: String,
        fields: BTreeMap<String, String>,
    },
    /// B:// file attachment; the content itself is summarized, not stored.
    B {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        media_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        encoding: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        filename: Option<String>,
        size: u64,
        hash: String,
    },
    /// Author identity attestation; the signature is recorded, not verified.
    Aip { algorithm: String, address: String },
}

/// Content summary of an inscribed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub hash: String,
    pub size: u64,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InscriptionData {
    pub file: File,
    /// Raw content, held only while the transaction is in flight so layered
    /// protocols can read it; stripped before persistence.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    /// Verdict deferred until ancestry resolves.
    Pending,
    Valid,
    Invalid,
}

/// Fungible-token operation carried by one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bsv21Data {
    /// Token id: the outpoint that deployed the token.
    pub id: String,
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sym: Option<String>,
    pub amt: u64,
    pub dec: u8,
    pub status: TokenStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

/// Marketplace listing lock: the output is spendable either by the seller or
/// by a purchase paying the embedded output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingData {
    pub seller: String,
    pub price: u64,
    /// Serialized payment output the purchase must include, hex encoded.
    pub pay_to: String,
}

/// Lineage record for a single-satoshi output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginData {
    /// The genesis outpoint this output descends from.
    pub origin: Outpoint,
    /// Generation counter, zero at the root.
    pub nonce: u64,
}
