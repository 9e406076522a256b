use bitcoin::hashes::Hash;
use bitcoin::script::Instruction;
use bitcoin::{Address, Network, PubkeyHash, Script, TxOut};

use crate::ingest::context::TxContext;
use crate::model::payload::ListingData;
use crate::model::{Event, IndexData, Payload};

use super::Indexer;

pub const TAG: &str = "list";

/// Leading bytes of the deployed market lock contract template.
pub const ORDLOCK_PREFIX: &str =
    "2097dfd76851bf465e8f715593b217714858bbe9570ff3bd5e33840a34e20ff026";
/// Trailing bytes of the template, after the per-listing pushes.
pub const ORDLOCK_SUFFIX: &str = "615179547a75537a537a537a0079537a75527a527a7575615579008763567952ae";

/// Marketplace listing lock: the script embeds the seller's key hash and the
/// payment output a purchase must reproduce.
pub struct OrdLockIndexer;

impl OrdLockIndexer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OrdLockIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Indexer for OrdLockIndexer {
    fn tag(&self) -> &'static str {
        TAG
    }

    fn parse(&self, ctx: &mut TxContext, vout: usize) -> Option<IndexData> {
        let script = ctx.tx.output[vout].script_pubkey.clone();
        let listing = parse_listing(&script)?;

        ctx.txos[vout].add_owner(listing.seller.clone());

        let events = vec![Event::new("seller", listing.seller.clone())];

        Some(IndexData::new(Payload::Listing(listing)).with_events(events))
    }
}

fn parse_listing(script: &Script) -> Option<ListingData> {
    let prefix = hex::decode(ORDLOCK_PREFIX).expect("valid prefix hex");
    let suffix = hex::decode(ORDLOCK_SUFFIX).expect("valid suffix hex");

    let bytes = script.as_bytes();
    if !bytes.starts_with(&prefix) || !bytes.ends_with(&suffix) || bytes.len() <= prefix.len() + suffix.len() {
        return None;
    }

    // the per-listing section between the template halves is two pushes:
    // the seller's key hash and the serialized payment output
    let inner = Script::from_bytes(&bytes[prefix.len()..bytes.len() - suffix.len()]);
    let mut instructions = inner.instructions();

    let seller_hash = match instructions.next()?.ok()? {
        Instruction::PushBytes(push) if push.len() == 20 => {
            <[u8; 20]>::try_from(push.as_bytes()).ok()?
        }
        _ => return None,
    };

    let pay_output = match instructions.next()?.ok()? {
        Instruction::PushBytes(push) => push.as_bytes().to_vec(),
        _ => return None,
    };

    let pay_to: TxOut = bitcoin::consensus::deserialize(&pay_output).ok()?;

    let seller = Address::p2pkh(
        PubkeyHash::from_raw_hash(bitcoin::hashes::hash160::Hash::from_byte_array(seller_hash)),
        Network::Bitcoin,
    )
    .to_string();

    Some(ListingData {
        seller,
        price: pay_to.value.to_sat(),
        pay_to: hex::encode(pay_output),
    })
}

#[cfg(test)]
pub(crate) fn listing_script(seller_hash: [u8; 20], pay_to: &TxOut) -> bitcoin::ScriptBuf {
    use bitcoin::script::{Builder, PushBytesBuf};

    let inner = Builder::new()
        .push_slice(seller_hash)
        .push_slice(PushBytesBuf::try_from(bitcoin::consensus::serialize(pay_to)).unwrap())
        .into_script();

    let bytes = [
        hex::decode(ORDLOCK_PREFIX).unwrap(),
        inner.to_bytes(),
        hex::decode(ORDLOCK_SUFFIX).unwrap(),
    ]
    .concat();

    bitcoin::ScriptBuf::from_bytes(bytes)
}
