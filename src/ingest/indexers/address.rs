use bitcoin::hashes::Hash;
use bitcoin::script::Instruction;
use bitcoin::{Address, Network, PubkeyHash, Script};

use crate::ingest::context::TxContext;
use crate::model::IndexData;

use super::Indexer;

/// Attributes outputs with a recognizable simple locking pattern (P2PKH,
/// bare P2PK) to their address. Runs first so every later indexer and the
/// owner index see the attribution regardless of protocol content.
pub struct AddressIndexer;

impl AddressIndexer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AddressIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Indexer for AddressIndexer {
    fn tag(&self) -> &'static str {
        "addr"
    }

    fn parse(&self, ctx: &mut TxContext, vout: usize) -> Option<IndexData> {
        let script = ctx.tx.output[vout].script_pubkey.clone();

        if let Some(owner) = owner_of(&script) {
            ctx.txos[vout].add_owner(owner);
        }

        // ownership is carried on the output itself, not as a payload
        None
    }
}

/// Address attributable to a simple locking script, if any.
pub fn owner_of(script: &Script) -> Option<String> {
    if script.is_p2pkh() {
        return Address::from_script(script, Network::Bitcoin)
            .ok()
            .map(|address| address.to_string());
    }

    p2pk_pubkey(script).map(|pubkey| {
        let hash = bitcoin::hashes::hash160::Hash::hash(&pubkey);
        Address::p2pkh(PubkeyHash::from_raw_hash(hash), Network::Bitcoin).to_string()
    })
}

fn p2pk_pubkey(script: &Script) -> Option<Vec<u8>> {
    let mut instructions = script.instructions();

    let push = match instructions.next()?.ok()? {
        Instruction::PushBytes(bytes) if matches!(bytes.len(), 33 | 65) => bytes.as_bytes().to_vec(),
        _ => return None,
    };

    match instructions.next()?.ok()? {
        Instruction::Op(op) if op == bitcoin::opcodes::all::OP_CHECKSIG => {}
        _ => return None,
    }

    instructions.next().is_none().then_some(push)
}

#[cfg(test)]
mod tests {
    use bitcoin::ScriptBuf;
    use bitcoin::script::Builder;

    use super::*;

    #[test]
    fn p2pkh_scripts_resolve_to_their_address() {
        let hash = PubkeyHash::from_raw_hash(bitcoin::hashes::hash160::Hash::hash(&[7u8; 33]));
        let script = ScriptBuf::new_p2pkh(&hash);

        let owner = owner_of(&script).unwrap();
        assert_eq!(owner, Address::p2pkh(hash, Network::Bitcoin).to_string());
    }

    #[test]
    fn p2pk_scripts_fall_back_to_key_hash() {
        let pubkey = [2u8; 33];
        let script = Builder::new()
            .push_slice(pubkey)
            .push_opcode(bitcoin::opcodes::all::OP_CHECKSIG)
            .into_script();

        let hash = PubkeyHash::from_raw_hash(bitcoin::hashes::hash160::Hash::hash(&pubkey));
        assert_eq!(
            owner_of(&script).unwrap(),
            Address::p2pkh(hash, Network::Bitcoin).to_string()
        );
    }

    #[test]
    fn data_scripts_have_no_owner() {
        let script = Builder::new()
            .push_opcode(bitcoin::opcodes::all::OP_RETURN)
            .push_slice(b"hello")
            .into_script();

        assert!(owner_of(&script).is_none());
    }
}
