use std::collections::BTreeMap;

use bitcoin::Script;
use bitcoin::hashes::{Hash, sha256};
use bitcoin::script::Instruction;

use crate::ingest::context::TxContext;
use crate::model::payload::{BitcomData, BitcomProto};
use crate::model::{Event, IndexData, Payload};

use super::Indexer;

/// Magic Attribute Protocol marker.
pub const MAP: &str = "1PuQa7K62MiKCtssSLKy1kh56WWU7MtUR5";
/// B:// file protocol marker.
pub const B: &str = "19HxigV4QyBv3tHpQVcUEQyq1pzZVdoAut";
/// Author Identity Protocol marker.
pub const AIP: &str = "15PciHG22SNLQJXMoSUaWVi7WSqc7hCfva";

/// Pipe separator between sub-protocols inside one envelope.
const SEPARATOR: &[u8] = b"|";

/// Envelope dispatch: scans the locking script for an OP_RETURN envelope,
/// splits the pushes on the pipe separator, and parses each recognized
/// sub-protocol. Unknown markers are skipped, not errors.
pub struct BitcomIndexer;

impl BitcomIndexer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BitcomIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Indexer for BitcomIndexer {
    fn tag(&self) -> &'static str {
        "bitcom"
    }

    fn parse(&self, ctx: &mut TxContext, vout: usize) -> Option<IndexData> {
        let script = ctx.tx.output[vout].script_pubkey.clone();
        let pushes = op_return_payload(&script)?;

        let mut protos = Vec::new();
        let mut events = Vec::new();

        for chunk in pushes.split(|push| push.as_slice() == SEPARATOR) {
            let Some((marker, fields)) = chunk.split_first() else {
                continue;
            };

            let proto = match std::str::from_utf8(marker) {
                Ok(MAP) => parse_map(fields),
                Ok(B) => parse_b(fields),
                Ok(AIP) => parse_aip(fields),
                _ => None,
            };

            if let Some(proto) = proto {
                if let BitcomProto::Map { app: Some(app), .. } = &proto {
                    events.push(Event::new("app", app.clone()));
                }
                protos.push(proto);
            }
        }

        if protos.is_empty() {
            return None;
        }

        Some(IndexData::new(Payload::Bitcom(BitcomData { protos })).with_events(events))
    }
}

/// Data pushes following an OP_RETURN (or OP_FALSE OP_RETURN) marker.
/// Returns None when the script carries no envelope.
fn op_return_payload(script: &Script) -> Option<Vec<Vec<u8>>> {
    let mut pushes = Vec::new();
    let mut in_envelope = false;

    for instruction in script.instructions() {
        let Ok(instruction) = instruction else {
            // a malformed tail ends the envelope, it doesn't void it
            break;
        };

        match instruction {
            Instruction::Op(op) if op == bitcoin::opcodes::all::OP_RETURN => {
                in_envelope = true;
            }
            Instruction::PushBytes(bytes) if in_envelope => {
                pushes.push(bytes.as_bytes().to_vec());
            }
            _ => {}
        }
    }

    in_envelope.then_some(pushes)
}

/// `MAP <cmd> (<key> <value>)*`; only SET is given structure.
fn parse_map(fields: &[Vec<u8>]) -> Option<BitcomProto> {
    let (cmd, rest) = fields.split_first()?;
    let cmd = String::from_utf8(cmd.clone()).ok()?;

    let mut map = BTreeMap::new();
    if cmd == "SET" {
        for pair in rest.chunks_exact(2) {
            let key = String::from_utf8_lossy(&pair[0]).into_owned();
            let value = String::from_utf8_lossy(&pair[1]).into_owned();
            map.insert(key, value);
        }
    }

    Some(BitcomProto::Map {
        app: map.get("app").cloned(),
        cmd,
        fields: map,
    })
}

/// `B <content> <media-type> [encoding] [filename]`; the content itself is
/// summarized, never stored.
fn parse_b(fields: &[Vec<u8>]) -> Option<BitcomProto> {
    let (content, rest) = fields.split_first()?;

    let text = |index: usize| -> Option<String> {
        rest.get(index)
            .filter(|bytes| !bytes.is_empty())
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    };

    Some(BitcomProto::B {
        media_type: text(0),
        encoding: text(1),
        filename: text(2),
        size: content.len() as u64,
        hash: hex::encode(sha256::Hash::hash(content).to_byte_array()),
    })
}

/// `AIP <algorithm> <address> <signature>`; recorded, not verified.
fn parse_aip(fields: &[Vec<u8>]) -> Option<BitcomProto> {
    let algorithm = String::from_utf8(fields.first()?.clone()).ok()?;
    let address = String::from_utf8(fields.get(1)?.clone()).ok()?;

    Some(BitcomProto::Aip { algorithm, address })
}

#[cfg(test)]
mod tests {
    use bitcoin::ScriptBuf;
    use bitcoin::script::{Builder, PushBytesBuf};

    use crate::ingest::context::test_ctx;

    use super::*;

    fn envelope(chunks: &[&[u8]]) -> ScriptBuf {
        let mut builder = Builder::new()
            .push_opcode(bitcoin::opcodes::OP_FALSE)
            .push_opcode(bitcoin::opcodes::all::OP_RETURN);

        for chunk in chunks {
            builder = builder.push_slice(PushBytesBuf::try_from(chunk.to_vec()).unwrap());
        }

        builder.into_script()
    }

    #[test]
    fn map_set_fields_are_parsed_and_app_event_emitted() {
        let script = envelope(&[
            MAP.as_bytes(),
            b"SET",
            b"app",
            b"mymarket",
            b"type",
            b"post",
        ]);

        let mut ctx = test_ctx(vec![script]);
        let data = BitcomIndexer::new().parse(&mut ctx, 0).unwrap();

        let Payload::Bitcom(bitcom) = &data.payload else {
            panic!("wrong payload")
        };

        match &bitcom.protos[0] {
            BitcomProto::Map { app, cmd, fields } => {
                assert_eq!(app.as_deref(), Some("mymarket"));
                assert_eq!(cmd, "SET");
                assert_eq!(fields.get("type").unwrap(), "post");
            }
            other => panic!("unexpected proto: {other:?}"),
        }

        assert_eq!(data.events, vec![Event::new("app", "mymarket")]);
    }

    #[test]
    fn piped_protocols_parse_independently_and_unknowns_skip() {
        let script = envelope(&[
            b"1UnknownProtocolAddr",
            b"whatever",
            b"|",
            B.as_bytes(),
            b"file content",
            b"text/plain",
            b"|",
            AIP.as_bytes(),
            b"BITCOIN_ECDSA",
            b"1SignerAddress",
            b"sigbytes",
        ]);

        let mut ctx = test_ctx(vec![script]);
        let data = BitcomIndexer::new().parse(&mut ctx, 0).unwrap();

        let Payload::Bitcom(bitcom) = &data.payload else {
            panic!("wrong payload")
        };

        assert_eq!(bitcom.protos.len(), 2);

        match &bitcom.protos[0] {
            BitcomProto::B {
                media_type, size, ..
            } => {
                assert_eq!(media_type.as_deref(), Some("text/plain"));
                assert_eq!(*size, 12);
            }
            other => panic!("unexpected proto: {other:?}"),
        }

        match &bitcom.protos[1] {
            BitcomProto::Aip { address, .. } => assert_eq!(address, "1SignerAddress"),
            other => panic!("unexpected proto: {other:?}"),
        }
    }

    #[test]
    fn plain_scripts_are_not_envelopes() {
        let script = Builder::new()
            .push_slice(b"data")
            .into_script();

        let mut ctx = test_ctx(vec![script]);
        assert!(BitcomIndexer::new().parse(&mut ctx, 0).is_none());
    }
}
