use bitcoin::Script;
use bitcoin::hashes::{Hash, sha256};
use bitcoin::script::Instruction;

use crate::ingest::context::TxContext;
use crate::model::payload::{File, InscriptionData};
use crate::model::{Event, IndexData, Payload};

use super::Indexer;

pub const TAG: &str = "insc";

/// Parses ord-style inscription envelopes:
/// `OP_FALSE OP_IF "ord" OP_1 <content-type> OP_0 <content..> OP_ENDIF`.
/// The raw content stays on the in-flight payload for layered protocols and
/// is stripped before persistence.
pub struct InscriptionIndexer;

impl InscriptionIndexer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for InscriptionIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Indexer for InscriptionIndexer {
    fn tag(&self) -> &'static str {
        TAG
    }

    fn parse(&self, ctx: &mut TxContext, vout: usize) -> Option<IndexData> {
        let script = ctx.tx.output[vout].script_pubkey.clone();
        let envelope = parse_envelope(&script)?;

        let content_type = envelope
            .content_type
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let file = File {
            hash: hex::encode(sha256::Hash::hash(&envelope.content).to_byte_array()),
            size: envelope.content.len() as u64,
            content_type: content_type.clone(),
        };

        let events = vec![Event::new("type", content_type)];

        Some(
            IndexData::new(Payload::Inscription(InscriptionData {
                file,
                content: Some(envelope.content),
            }))
            .with_events(events),
        )
    }

    fn pre_save(&self, ctx: &mut TxContext) {
        // strip raw content before persistence; the summary stays
        for txo in ctx.txos.iter_mut() {
            if let Some(data) = txo.data.get_mut(TAG) {
                if let Payload::Inscription(inscription) = &mut data.payload {
                    inscription.content = None;
                }
            }
        }
    }
}

struct Envelope {
    content_type: Option<Vec<u8>>,
    content: Vec<u8>,
}

/// Normalized script item: small-number opcodes become their push form.
enum Item {
    Push(Vec<u8>),
    Op(bitcoin::Opcode),
}

fn items(script: &Script) -> Vec<Item> {
    let mut out = Vec::new();

    for instruction in script.instructions() {
        let Ok(instruction) = instruction else { break };

        out.push(match instruction {
            Instruction::PushBytes(bytes) => Item::Push(bytes.as_bytes().to_vec()),
            Instruction::Op(op) => {
                let code = op.to_u8();
                let pushnum_1 = bitcoin::opcodes::all::OP_PUSHNUM_1.to_u8();
                let pushnum_16 = bitcoin::opcodes::all::OP_PUSHNUM_16.to_u8();

                if (pushnum_1..=pushnum_16).contains(&code) {
                    Item::Push(vec![code - pushnum_1 + 1])
                } else {
                    Item::Op(op)
                }
            }
        });
    }

    out
}

fn parse_envelope(script: &Script) -> Option<Envelope> {
    let items = items(script);

    // locate OP_FALSE OP_IF "ord"
    let mut start = None;
    for (i, window) in items.windows(3).enumerate() {
        if let [Item::Push(empty), Item::Op(op), Item::Push(marker)] = window {
            if empty.is_empty()
                && *op == bitcoin::opcodes::all::OP_IF
                && marker.as_slice() == b"ord"
            {
                start = Some(i + 3);
                break;
            }
        }
    }

    let mut pos = start?;
    let mut content_type = None;
    let mut content = Vec::new();

    while pos < items.len() {
        match &items[pos] {
            Item::Push(field) if field.is_empty() => {
                // body: concatenated pushes until OP_ENDIF
                pos += 1;
                while pos < items.len() {
                    match &items[pos] {
                        Item::Push(chunk) => content.extend_from_slice(chunk),
                        Item::Op(op) if *op == bitcoin::opcodes::all::OP_ENDIF => {
                            return Some(Envelope {
                                content_type,
                                content,
                            });
                        }
                        Item::Op(_) => return None,
                    }
                    pos += 1;
                }
                return None;
            }
            Item::Push(field) if field.as_slice() == &[1u8] => {
                if let Some(Item::Push(value)) = items.get(pos + 1) {
                    content_type = Some(value.clone());
                }
                pos += 2;
            }
            // unknown field: skip the tag and its value
            Item::Push(_) => pos += 2,
            Item::Op(op) if *op == bitcoin::opcodes::all::OP_ENDIF => {
                return Some(Envelope {
                    content_type,
                    content,
                });
            }
            Item::Op(_) => return None,
        }
    }

    None
}

#[cfg(test)]
pub(crate) fn envelope_script(content_type: &str, content: &[u8]) -> bitcoin::ScriptBuf {
    use bitcoin::script::{Builder, PushBytesBuf};

    Builder::new()
        .push_opcode(bitcoin::opcodes::OP_FALSE)
        .push_opcode(bitcoin::opcodes::all::OP_IF)
        .push_slice(b"ord")
        .push_opcode(bitcoin::opcodes::all::OP_PUSHNUM_1)
        .push_slice(PushBytesBuf::try_from(content_type.as_bytes().to_vec()).unwrap())
        .push_opcode(bitcoin::opcodes::OP_FALSE)
        .push_slice(PushBytesBuf::try_from(content.to_vec()).unwrap())
        .push_opcode(bitcoin::opcodes::all::OP_ENDIF)
        .into_script()
}

#[cfg(test)]
mod tests {
    use crate::ingest::context::test_ctx;

    use super::*;

    #[test]
    fn envelope_parses_type_and_content() {
        let script = envelope_script("image/png", b"fake image bytes");

        let mut ctx = test_ctx(vec![script]);
        let data = InscriptionIndexer::new().parse(&mut ctx, 0).unwrap();

        let Payload::Inscription(inscription) = &data.payload else {
            panic!("wrong payload")
        };

        assert_eq!(inscription.file.content_type, "image/png");
        assert_eq!(inscription.file.size, 16);
        assert_eq!(inscription.content.as_deref(), Some(&b"fake image bytes"[..]));
        assert_eq!(data.events, vec![Event::new("type", "image/png")]);
    }

    #[test]
    fn envelope_after_p2pkh_prefix_is_found() {
        let hash = bitcoin::PubkeyHash::from_raw_hash(bitcoin::hashes::hash160::Hash::hash(b"k"));
        let p2pkh = bitcoin::ScriptBuf::new_p2pkh(&hash);

        let mut bytes = p2pkh.to_bytes();
        bytes.extend_from_slice(envelope_script("text/plain", b"hi").as_bytes());
        let script = bitcoin::ScriptBuf::from_bytes(bytes);

        let mut ctx = test_ctx(vec![script]);
        let data = InscriptionIndexer::new().parse(&mut ctx, 0).unwrap();

        let Payload::Inscription(inscription) = &data.payload else {
            panic!("wrong payload")
        };
        assert_eq!(inscription.file.content_type, "text/plain");
    }

    #[test]
    fn pre_save_strips_content_but_keeps_summary() {
        let script = envelope_script("text/plain", b"hello world");

        let mut ctx = test_ctx(vec![script]);
        let indexer = InscriptionIndexer::new();

        let data = indexer.parse(&mut ctx, 0).unwrap();
        ctx.txos[0].data.insert(TAG.to_string(), data);

        indexer.pre_save(&mut ctx);

        let Payload::Inscription(inscription) = &ctx.txos[0].data[TAG].payload else {
            panic!("wrong payload")
        };
        assert!(inscription.content.is_none());
        assert_eq!(inscription.file.size, 11);
    }

    #[test]
    fn scripts_without_envelope_are_ignored(){
        let script = bitcoin::ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::from_raw_hash(
            bitcoin::hashes::hash160::Hash::hash(b"k"),
        ));

        let mut ctx = test_ctx(vec![script]);
        assert!(InscriptionIndexer::new().parse(&mut ctx, 0).is_none());
    }
}
