use crate::ingest::context::TxContext;
use crate::model::payload::OriginData;
use crate::model::{Event, IndexData, Payload};

use super::Indexer;

pub const TAG: &str = "origin";

/// Lineage tracking for single-satoshi outputs. A unit output is supplied by
/// the unique unit-valued input whose accumulated satoshi offset matches the
/// output's own offset; if that input carries a lineage record the output
/// inherits it with an incremented generation, otherwise the output roots a
/// new lineage at itself.
pub struct OriginIndexer;

impl OriginIndexer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OriginIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Indexer for OriginIndexer {
    fn tag(&self) -> &'static str {
        TAG
    }

    fn parse(&self, ctx: &mut TxContext, vout: usize) -> Option<IndexData> {
        let txo = &ctx.txos[vout];

        if txo.satoshis != Some(1) {
            return None;
        }

        let out_offset: u64 = ctx.tx.output[..vout]
            .iter()
            .map(|output| output.value.to_sat())
            .sum();

        let supplier = {
            let mut in_offset = 0u64;
            ctx.spends.iter().find(|spend| {
                let found = in_offset == out_offset;
                in_offset += spend.satoshis.unwrap_or_default();
                found
            })
        };

        let inherited = supplier.filter(|spend| spend.satoshis == Some(1)).and_then(
            |spend| match &spend.data_for(TAG)?.payload {
                Payload::Origin(origin) => Some((
                    OriginData {
                        origin: origin.origin,
                        nonce: origin.nonce + 1,
                    },
                    spend.outpoint,
                )),
                _ => None,
            },
        );

        let (data, deps) = match inherited {
            Some((data, supplier_outpoint)) => (data, vec![supplier_outpoint]),
            None => (
                OriginData {
                    origin: txo.outpoint,
                    nonce: 0,
                },
                Vec::new(),
            ),
        };

        let events = vec![Event::new("outpoint", data.origin.to_string())];

        Some(
            IndexData::new(Payload::Origin(data))
                .with_events(events)
                .with_deps(deps),
        )
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use crate::ingest::context::test_ctx_with_values;
    use crate::model::{Outpoint, Txo};

    use super::*;

    fn unit_spend(seed: u8, origin: Option<(Outpoint, u64)>) -> Txo {
        let outpoint = Outpoint::new(bitcoin::Txid::from_byte_array([seed; 32]), 0);
        let mut txo = Txo::new(outpoint, 90, 0);
        txo.satoshis = Some(1);

        if let Some((origin, nonce)) = origin {
            txo.data.insert(
                TAG.to_string(),
                IndexData::new(Payload::Origin(OriginData { origin, nonce })),
            );
        }

        txo
    }

    fn plain_spend(seed: u8, satoshis: u64) -> Txo {
        let outpoint = Outpoint::new(bitcoin::Txid::from_byte_array([seed; 32]), 0);
        let mut txo = Txo::new(outpoint, 90, 0);
        txo.satoshis = Some(satoshis);
        txo
    }

    fn origin_of(data: &IndexData) -> &OriginData {
        match &data.payload {
            Payload::Origin(origin) => origin,
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn coinbase_unit_output_roots_new_lineage() {
        let mut ctx = test_ctx_with_values(vec![1]);

        let data = OriginIndexer::new().parse(&mut ctx, 0).unwrap();
        let origin = origin_of(&data);

        assert_eq!(origin.origin, ctx.txos[0].outpoint);
        assert_eq!(origin.nonce, 0);
        assert_eq!(
            data.events,
            vec![Event::new("outpoint", ctx.txos[0].outpoint.to_string())]
        );
        assert!(data.deps.is_empty());
    }

    #[test]
    fn aligned_unit_input_passes_lineage_on() {
        let root = Outpoint::new(bitcoin::Txid::from_byte_array([0xAA; 32]), 3);

        // outputs: 5000 sats change, then the unit output at offset 5000
        let mut ctx = test_ctx_with_values(vec![5000, 1]);
        // inputs: 5000-sat fee input, then the unit input at offset 5000
        ctx.spends = vec![
            plain_spend(1, 5000),
            unit_spend(2, Some((root, 4))),
        ];

        let data = OriginIndexer::new().parse(&mut ctx, 1).unwrap();
        let origin = origin_of(&data);

        assert_eq!(origin.origin, root);
        assert_eq!(origin.nonce, 5);
        assert_eq!(data.deps, vec![ctx.spends[1].outpoint]);
    }

    #[test]
    fn misaligned_or_unrecorded_supplier_roots_fresh() {
        // unit input exists but sits at the wrong satoshi offset
        let mut ctx = test_ctx_with_values(vec![5000, 1]);
        ctx.spends = vec![unit_spend(2, None), plain_spend(1, 5000)];

        let data = OriginIndexer::new().parse(&mut ctx, 1).unwrap();
        let origin = origin_of(&data);

        assert_eq!(origin.origin, ctx.txos[1].outpoint);
        assert_eq!(origin.nonce, 0);
    }

    #[test]
    fn multi_satoshi_outputs_carry_no_lineage() {
        let mut ctx = test_ctx_with_values(vec![546]);
        assert!(OriginIndexer::new().parse(&mut ctx, 0).is_none());
    }
}
