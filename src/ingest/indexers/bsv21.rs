use indexmap::IndexMap;
use serde::Deserialize;

use crate::ingest::context::TxContext;
use crate::model::payload::{Bsv21Data, TokenStatus};
use crate::model::{Event, IndexData, Payload};

use super::{Indexer, inscription};

pub const TAG: &str = "bsv21";

const MAX_DECIMALS: u8 = 18;

pub const OP_DEPLOY_MINT: &str = "deploy+mint";
pub const OP_TRANSFER: &str = "transfer";
pub const OP_BURN: &str = "burn";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Bsv21Config {
    /// Ignore token activity before this height.
    #[serde(default)]
    pub start_height: u32,
}

/// Fungible-token ledger over inscribed JSON operations. Token ids are the
/// deploying outpoint, so a deploy is born valid; transfers and burns get
/// their verdict in the cross-output reconciliation pass, where the running
/// per-token balance of the spent inputs must never go negative.
pub struct Bsv21Indexer {
    config: Bsv21Config,
}

impl Bsv21Indexer {
    pub fn new(config: Bsv21Config) -> Self {
        Self { config }
    }
}

/// Token operation as inscribed.
#[derive(Debug, Deserialize)]
struct TokenInscription {
    p: String,
    op: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    sym: Option<String>,
    #[serde(default)]
    amt: Option<serde_json::Value>,
    #[serde(default)]
    dec: Option<serde_json::Value>,
}

fn value_u64(value: &serde_json::Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

impl Indexer for Bsv21Indexer {
    fn tag(&self) -> &'static str {
        TAG
    }

    fn parse(&self, ctx: &mut TxContext, vout: usize) -> Option<IndexData> {
        if ctx.height != 0 && ctx.height < self.config.start_height {
            return None;
        }

        // layered protocol: read the inscription an earlier indexer attached
        let inscription = match &ctx.txos[vout].data_for(inscription::TAG)?.payload {
            Payload::Inscription(data) => data,
            _ => return None,
        };

        if !inscription
            .file
            .content_type
            .starts_with("application/bsv-20")
        {
            return None;
        }

        let content = inscription.content.as_ref()?;
        let token: TokenInscription = serde_json::from_slice(content).ok()?;

        if token.p != "bsv-20" {
            return None;
        }

        let amt = token.amt.as_ref().and_then(value_u64)?;
        let dec = token.dec.as_ref().and_then(value_u64).unwrap_or_default();

        let mut data = Bsv21Data {
            id: String::new(),
            op: token.op.to_lowercase(),
            sym: token.sym,
            amt,
            dec: dec.min(MAX_DECIMALS as u64) as u8,
            status: TokenStatus::Pending,
            reason: None,
        };

        match data.op.as_str() {
            OP_DEPLOY_MINT => {
                data.id = ctx.txos[vout].outpoint.to_string();
                if dec > MAX_DECIMALS as u64 {
                    data.status = TokenStatus::Invalid;
                    data.reason = Some(format!("decimals above {MAX_DECIMALS}"));
                } else {
                    data.status = TokenStatus::Valid;
                }
            }
            OP_TRANSFER | OP_BURN => {
                data.id = token.id?;
            }
            _ => return None,
        }

        Some(IndexData::new(Payload::Bsv21(data)))
    }

    fn pre_save(&self, ctx: &mut TxContext) {
        // group this transaction's transfer/burn outputs by token id
        let mut by_id: IndexMap<String, Vec<usize>> = IndexMap::new();

        for (vout, txo) in ctx.txos.iter().enumerate() {
            if let Some(data) = txo.data_for(TAG) {
                if let Payload::Bsv21(token) = &data.payload {
                    match token.op.as_str() {
                        OP_TRANSFER | OP_BURN => {
                            by_id.entry(token.id.clone()).or_default().push(vout)
                        }
                        _ => {}
                    }
                }
            }
        }

        if by_id.is_empty() {
            return;
        }

        let (spends, txos) = (&ctx.spends, &mut ctx.txos);

        for (id, vouts) in by_id {
            // token balance carried by the spent inputs
            let mut balance: u64 = 0;
            let mut pending = false;
            let mut dep_ops = Vec::new();

            for spend in spends {
                let Some(data) = spend.data_for(TAG) else {
                    continue;
                };
                let Payload::Bsv21(token) = &data.payload else {
                    continue;
                };

                if token.id != id {
                    continue;
                }

                dep_ops.push(spend.outpoint);

                match token.status {
                    TokenStatus::Valid => balance = balance.saturating_add(token.amt),
                    // unresolved ancestry defers the whole token's verdict
                    TokenStatus::Pending => pending = true,
                    TokenStatus::Invalid => {}
                }
            }

            // outputs settle in script order against the running balance
            for vout in vouts {
                let data = txos[vout].data.get_mut(TAG).unwrap();
                data.deps.extend(dep_ops.iter().copied());

                let Payload::Bsv21(token) = &mut data.payload else {
                    continue;
                };

                if pending {
                    token.status = TokenStatus::Pending;
                } else if token.amt <= balance {
                    balance -= token.amt;
                    token.status = TokenStatus::Valid;

                    if token.op == OP_TRANSFER {
                        data.events.push(Event::new("id", id.clone()));
                    }
                } else {
                    token.status = TokenStatus::Invalid;
                    token.reason = Some("insufficient token inputs".to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ingest::context::test_ctx;
    use crate::ingest::indexers::inscription::{InscriptionIndexer, envelope_script};
    use crate::model::{Outpoint, Txo};

    use super::*;

    fn token_script(json: &str) -> bitcoin::ScriptBuf {
        envelope_script("application/bsv-20", json.as_bytes())
    }

    /// Parse outputs through the inscription indexer then the token indexer,
    /// mirroring the configured chain order.
    fn parse_all(ctx: &mut TxContext, indexer: &Bsv21Indexer) {
        for vout in 0..ctx.txos.len() {
            if let Some(data) = InscriptionIndexer::new().parse(ctx, vout) {
                ctx.txos[vout].data.insert(inscription::TAG.into(), data);
            }
            if let Some(data) = indexer.parse(ctx, vout) {
                ctx.txos[vout].data.insert(TAG.into(), data);
            }
        }
        indexer.pre_save(ctx);
    }

    fn token_of(txo: &Txo) -> &Bsv21Data {
        match &txo.data_for(TAG).unwrap().payload {
            Payload::Bsv21(token) => token,
            _ => panic!("wrong payload"),
        }
    }

    fn spend_with_token(seed: u8, id: &str, amt: u64, status: TokenStatus) -> Txo {
        use bitcoin::hashes::Hash;

        let outpoint = Outpoint::new(bitcoin::Txid::from_byte_array([seed; 32]), 0);
        let mut txo = Txo::new(outpoint, 90, 0);
        txo.satoshis = Some(1);
        txo.data.insert(
            TAG.to_string(),
            IndexData::new(Payload::Bsv21(Bsv21Data {
                id: id.to_string(),
                op: OP_TRANSFER.to_string(),
                sym: None,
                amt,
                dec: 0,
                status,
                reason: None,
            })),
        );
        txo
    }

    #[test]
    fn deploy_mint_is_valid_with_outpoint_id() {
        let script = token_script(r#"{"p":"bsv-20","op":"deploy+mint","sym":"TEST","amt":"1000"}"#);

        let mut ctx = test_ctx(vec![script]);
        let indexer = Bsv21Indexer::new(Bsv21Config::default());
        parse_all(&mut ctx, &indexer);

        let token = token_of(&ctx.txos[0]);
        assert_eq!(token.status, TokenStatus::Valid);
        assert_eq!(token.id, ctx.txos[0].outpoint.to_string());
        assert_eq!(token.amt, 1000);
    }

    #[test]
    fn transfer_within_input_balance_is_valid() {
        let scripts = vec![
            token_script(r#"{"p":"bsv-20","op":"transfer","id":"tok_0","amt":600}"#),
            token_script(r#"{"p":"bsv-20","op":"transfer","id":"tok_0","amt":400}"#),
        ];

        let mut ctx = test_ctx(scripts);
        ctx.spends = vec![spend_with_token(9, "tok_0", 1000, TokenStatus::Valid)];

        let indexer = Bsv21Indexer::new(Bsv21Config::default());
        parse_all(&mut ctx, &indexer);

        let first = token_of(&ctx.txos[0]);
        let second = token_of(&ctx.txos[1]);
        assert_eq!(first.status, TokenStatus::Valid);
        assert_eq!(second.status, TokenStatus::Valid);

        // valid transfers are searchable by token id
        assert_eq!(
            ctx.txos[0].data_for(TAG).unwrap().events,
            vec![Event::new("id", "tok_0")]
        );
        // and carry their consumed inputs as deps
        assert_eq!(
            ctx.txos[0].data_for(TAG).unwrap().deps,
            vec![ctx.spends[0].outpoint]
        );
    }

    #[test]
    fn overspend_invalidates_in_script_order() {
        let scripts = vec![
            token_script(r#"{"p":"bsv-20","op":"transfer","id":"tok_0","amt":800}"#),
            token_script(r#"{"p":"bsv-20","op":"transfer","id":"tok_0","amt":300}"#),
        ];

        let mut ctx = test_ctx(scripts);
        ctx.spends = vec![spend_with_token(9, "tok_0", 1000, TokenStatus::Valid)];

        let indexer = Bsv21Indexer::new(Bsv21Config::default());
        parse_all(&mut ctx, &indexer);

        assert_eq!(token_of(&ctx.txos[0]).status, TokenStatus::Valid);

        let second = token_of(&ctx.txos[1]);
        assert_eq!(second.status, TokenStatus::Invalid);
        assert_eq!(second.reason.as_deref(), Some("insufficient token inputs"));
    }

    #[test]
    fn pending_input_defers_the_whole_token() {
        let scripts = vec![
            token_script(r#"{"p":"bsv-20","op":"transfer","id":"tok_0","amt":100}"#),
        ];

        let mut ctx = test_ctx(scripts);
        ctx.spends = vec![
            spend_with_token(8, "tok_0", 1000, TokenStatus::Valid),
            spend_with_token(9, "tok_0", 50, TokenStatus::Pending),
        ];

        let indexer = Bsv21Indexer::new(Bsv21Config::default());
        parse_all(&mut ctx, &indexer);

        assert_eq!(token_of(&ctx.txos[0]).status, TokenStatus::Pending);
    }

    #[test]
    fn unrelated_token_inputs_do_not_fund_a_transfer() {
        let scripts = vec![
            token_script(r#"{"p":"bsv-20","op":"transfer","id":"tok_a","amt":100}"#),
        ];

        let mut ctx = test_ctx(scripts);
        ctx.spends = vec![spend_with_token(9, "tok_b", 1000, TokenStatus::Valid)];

        let indexer = Bsv21Indexer::new(Bsv21Config::default());
        parse_all(&mut ctx, &indexer);

        assert_eq!(token_of(&ctx.txos[0]).status, TokenStatus::Invalid);
    }

    #[test]
    fn burn_consumes_balance_without_id_event() {
        let scripts = vec![
            token_script(r#"{"p":"bsv-20","op":"burn","id":"tok_0","amt":1000}"#),
        ];

        let mut ctx = test_ctx(scripts);
        ctx.spends = vec![spend_with_token(9, "tok_0", 1000, TokenStatus::Valid)];

        let indexer = Bsv21Indexer::new(Bsv21Config::default());
        parse_all(&mut ctx, &indexer);

        let data = ctx.txos[0].data_for(TAG).unwrap();
        assert_eq!(token_of(&ctx.txos[0]).status, TokenStatus::Valid);
        assert!(data.events.is_empty());
    }

    #[test]
    fn non_token_inscriptions_are_ignored() {
        let script = envelope_script("text/plain", b"not a token");

        let mut ctx = test_ctx(vec![script]);
        let indexer = Bsv21Indexer::new(Bsv21Config::default());
        parse_all(&mut ctx, &indexer);

        assert!(ctx.txos[0].data_for(TAG).is_none());
    }
}
