//! Pure decoder: parses a `getTransaction` RPC result into a [`ChainTx`] plus
//! its derived sub-records. No I/O — external per spec §1/§6, generalized
//! from the teacher's `decode_transfer_log` (pure function, `Option`/`Result`
//! on malformed input, no I/O) to the wallet-centric instruction/balance
//! shape this spec's RPC surface returns.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::BackfillError;

#[derive(Debug, Clone)]
pub struct Instruction {
    pub program_id: String,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct TokenBalance {
    pub account_index: u64,
    pub mint: String,
    pub amount: String,
}

#[derive(Debug, Clone)]
pub struct ChainTx {
    pub id: String,
    pub slot: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub payload: Value,
    pub instructions: Vec<Instruction>,
    pub token_balances: Vec<TokenBalance>,
}

#[derive(Debug, Clone)]
pub struct SubRecord {
    pub tx_id: String,
    pub index: u64,
    pub kind: String,
    pub data: Value,
}

/// Decode a raw `getTransaction` result (keyed by signature `id`) into a
/// [`ChainTx`] plus its derived sub-records. Returns `DecoderError` if the
/// payload doesn't match the expected shape.
pub fn decode(id: &str, raw: &Value) -> Result<(ChainTx, Vec<SubRecord>), BackfillError> {
    let slot = raw
        .get("slot")
        .and_then(Value::as_u64)
        .ok_or_else(|| BackfillError::Decoder(format!("{}: missing or invalid 'slot'", id)))?;

    let block_time = raw
        .get("blockTime")
        .and_then(Value::as_i64)
        .and_then(|ts| DateTime::from_timestamp(ts, 0));

    let transaction = raw
        .get("transaction")
        .ok_or_else(|| BackfillError::Decoder(format!("{}: missing 'transaction'", id)))?;

    let message = transaction
        .get("message")
        .ok_or_else(|| BackfillError::Decoder(format!("{}: missing 'transaction.message'", id)))?;

    let account_keys: Vec<String> = message
        .get("accountKeys")
        .and_then(Value::as_array)
        .map(|keys| {
            keys.iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let raw_instructions = message
        .get("instructions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut instructions = Vec::with_capacity(raw_instructions.len());
    let mut sub_records = Vec::new();

    for (idx, ix) in raw_instructions.iter().enumerate() {
        let program_id_index = ix.get("programIdIndex").and_then(Value::as_u64);
        let program_id = program_id_index
            .and_then(|i| account_keys.get(i as usize))
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        instructions.push(Instruction {
            program_id: program_id.clone(),
            data: ix.clone(),
        });

        sub_records.push(SubRecord {
            tx_id: id.to_string(),
            index: idx as u64,
            kind: "instruction".to_string(),
            data: ix.clone(),
        });
    }

    let token_balances: Vec<TokenBalance> = raw
        .get("meta")
        .and_then(|m| m.get("postTokenBalances"))
        .and_then(Value::as_array)
        .map(|balances| {
            balances
                .iter()
                .filter_map(|b| {
                    Some(TokenBalance {
                        account_index: b.get("accountIndex")?.as_u64()?,
                        mint: b.get("mint")?.as_str()?.to_string(),
                        amount: b
                            .get("uiTokenAmount")
                            .and_then(|a| a.get("amount"))
                            .and_then(Value::as_str)
                            .unwrap_or("0")
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    for (idx, balance) in token_balances.iter().enumerate() {
        sub_records.push(SubRecord {
            tx_id: id.to_string(),
            index: (raw_instructions.len() + idx) as u64,
            kind: "token_balance".to_string(),
            data: serde_json::json!({
                "account_index": balance.account_index,
                "mint": balance.mint,
                "amount": balance.amount,
            }),
        });
    }

    let chain_tx = ChainTx {
        id: id.to_string(),
        slot,
        block_time,
        payload: raw.clone(),
        instructions,
        token_balances,
    };

    Ok((chain_tx, sub_records))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Value {
        serde_json::json!({
            "slot": 12345,
            "blockTime": 1_700_000_000,
            "transaction": {
                "message": {
                    "accountKeys": ["Wallet111", "Program111"],
                    "instructions": [
                        { "programIdIndex": 1, "accounts": [0], "data": "abcd" }
                    ]
                }
            },
            "meta": {
                "postTokenBalances": [
                    { "accountIndex": 0, "mint": "MintXYZ", "uiTokenAmount": { "amount": "1000" } }
                ]
            }
        })
    }

    #[test]
    fn decode_extracts_instructions_and_balances() {
        let (tx, sub_records) = decode("sig1", &sample_tx()).unwrap();
        assert_eq!(tx.slot, 12345);
        assert_eq!(tx.instructions.len(), 1);
        assert_eq!(tx.instructions[0].program_id, "Program111");
        assert_eq!(tx.token_balances.len(), 1);
        assert_eq!(tx.token_balances[0].mint, "MintXYZ");
        assert_eq!(sub_records.len(), 2);
    }

    #[test]
    fn decode_rejects_missing_slot() {
        let raw = serde_json::json!({ "transaction": { "message": {} } });
        let result = decode("sig1", &raw);
        assert!(matches!(result, Err(BackfillError::Decoder(_))));
    }

    #[test]
    fn decode_tolerates_missing_meta() {
        let raw = serde_json::json!({
            "slot": 1,
            "transaction": { "message": { "accountKeys": [], "instructions": [] } }
        });
        let (tx, sub_records) = decode("sig2", &raw).unwrap();
        assert!(tx.token_balances.is_empty());
        assert!(sub_records.is_empty());
    }
}
