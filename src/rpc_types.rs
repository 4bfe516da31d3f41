//! JSON-RPC 2.0 request/response envelopes for the two RPC methods the
//! fetcher drives: `getSignaturesForAddress` and `getTransaction`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &'static str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse<T> {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub result: Option<T>,
    pub error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// One entry returned by `getSignaturesForAddress`.
#[derive(Debug, Deserialize, Clone)]
pub struct SignatureEntry {
    pub signature: String,
    #[allow(dead_code)]
    pub slot: Option<u64>,
}

/// Build the params for `getSignaturesForAddress(wallet, {limit, before?, commitment})`.
pub fn signatures_params(wallet: &str, before: Option<&str>, limit: u64) -> Value {
    let mut opts = serde_json::json!({
        "limit": limit,
        "commitment": "confirmed",
    });
    if let Some(before) = before {
        opts["before"] = Value::String(before.to_string());
    }
    serde_json::json!([wallet, opts])
}

/// Build the params for `getTransaction(id, {encoding, commitment, maxSupportedTransactionVersion})`.
pub fn transaction_params(id: &str) -> Value {
    serde_json::json!([
        id,
        {
            "encoding": "json",
            "commitment": "confirmed",
            "maxSupportedTransactionVersion": 0,
        }
    ])
}
