//! Typed error taxonomy for the back-fill engine.
//!
//! Library code returns [`BackfillError`] so callers can match on kind
//! (propagation rules are in the design notes); top-level wiring in
//! `main.rs` still uses `eyre` for ad-hoc startup context the way the
//! teacher's `main.rs` does.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("config error: {0}")]
    Config(String),

    #[error("queue store error: {0}")]
    Queue(String),

    #[error("rpc transport error on {endpoint}: {message}")]
    RpcTransport { endpoint: String, message: String },

    #[error("rpc rate limited on {endpoint}, cooldown {cooldown_secs}s")]
    RpcRateLimited { endpoint: String, cooldown_secs: u64 },

    #[error("rpc protocol error on {endpoint} (code {code}): {message}")]
    RpcProtocol {
        endpoint: String,
        code: i64,
        message: String,
    },

    #[error("not found")]
    NotFound,

    #[error("decoder rejected payload: {0}")]
    Decoder(String),

    #[error("writer failed for id {id}: {message}")]
    Writer { id: String, message: String },

    #[error("cancelled")]
    Cancelled,
}

impl BackfillError {
    /// Transient faults that the Fetcher's retry loop may recover from.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackfillError::RpcTransport { .. } | BackfillError::RpcRateLimited { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BackfillError>;
