//! Wraps the `EndpointPool` with JSON-RPC request construction and the
//! retry/backoff policy from spec §4.3.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::endpoint_pool::EndpointPool;
use crate::error::BackfillError;
use crate::rpc_types::{signatures_params, transaction_params, JsonRpcRequest, JsonRpcResponse, SignatureEntry};

const MAX_ATTEMPTS: u32 = 5;

pub struct Fetcher {
    pool: Arc<EndpointPool>,
    request_id: AtomicU64,
}

impl Fetcher {
    pub fn new(pool: Arc<EndpointPool>) -> Self {
        Self {
            pool,
            request_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn fetch_signatures(
        &self,
        ctx: &CancellationToken,
        wallet: &str,
        before: Option<&str>,
        limit: u64,
    ) -> Result<Vec<String>, BackfillError> {
        let params = signatures_params(wallet, before, limit);
        let entries: Vec<SignatureEntry> = self
            .call(ctx, "getSignaturesForAddress", params)
            .await?;
        Ok(entries.into_iter().map(|e| e.signature).collect())
    }

    pub async fn fetch_transaction(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<Value, BackfillError> {
        self.call(ctx, "getTransaction", transaction_params(id)).await
    }

    pub async fn pool_healthy_count(&self) -> usize {
        self.pool.healthy_count().await
    }

    /// Generic JSON-RPC call with the §4.3 retry protocol.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &CancellationToken,
        method: &'static str,
        params: Value,
    ) -> Result<T, BackfillError> {
        let mut delay = Duration::from_millis(250);
        let mut last_err = BackfillError::RpcTransport {
            endpoint: "none".to_string(),
            message: "no attempts made".to_string(),
        };

        for attempt in 1..=MAX_ATTEMPTS {
            if ctx.is_cancelled() {
                return Err(BackfillError::Cancelled);
            }

            match self.attempt_once(ctx, method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(BackfillError::Cancelled) => return Err(BackfillError::Cancelled),
                Err(e @ BackfillError::RpcProtocol { .. }) => return Err(e),
                Err(e @ BackfillError::NotFound) => return Err(e),
                Err(e) => {
                    last_err = e;
                    if attempt == MAX_ATTEMPTS {
                        break;
                    }
                    tracing::warn!(
                        method,
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        error = %last_err,
                        delay_ms = delay.as_millis() as u64,
                        "rpc call failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancelled() => return Err(BackfillError::Cancelled),
                    }
                    delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                }
            }
        }

        Err(last_err)
    }

    async fn attempt_once<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &CancellationToken,
        method: &'static str,
        params: Value,
    ) -> Result<T, BackfillError> {
        let (client, url) = self.pool.acquire(ctx).await?;

        let request = JsonRpcRequest::new(self.next_id(), method, params);

        let response = tokio::select! {
            resp = client
                .post(&url)
                .header("Content-Type", "application/json")
                .json(&request)
                .send() => resp,
            _ = ctx.cancelled() => return Err(BackfillError::Cancelled),
        };

        let response = match response {
            Ok(r) => r,
            Err(_) => {
                self.pool.mark_unhealthy(&url).await;
                crate::metrics::record_rpc_outcome("transport_error");
                return Err(BackfillError::RpcTransport {
                    endpoint: url,
                    message: "network/DNS failure".to_string(),
                });
            }
        };

        let status = response.status();

        if status.as_u16() == 429 || status.as_u16() == 503 {
            self.pool
                .set_cooldown(&url, Duration::from_secs(5 * 60))
                .await;
            crate::metrics::record_rpc_outcome("rate_limited");
            return Err(BackfillError::RpcRateLimited {
                endpoint: url,
                cooldown_secs: 300,
            });
        }

        if !status.is_success() {
            self.pool.mark_unhealthy(&url).await;
            crate::metrics::record_rpc_outcome("bad_status");
            return Err(BackfillError::RpcTransport {
                endpoint: url,
                message: format!("unexpected HTTP status {}", status),
            });
        }

        let body: JsonRpcResponse<T> = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                self.pool.mark_unhealthy(&url).await;
                crate::metrics::record_rpc_outcome("malformed_body");
                return Err(BackfillError::RpcTransport {
                    endpoint: url,
                    message: format!("malformed response body: {}", e),
                });
            }
        };

        if let Some(error) = body.error {
            // Well-formed RPC error: not retried, surfaced as-is.
            crate::metrics::record_rpc_outcome("protocol_error");
            return Err(BackfillError::RpcProtocol {
                endpoint: url,
                code: error.code,
                message: error.message,
            });
        }

        match body.result {
            Some(result) => {
                self.pool.mark_healthy(&url).await;
                crate::metrics::record_rpc_outcome("success");
                Ok(result)
            }
            None => {
                crate::metrics::record_rpc_outcome("not_found");
                Err(BackfillError::NotFound)
            }
        }
    }
}
