//! Thin façade over the external priority-queue/state store (spec §4.4, §6).
//!
//! Expressed as a capability trait (`async-trait`) the way the teacher
//! frames `Decoder`/`Writer` in its design notes, so the Worker and Manager
//! depend only on the contract. `RedisQueueClient` is the production
//! implementation; `InMemoryQueueClient` backs unit tests the way the
//! teacher's `Config` tests use inline TOML fixtures instead of a live
//! database.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::BackfillError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflightEntry<'a> {
    pub worker_id: &'a str,
    pub start_unix: u64,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn pop_wallet(&self) -> Result<Option<String>, BackfillError>;
    async fn push_wallet(&self, wallet: &str, score: f64) -> Result<(), BackfillError>;
    async fn mark_inflight(&self, wallet: &str, worker_id: &str) -> Result<(), BackfillError>;
    async fn clear_inflight(&self, wallet: &str) -> Result<(), BackfillError>;
    async fn get_progress(&self, wallet: &str) -> Result<Option<String>, BackfillError>;
    async fn set_progress(&self, wallet: &str, id: &str) -> Result<(), BackfillError>;
    async fn queue_length(&self) -> Result<u64, BackfillError>;
    /// Returns (wallet, worker_id, start_unix) triples; entries with a value
    /// that doesn't match the `"<worker-id>,<unix-seconds>"` encoding are
    /// skipped with a warning rather than failing the whole call.
    async fn list_inflight(&self) -> Result<Vec<(String, String, u64)>, BackfillError>;

    /// For each in-flight entry older than `timeout`, push it back onto the
    /// queue with score 0 then clear its in-flight marker. Best-effort:
    /// continues past individual failures. Returns the count requeued.
    async fn requeue_stuck(&self, timeout: Duration) -> Result<u64, BackfillError> {
        let now = now_unix();
        let cutoff = now.saturating_sub(timeout.as_secs());

        let mut requeued = 0u64;
        for (wallet, _worker_id, start_unix) in self.list_inflight().await? {
            if start_unix > cutoff {
                continue;
            }
            if let Err(e) = self.push_wallet(&wallet, 0.0).await {
                tracing::warn!(wallet = %wallet, error = %e, "failed to requeue stuck wallet");
                continue;
            }
            if let Err(e) = self.clear_inflight(&wallet).await {
                tracing::warn!(wallet = %wallet, error = %e, "failed to clear stuck in-flight marker");
                continue;
            }
            requeued += 1;
        }
        Ok(requeued)
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Encode an in-flight value. Panics if `worker_id` contains a comma (a
/// worker-id invariant enforced at id-generation time, never at runtime
/// from untrusted input).
pub fn encode_inflight(worker_id: &str, start_unix: u64) -> String {
    debug_assert!(!worker_id.contains(','), "worker-id must not contain commas");
    format!("{},{}", worker_id, start_unix)
}

pub fn decode_inflight(value: &str) -> Option<(String, u64)> {
    let (worker_id, ts) = value.split_once(',')?;
    let start_unix: u64 = ts.parse().ok()?;
    Some((worker_id.to_string(), start_unix))
}

// ---------------------------------------------------------------------
// In-memory implementation, for unit/integration tests.
// ---------------------------------------------------------------------

use std::sync::Mutex;

#[derive(Default)]
struct InMemoryState {
    /// wallet -> score. Pop is remove-min with ties broken by insertion order.
    queue: Vec<(String, f64)>,
    inflight: HashMap<String, String>,
    progress: HashMap<String, String>,
}

#[derive(Default)]
pub struct InMemoryQueueClient {
    state: Mutex<InMemoryState>,
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn pop_wallet(&self) -> Result<Option<String>, BackfillError> {
        let mut state = self.state.lock().unwrap();
        if state.queue.is_empty() {
            return Ok(None);
        }
        let mut best_idx = 0;
        for i in 1..state.queue.len() {
            if state.queue[i].1 < state.queue[best_idx].1 {
                best_idx = i;
            }
        }
        let (wallet, _score) = state.queue.remove(best_idx);
        Ok(Some(wallet))
    }

    async fn push_wallet(&self, wallet: &str, score: f64) -> Result<(), BackfillError> {
        let mut state = self.state.lock().unwrap();
        state.queue.retain(|(w, _)| w != wallet);
        state.queue.push((wallet.to_string(), score));
        Ok(())
    }

    async fn mark_inflight(&self, wallet: &str, worker_id: &str) -> Result<(), BackfillError> {
        let mut state = self.state.lock().unwrap();
        state
            .inflight
            .insert(wallet.to_string(), encode_inflight(worker_id, now_unix()));
        Ok(())
    }

    async fn clear_inflight(&self, wallet: &str) -> Result<(), BackfillError> {
        let mut state = self.state.lock().unwrap();
        state.inflight.remove(wallet);
        Ok(())
    }

    async fn get_progress(&self, wallet: &str) -> Result<Option<String>, BackfillError> {
        let state = self.state.lock().unwrap();
        Ok(state.progress.get(wallet).cloned())
    }

    async fn set_progress(&self, wallet: &str, id: &str) -> Result<(), BackfillError> {
        let mut state = self.state.lock().unwrap();
        state.progress.insert(wallet.to_string(), id.to_string());
        Ok(())
    }

    async fn queue_length(&self) -> Result<u64, BackfillError> {
        let state = self.state.lock().unwrap();
        Ok(state.queue.len() as u64)
    }

    async fn list_inflight(&self) -> Result<Vec<(String, String, u64)>, BackfillError> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for (wallet, value) in &state.inflight {
            match decode_inflight(value) {
                Some((worker_id, start_unix)) => out.push((wallet.clone(), worker_id, start_unix)),
                None => tracing::warn!(wallet = %wallet, value = %value, "malformed in-flight value, skipping"),
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------
// Redis-backed implementation.
// ---------------------------------------------------------------------

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

const QUEUE_KEY: &str = "wallet_queue";
const INFLIGHT_KEY: &str = "wallet_inflight";
const PROGRESS_KEY: &str = "wallet_progress";
const SEQ_KEY: &str = "wallet_queue_seq";

/// Bits of `SEQ_KEY` folded into the low end of each stored score. Plain
/// `ZADD`/`ZPOPMIN` break equal-score ties by lexical member order, not
/// insertion order (spec §4.4's `popWallet` tie-break). Priorities this
/// engine ever assigns (`0` and `nowUnix()`) are non-negative integers well
/// under 2^31, so packing a 20-bit insertion sequence into the low bits
/// still fits inside the 53 bits an `f64` represents exactly, and recovers
/// insertion-order tie-breaking for up to 2^20 pushes sharing one priority.
const SEQ_BITS: u32 = 20;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;

fn encode_score(priority: f64, seq: u64) -> f64 {
    let priority_bits = priority.max(0.0) as u64;
    ((priority_bits << SEQ_BITS) | (seq & SEQ_MASK)) as f64
}

pub struct RedisQueueClient {
    conn: ConnectionManager,
}

impl RedisQueueClient {
    pub async fn connect(url: &str) -> Result<Self, BackfillError> {
        let client = redis::Client::open(url)
            .map_err(|e| BackfillError::Queue(format!("invalid redis url: {}", e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BackfillError::Queue(format!("failed to connect to redis: {}", e)))?;
        Ok(Self { conn })
    }
}

fn queue_err(e: redis::RedisError) -> BackfillError {
    BackfillError::Queue(e.to_string())
}

#[async_trait]
impl QueueClient for RedisQueueClient {
    async fn pop_wallet(&self) -> Result<Option<String>, BackfillError> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(QUEUE_KEY, 1).await.map_err(queue_err)?;
        Ok(popped.into_iter().next().map(|(w, _)| w))
    }

    async fn push_wallet(&self, wallet: &str, score: f64) -> Result<(), BackfillError> {
        let mut conn = self.conn.clone();
        let seq: u64 = conn.incr(SEQ_KEY, 1u64).await.map_err(queue_err)?;
        conn.zadd::<_, _, _, ()>(QUEUE_KEY, wallet, encode_score(score, seq))
            .await
            .map_err(queue_err)
    }

    async fn mark_inflight(&self, wallet: &str, worker_id: &str) -> Result<(), BackfillError> {
        let mut conn = self.conn.clone();
        let value = encode_inflight(worker_id, now_unix());
        conn.hset::<_, _, _, ()>(INFLIGHT_KEY, wallet, value)
            .await
            .map_err(queue_err)
    }

    async fn clear_inflight(&self, wallet: &str) -> Result<(), BackfillError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(INFLIGHT_KEY, wallet)
            .await
            .map_err(queue_err)
    }

    async fn get_progress(&self, wallet: &str) -> Result<Option<String>, BackfillError> {
        let mut conn = self.conn.clone();
        conn.hget(PROGRESS_KEY, wallet).await.map_err(queue_err)
    }

    async fn set_progress(&self, wallet: &str, id: &str) -> Result<(), BackfillError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(PROGRESS_KEY, wallet, id)
            .await
            .map_err(queue_err)
    }

    async fn queue_length(&self) -> Result<u64, BackfillError> {
        let mut conn = self.conn.clone();
        conn.zcard(QUEUE_KEY).await.map_err(queue_err)
    }

    async fn list_inflight(&self) -> Result<Vec<(String, String, u64)>, BackfillError> {
        let mut conn = self.conn.clone();
        let entries: HashMap<String, String> =
            conn.hgetall(INFLIGHT_KEY).await.map_err(queue_err)?;

        let mut out = Vec::with_capacity(entries.len());
        for (wallet, value) in entries {
            match decode_inflight(&value) {
                Some((worker_id, start_unix)) => out.push((wallet, worker_id, start_unix)),
                None => {
                    tracing::warn!(wallet = %wallet, value = %value, "malformed in-flight value, skipping")
                }
            }
        }
        Ok(out)
    }
}
