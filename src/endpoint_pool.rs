//! Shared pool of RPC endpoints: round-robin selection with skip-unhealthy
//! and skip-in-cooldown fallback, per-endpoint rate limiting.
//!
//! Grounded on the round-robin + cooldown-until shape of
//! `other_examples/8bd54cf3_..._rpc_rotator.rs.rs` and the shared-client
//! multi-provider layout of `other_examples/7e4b0011_..._app.rs.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::BackfillError;
use crate::rate_limiter::RateLimiter;

pub struct Endpoint {
    pub url: String,
    limiter: RateLimiter,
    healthy: AtomicBool,
    cooldown_until: Mutex<Option<Instant>>,
}

impl Endpoint {
    fn new(url: String, rate_per_second: f64, burst: f64) -> Self {
        Self {
            url,
            limiter: RateLimiter::new(rate_per_second, burst),
            healthy: AtomicBool::new(true),
            cooldown_until: Mutex::new(None),
        }
    }

    async fn is_available(&self) -> bool {
        if !self.healthy.load(Ordering::Relaxed) {
            return false;
        }
        match *self.cooldown_until.lock().await {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }
}

pub struct EndpointPool {
    endpoints: Vec<Arc<Endpoint>>,
    cursor: Mutex<usize>,
    http: reqwest::Client,
}

impl EndpointPool {
    pub fn new(urls: &[String], rate_per_second: f64, burst: f64) -> Self {
        let endpoints = urls
            .iter()
            .map(|u| Arc::new(Endpoint::new(u.clone(), rate_per_second, burst)))
            .collect();

        Self {
            endpoints,
            cursor: Mutex::new(0),
            http: reqwest::Client::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub async fn healthy_count(&self) -> usize {
        let mut count = 0;
        for ep in &self.endpoints {
            if ep.is_available().await {
                count += 1;
            }
        }
        count
    }

    /// Selection policy per spec §4.2: starting at the cursor, advance up to
    /// N steps, skip unhealthy/cooling-down endpoints, take the first whose
    /// `allow()` succeeds. If no candidate passes within one full pass, fall
    /// back to the start index, reserve a token, and wait (honoring `ctx`).
    pub async fn acquire(
        &self,
        ctx: &CancellationToken,
    ) -> Result<(reqwest::Client, String), BackfillError> {
        if self.endpoints.is_empty() {
            return Err(BackfillError::Config(
                "endpoint pool has no configured endpoints".to_string(),
            ));
        }

        let n = self.endpoints.len();
        let start = {
            let mut cursor = self.cursor.lock().await;
            let start = *cursor;
            *cursor = (*cursor + 1) % n;
            start
        };

        for step in 0..n {
            let idx = (start + step) % n;
            let ep = &self.endpoints[idx];

            if !ep.is_available().await {
                continue;
            }
            if ep.limiter.allow().await {
                return Ok((self.http.clone(), ep.url.clone()));
            }
        }

        // Fall back to the start endpoint: reserve and wait honoring ctx.
        let ep = &self.endpoints[start];
        let (wait, reservation) = ep.limiter.reserve().await;

        if wait.is_zero() {
            return Ok((self.http.clone(), ep.url.clone()));
        }

        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok((self.http.clone(), ep.url.clone())),
            _ = ctx.cancelled() => {
                ep.limiter.cancel(reservation).await;
                Err(BackfillError::Cancelled)
            }
        }
    }

    pub async fn mark_unhealthy(&self, url: &str) {
        if let Some(ep) = self.find(url) {
            ep.healthy.store(false, Ordering::Relaxed);
        }
    }

    pub async fn mark_healthy(&self, url: &str) {
        if let Some(ep) = self.find(url) {
            ep.healthy.store(true, Ordering::Relaxed);
            *ep.cooldown_until.lock().await = None;
        }
    }

    pub async fn set_cooldown(&self, url: &str, duration: std::time::Duration) {
        if let Some(ep) = self.find(url) {
            *ep.cooldown_until.lock().await = Some(Instant::now() + duration);
        }
    }

    fn find(&self, url: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.url == url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_skips_unhealthy_endpoint() {
        let pool = EndpointPool::new(
            &["http://a.example".to_string(), "http://b.example".to_string()],
            100.0,
            100.0,
        );
        pool.mark_unhealthy("http://a.example").await;

        let ctx = CancellationToken::new();
        let (_client, url) = pool.acquire(&ctx).await.unwrap();
        assert_eq!(url, "http://b.example");
    }

    #[tokio::test]
    async fn acquire_skips_cooling_down_endpoint() {
        let pool = EndpointPool::new(
            &["http://a.example".to_string(), "http://b.example".to_string()],
            100.0,
            100.0,
        );
        pool.set_cooldown("http://a.example", std::time::Duration::from_secs(300))
            .await;

        let ctx = CancellationToken::new();
        let (_client, url) = pool.acquire(&ctx).await.unwrap();
        assert_eq!(url, "http://b.example");
    }

    #[tokio::test]
    async fn mark_healthy_clears_both_flags() {
        let pool = EndpointPool::new(&["http://a.example".to_string()], 100.0, 100.0);
        pool.mark_unhealthy("http://a.example").await;
        pool.set_cooldown("http://a.example", std::time::Duration::from_secs(300))
            .await;
        pool.mark_healthy("http://a.example").await;

        assert_eq!(pool.healthy_count().await, 1);
    }

    #[tokio::test]
    async fn acquire_falls_back_and_waits_when_all_exhausted() {
        let pool = EndpointPool::new(&["http://a.example".to_string()], 1000.0, 1.0);
        let ctx = CancellationToken::new();

        // Drain the only endpoint's single token via the round-robin path.
        let _ = pool.acquire(&ctx).await.unwrap();
        // Second call must fall back to reserve+wait, but with a huge rate it
        // resolves near-instantly.
        let (_client, url) = pool.acquire(&ctx).await.unwrap();
        assert_eq!(url, "http://a.example");
    }

    #[tokio::test]
    async fn acquire_cancelled_context_propagates_error() {
        let pool = EndpointPool::new(&["http://a.example".to_string()], 0.001, 1.0);
        let ctx = CancellationToken::new();
        let _ = pool.acquire(&ctx).await.unwrap(); // exhaust the bucket

        ctx.cancel();
        let result = pool.acquire(&ctx).await;
        assert!(matches!(result, Err(BackfillError::Cancelled)));
    }
}
