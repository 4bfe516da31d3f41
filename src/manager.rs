//! Owns the worker set lifecycle: periodic scaling, stuck-wallet recovery,
//! monitoring, and graceful shutdown (spec §4.6).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ScalingConfig, WatchdogConfig};
use crate::fetcher::Fetcher;
use crate::metrics;
use crate::queue_client::QueueClient;
use crate::worker::Worker;
use crate::writer::Writer;

const SCALING_INTERVAL: Duration = Duration::from_secs(30);
const STUCK_RECOVERY_INTERVAL: Duration = Duration::from_secs(5 * 60);
const MONITORING_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const QUEUE_LENGTH_PER_WORKER: u64 = 10;

struct WorkerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

pub struct Manager {
    queue: Arc<dyn QueueClient>,
    fetcher: Arc<Fetcher>,
    writer: Arc<dyn Writer>,
    scaling: ScalingConfig,
    watchdog: WatchdogConfig,
    shutdown: CancellationToken,
    workers: Mutex<Vec<WorkerHandle>>,
    started: std::sync::atomic::AtomicBool,
}

impl Manager {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        fetcher: Arc<Fetcher>,
        writer: Arc<dyn Writer>,
        scaling: ScalingConfig,
        watchdog: WatchdogConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            fetcher,
            writer,
            scaling,
            watchdog,
            shutdown,
            workers: Mutex::new(Vec::new()),
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn active_worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Spawn the initial worker set and the three background loops. Returns
    /// once workers are spawned; the background loops keep running until
    /// `stop` is called.
    pub async fn start(self: &Arc<Self>) {
        self.scale_to(self.scaling.min_workers).await;
        self.started.store(true, std::sync::atomic::Ordering::Relaxed);

        let scaling_mgr = Arc::clone(self);
        tokio::spawn(async move { scaling_mgr.scaling_loop().await });

        let watchdog_mgr = Arc::clone(self);
        tokio::spawn(async move { watchdog_mgr.stuck_recovery_loop().await });

        let monitoring_mgr = Arc::clone(self);
        tokio::spawn(async move { monitoring_mgr.monitoring_loop().await });
    }

    async fn scaling_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SCALING_INTERVAL) => {}
                _ = self.shutdown.cancelled() => break,
            }
            self.rebalance().await;
        }
    }

    async fn rebalance(&self) {
        let queue_len = match self.queue.queue_length().await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "failed to read queue length for scaling decision");
                return;
            }
        };

        let desired = ((queue_len / QUEUE_LENGTH_PER_WORKER) as usize)
            .clamp(self.scaling.min_workers, self.scaling.max_workers);

        self.scale_to(desired).await;
    }

    async fn scale_to(&self, desired: usize) {
        let mut workers = self.workers.lock().await;
        let current = workers.len();

        if desired > current {
            for _ in 0..(desired - current) {
                let id = format!("worker-{}", uuid::Uuid::new_v4());
                let token = self.shutdown.child_token();
                let worker = Worker::new(
                    id.clone(),
                    Arc::clone(&self.queue),
                    Arc::clone(&self.fetcher),
                    Arc::clone(&self.writer),
                    token.clone(),
                );
                let join = tokio::spawn(async move {
                    tracing::info!(worker = %id, "worker started");
                    worker.run().await;
                    tracing::info!(worker = %id, "worker stopped");
                });
                workers.push(WorkerHandle { token, join });
            }
        } else if desired < current {
            // Cooperative: signal the tail workers; they finish their
            // current wallet then exit. We don't await them here so the
            // scaling loop isn't blocked.
            let to_stop = current - desired;
            for handle in workers.split_off(desired) {
                handle.token.cancel();
                let _ = to_stop; // silence unused warning in release builds
                drop(handle.join);
            }
        }
    }

    async fn stuck_recovery_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(STUCK_RECOVERY_INTERVAL) => {}
                _ = self.shutdown.cancelled() => break,
            }
            match self
                .queue
                .requeue_stuck(Duration::from_secs(self.watchdog.stuck_timeout_secs))
                .await
            {
                Ok(count) if count > 0 => {
                    tracing::info!(count, "requeued stuck wallets");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "stuck-wallet recovery failed"),
            }
        }
    }

    async fn monitoring_loop(self: Arc<Self>) {
        loop {
            self.emit_metrics().await;
            tokio::select! {
                _ = tokio::time::sleep(MONITORING_INTERVAL) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    async fn emit_metrics(&self) {
        let queue_length = self.queue.queue_length().await.unwrap_or(0);
        let inflight = self.queue.list_inflight().await.map(|v| v.len()).unwrap_or(0);
        let workers = self.active_worker_count().await;
        let healthy_endpoints = self.fetcher.pool_healthy_count().await;

        metrics::set_queue_length(queue_length);
        metrics::set_inflight_wallets(inflight as u64);
        metrics::set_active_workers(workers as u64);
        metrics::set_healthy_endpoints(healthy_endpoints as u64);

        tracing::debug!(
            queue_length,
            inflight,
            workers,
            healthy_endpoints,
            "monitoring tick"
        );
    }

    /// Cancel the shared context and wait up to 30s for all workers to
    /// return.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let joins: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().await;
            workers.drain(..).map(|h| h.join).collect()
        };

        let wait = tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(joins));
        if wait.await.is_err() {
            tracing::warn!("workers did not finish within shutdown grace period");
        }
    }

    pub async fn stats(&self) -> Stats {
        Stats {
            active_workers: self.active_worker_count().await,
            queue_length: self.queue.queue_length().await.unwrap_or(0),
            in_flight_wallets: self.queue.list_inflight().await.map(|v| v.len()).unwrap_or(0) as u64,
            healthy_endpoints: self.fetcher.pool_healthy_count().await,
            min_workers: self.scaling.min_workers,
            max_workers: self.scaling.max_workers,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct Stats {
    pub active_workers: usize,
    pub queue_length: u64,
    pub in_flight_wallets: u64,
    pub healthy_endpoints: usize,
    pub min_workers: usize,
    pub max_workers: usize,
}
