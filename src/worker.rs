//! Per-wallet state machine (spec §4.5): pop a wallet, claim it, resume from
//! its checkpoint, scrape its full signature history page by page, persist
//! each transaction, checkpoint progress, release the claim.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::decoder;
use crate::error::BackfillError;
use crate::fetcher::Fetcher;
use crate::queue_client::QueueClient;
use crate::writer::Writer;

const SIGNATURES_PER_PAGE: u64 = 1000;
const CHECKPOINT_EVERY: u64 = 100;
const EMPTY_QUEUE_SLEEP: Duration = Duration::from_secs(10);
const INTER_BATCH_SLEEP: Duration = Duration::from_millis(100);
const ERROR_PAUSE: Duration = Duration::from_secs(5);

pub struct Worker {
    pub id: String,
    queue: Arc<dyn QueueClient>,
    fetcher: Arc<Fetcher>,
    writer: Arc<dyn Writer>,
    ctx: CancellationToken,
}

/// Outcome of a single `run_once` main-loop iteration, used by tests to
/// drive the state machine deterministically instead of racing a sleeping
/// background task.
#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    QueueEmpty,
    Cancelled,
    Processed { wallet: String },
    Errored { wallet: String },
}

impl Worker {
    pub fn new(
        id: String,
        queue: Arc<dyn QueueClient>,
        fetcher: Arc<Fetcher>,
        writer: Arc<dyn Writer>,
        ctx: CancellationToken,
    ) -> Self {
        Self {
            id,
            queue,
            fetcher,
            writer,
            ctx,
        }
    }

    /// The main loop: runs until `ctx` is cancelled.
    pub async fn run(&self) {
        loop {
            if self.ctx.is_cancelled() {
                break;
            }
            match self.step().await {
                StepOutcome::Cancelled => break,
                StepOutcome::QueueEmpty => {
                    tokio::select! {
                        _ = tokio::time::sleep(EMPTY_QUEUE_SLEEP) => {}
                        _ = self.ctx.cancelled() => break,
                    }
                }
                StepOutcome::Errored { wallet } => {
                    tracing::warn!(worker = %self.id, wallet = %wallet, "wallet processing errored, pausing before retry");
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_PAUSE) => {}
                        _ = self.ctx.cancelled() => break,
                    }
                }
                StepOutcome::Processed { .. } => {}
            }
        }
    }

    /// One iteration of the main loop (steps 1-5 of spec §4.5). Exposed
    /// separately from `run` so tests can drive it without sleeping.
    pub async fn step(&self) -> StepOutcome {
        if self.ctx.is_cancelled() {
            return StepOutcome::Cancelled;
        }

        let wallet = match self.queue.pop_wallet().await {
            Ok(Some(w)) => w,
            Ok(None) => return StepOutcome::QueueEmpty,
            Err(e) => {
                tracing::error!(worker = %self.id, error = %e, "queue store error on pop, pausing");
                return StepOutcome::Errored {
                    wallet: "<unknown>".to_string(),
                };
            }
        };

        if let Err(e) = self.queue.mark_inflight(&wallet, &self.id).await {
            tracing::warn!(worker = %self.id, wallet = %wallet, error = %e, "failed to mark in-flight, requeuing");
            let _ = self.queue.push_wallet(&wallet, 0.0).await;
            return StepOutcome::Errored { wallet };
        }

        match self.process_wallet(&wallet).await {
            Ok(()) => {
                let _ = self.queue.clear_inflight(&wallet).await;
                StepOutcome::Processed { wallet }
            }
            Err(BackfillError::Cancelled) => {
                let _ = self.queue.clear_inflight(&wallet).await;
                StepOutcome::Cancelled
            }
            Err(e) => {
                tracing::error!(worker = %self.id, wallet = %wallet, error = %e, "wallet processing failed, requeuing with deprioritized score");
                let _ = self.queue.clear_inflight(&wallet).await;
                let _ = self
                    .queue
                    .push_wallet(&wallet, crate::queue_client::now_unix() as f64)
                    .await;
                StepOutcome::Errored { wallet }
            }
        }
    }

    /// Resolve the resume point and run the scrape loop for one wallet.
    async fn process_wallet(&self, wallet: &str) -> Result<(), BackfillError> {
        let last = self.queue.get_progress(wallet).await?;
        self.scrape(wallet, last).await
    }

    /// The inner scrape loop: pages backward through signature history
    /// starting at `before`, dedups against `last`, checkpoints progress.
    async fn scrape(&self, wallet: &str, last: Option<String>) -> Result<(), BackfillError> {
        let mut before = last.clone();
        let mut processed_since_checkpoint: u64 = 0;

        loop {
            if self.ctx.is_cancelled() {
                return Err(BackfillError::Cancelled);
            }

            let page = self
                .fetcher
                .fetch_signatures(&self.ctx, wallet, before.as_deref(), SIGNATURES_PER_PAGE)
                .await?;

            let page_len = page.len() as u64;
            let mut batch_terminal: Option<String> = None;

            for id in &page {
                if Some(id.as_str()) == last.as_deref() {
                    continue; // dedup boundary
                }

                if let Err(e) = self.process_transaction(id).await {
                    tracing::warn!(wallet = %wallet, tx_id = %id, error = %e, "transaction processing failed, skipping");
                    continue;
                }

                batch_terminal = Some(id.clone());
                processed_since_checkpoint += 1;

                if processed_since_checkpoint >= CHECKPOINT_EVERY {
                    self.queue.set_progress(wallet, id).await?;
                    processed_since_checkpoint = 0;
                }
            }

            let new_before = batch_terminal.or_else(|| before.clone());

            if let Some(terminal) = &new_before {
                self.queue.set_progress(wallet, terminal).await?;
            }

            if page_len < SIGNATURES_PER_PAGE {
                return Ok(()); // exhausted the wallet's history
            }

            // Non-monotone remote guard: a full page that still didn't move
            // `before` means the remote is repeating itself (server quirk).
            if new_before == before {
                tracing::warn!(wallet = %wallet, "no progress between full batches, terminating scrape");
                return Ok(());
            }

            before = new_before;

            tokio::select! {
                _ = tokio::time::sleep(INTER_BATCH_SLEEP) => {}
                _ = self.ctx.cancelled() => return Err(BackfillError::Cancelled),
            }
        }
    }

    /// Fetch, decode, and persist a single transaction. A failure here is
    /// logged and skipped by the caller; it never aborts the wallet and the
    /// id is not checkpointed by this function (only the scrape loop's
    /// batch-terminal bookkeeping advances progress).
    async fn process_transaction(&self, id: &str) -> Result<(), BackfillError> {
        let raw = self.fetcher.fetch_transaction(&self.ctx, id).await?;
        let (chain_tx, sub_records) = decoder::decode(id, &raw)?;
        let result = self.writer.insert_transaction(&chain_tx, &sub_records).await;
        crate::metrics::record_transaction_outcome(if result.is_ok() { "success" } else { "failed" });
        result
    }
}
