//! Persistence layer: idempotent upsert into the two relational stores
//! named in spec §1 (raw transaction records, derived domain events).
//! External per spec §1/§6 but implemented here; grounded on
//! `src/db/repository.rs`'s `QueryBuilder`/`ON CONFLICT` idiom.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::decoder::{ChainTx, SubRecord};
use crate::error::BackfillError;

#[async_trait]
pub trait Writer: Send + Sync {
    async fn insert_transaction(
        &self,
        chain_tx: &ChainTx,
        sub_records: &[SubRecord],
    ) -> Result<(), BackfillError>;
}

pub struct PgWriter {
    pool: PgPool,
}

impl PgWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Writer for PgWriter {
    async fn insert_transaction(
        &self,
        chain_tx: &ChainTx,
        sub_records: &[SubRecord],
    ) -> Result<(), BackfillError> {
        let mut tx = self.pool.begin().await.map_err(|e| BackfillError::Writer {
            id: chain_tx.id.clone(),
            message: format!("failed to start transaction: {}", e),
        })?;

        sqlx::query(
            "INSERT INTO chain_transactions (id, slot, block_time, payload)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE
             SET slot = $2, block_time = $3, payload = $4",
        )
        .bind(&chain_tx.id)
        .bind(chain_tx.slot as i64)
        .bind(chain_tx.block_time)
        .bind(&chain_tx.payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| BackfillError::Writer {
            id: chain_tx.id.clone(),
            message: format!("failed to upsert chain_transactions: {}", e),
        })?;

        for record in sub_records {
            sqlx::query(
                "INSERT INTO chain_instructions (tx_id, idx, kind, data)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (tx_id, idx) DO UPDATE
                 SET kind = $3, data = $4",
            )
            .bind(&record.tx_id)
            .bind(record.index as i64)
            .bind(&record.kind)
            .bind(&record.data)
            .execute(&mut *tx)
            .await
            .map_err(|e| BackfillError::Writer {
                id: chain_tx.id.clone(),
                message: format!("failed to upsert chain_instructions: {}", e),
            })?;
        }

        tx.commit().await.map_err(|e| BackfillError::Writer {
            id: chain_tx.id.clone(),
            message: format!("failed to commit transaction: {}", e),
        })?;

        Ok(())
    }
}

/// In-memory writer for tests: records every call, lets tests simulate a
/// transient failure for a specific id (spec §8 scenario 6).
pub struct InMemoryWriter {
    inserted: std::sync::Mutex<Vec<String>>,
    fail_once_for: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl InMemoryWriter {
    pub fn new() -> Self {
        Self {
            inserted: std::sync::Mutex::new(Vec::new()),
            fail_once_for: std::sync::Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn fail_once(&self, id: &str) {
        self.fail_once_for.lock().unwrap().insert(id.to_string());
    }

    pub fn inserted_ids(&self) -> Vec<String> {
        self.inserted.lock().unwrap().clone()
    }
}

impl Default for InMemoryWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Writer for InMemoryWriter {
    async fn insert_transaction(
        &self,
        chain_tx: &ChainTx,
        _sub_records: &[SubRecord],
    ) -> Result<(), BackfillError> {
        let mut fail_set = self.fail_once_for.lock().unwrap();
        if fail_set.remove(&chain_tx.id) {
            return Err(BackfillError::Writer {
                id: chain_tx.id.clone(),
                message: "simulated failure".to_string(),
            });
        }
        drop(fail_set);

        self.inserted.lock().unwrap().push(chain_tx.id.clone());
        Ok(())
    }
}
