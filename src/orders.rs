//! Durable order persistence.
//!
//! The repository is the authoritative end of the pipeline: whatever the
//! admission script decided in Redis, an order only exists once
//! [`OrderRepository::persist`] commits. The duplicate re-check and the
//! durable stock decrement run inside one transaction, so redelivered
//! queue entries and out-of-band writers both collapse to a single row
//! per `(buyer, voucher)`.

use crate::error::{FlashSaleError, Result};
use crate::types::{AdmittedOrder, BuyerId, OrderId, VoucherId};
use sqlx::PgPool;
use std::future::Future;

/// Result of a persistence attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The order row was inserted and durable stock decremented.
    Persisted,
    /// A row for this `(buyer, voucher)` already exists; redelivery no-op.
    AlreadyPersisted,
    /// Durable stock is exhausted. The admission counter and the durable
    /// counter have drifted; the order cannot be honored.
    StockExhausted,
}

/// Persistence seam for admitted orders.
///
/// The fulfillment worker is generic over this trait so tests can swap in
/// an in-memory implementation.
pub trait OrderRepository: Send + Sync {
    /// Look up a persisted order for this buyer and voucher, if any.
    fn find_existing(
        &self,
        buyer_id: BuyerId,
        voucher_id: VoucherId,
    ) -> impl Future<Output = Result<Option<OrderId>>> + Send;

    /// Persist an admitted order transactionally: re-check for an existing
    /// row, decrement durable stock, insert. Must be idempotent under
    /// redelivery.
    fn persist(&self, order: &AdmittedOrder) -> impl Future<Output = Result<PersistOutcome>> + Send;
}

/// Apply the crate's schema migrations.
///
/// # Errors
///
/// Returns error if a migration fails to apply.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| FlashSaleError::Database(format!("failed to run migrations: {e}")))
}

/// `PostgreSQL`-backed order repository.
#[derive(Clone)]
pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    /// Create a repository over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl OrderRepository for PgOrderRepository {
    async fn find_existing(
        &self,
        buyer_id: BuyerId,
        voucher_id: VoucherId,
    ) -> Result<Option<OrderId>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT order_id FROM voucher_orders WHERE buyer_id = $1 AND voucher_id = $2",
        )
        .bind(buyer_id.as_i64())
        .bind(voucher_id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| FlashSaleError::Database(format!("failed to query order: {e}")))?;

        Ok(row.map(|(id,)| OrderId::from_i64(id)))
    }

    async fn persist(&self, order: &AdmittedOrder) -> Result<PersistOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| FlashSaleError::Database(format!("failed to begin transaction: {e}")))?;

        // Authoritative duplicate guard, independent of the admission-time
        // reservation set (which is best-effort and evictable).
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT order_id FROM voucher_orders WHERE buyer_id = $1 AND voucher_id = $2",
        )
        .bind(order.buyer_id.as_i64())
        .bind(order.voucher_id.as_i64())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| FlashSaleError::Database(format!("failed to re-check order: {e}")))?;

        if existing.is_some() {
            tx.rollback()
                .await
                .map_err(|e| FlashSaleError::Database(format!("failed to roll back: {e}")))?;
            return Ok(PersistOutcome::AlreadyPersisted);
        }

        let decremented = sqlx::query(
            "UPDATE seckill_vouchers SET stock = stock - 1
             WHERE voucher_id = $1 AND stock > 0",
        )
        .bind(order.voucher_id.as_i64())
        .execute(&mut *tx)
        .await
        .map_err(|e| FlashSaleError::Database(format!("failed to decrement stock: {e}")))?
        .rows_affected();

        if decremented == 0 {
            tx.rollback()
                .await
                .map_err(|e| FlashSaleError::Database(format!("failed to roll back: {e}")))?;
            return Ok(PersistOutcome::StockExhausted);
        }

        sqlx::query(
            "INSERT INTO voucher_orders (order_id, voucher_id, buyer_id) VALUES ($1, $2, $3)",
        )
        .bind(order.order_id.as_i64())
        .bind(order.voucher_id.as_i64())
        .bind(order.buyer_id.as_i64())
        .execute(&mut *tx)
        .await
        .map_err(|e| FlashSaleError::Database(format!("failed to insert order: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| FlashSaleError::Database(format!("failed to commit order: {e}")))?;

        Ok(PersistOutcome::Persisted)
    }
}
