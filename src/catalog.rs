//! Voucher catalog read path.
//!
//! Serves voucher metadata through the cache-aside layer and owns the two
//! write-side chores the admission pipeline depends on: seeding the Redis
//! stock counter when a voucher is published, and warming the
//! logical-expiry cache before a sale opens.

use crate::admission::stock_key;
use crate::cache::CacheClient;
use crate::error::{FlashSaleError, Result};
use crate::types::{SeckillVoucher, VoucherId};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use std::time::Duration;

/// Voucher metadata reads, cache warm-up, and stock seeding.
#[derive(Clone)]
pub struct VoucherCatalog {
    cache: CacheClient,
    conn: ConnectionManager,
    pool: PgPool,
    /// TTL for positive cache entries.
    ttl: Duration,
    /// TTL for tombstone entries.
    null_ttl: Duration,
}

impl VoucherCatalog {
    /// Create a new catalog over the shared store and the durable pool.
    #[must_use]
    pub fn new(conn: ConnectionManager, pool: PgPool, ttl: Duration, null_ttl: Duration) -> Self {
        Self {
            cache: CacheClient::new(conn.clone()),
            conn,
            pool,
            ttl,
            null_ttl,
        }
    }

    /// Get the cache key for a voucher.
    fn cache_key(voucher_id: VoucherId) -> String {
        format!("cache:voucher:{voucher_id}")
    }

    async fn load_from_db(pool: &PgPool, voucher_id: VoucherId) -> Result<Option<SeckillVoucher>> {
        let row: Option<(i64, i32, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT voucher_id, stock, begin_time, end_time
             FROM seckill_vouchers WHERE voucher_id = $1",
        )
        .bind(voucher_id.as_i64())
        .fetch_optional(pool)
        .await
        .map_err(|e| FlashSaleError::Database(format!("failed to query voucher {voucher_id}: {e}")))?;

        Ok(row.map(|(id, stock, begin_time, end_time)| SeckillVoucher {
            voucher_id: VoucherId::from_i64(id),
            stock,
            begin_time,
            end_time,
        }))
    }

    /// Read a voucher through the penetration-resistant cache.
    ///
    /// Nonexistent vouchers are tombstoned so repeat lookups stop hitting
    /// the database.
    ///
    /// # Errors
    ///
    /// Returns error if Redis or the database fails.
    pub async fn get_voucher(&self, voucher_id: VoucherId) -> Result<Option<SeckillVoucher>> {
        let pool = self.pool.clone();
        self.cache
            .get_or_load(
                &Self::cache_key(voucher_id),
                self.ttl,
                self.null_ttl,
                move || async move { Self::load_from_db(&pool, voucher_id).await },
            )
            .await
    }

    /// Read a voucher through the logical-expiry cache.
    ///
    /// For the hot keys of a live sale; requires [`Self::warm_voucher`]
    /// to have run first, since a miss is treated as "does not exist".
    ///
    /// # Errors
    ///
    /// Returns error if Redis fails or the cached envelope is corrupt.
    pub async fn get_voucher_hot(&self, voucher_id: VoucherId) -> Result<Option<SeckillVoucher>> {
        let pool = self.pool.clone();
        self.cache
            .get_with_logical_expiry(
                &Self::cache_key(voucher_id),
                &format!("voucher:{voucher_id}"),
                self.ttl,
                move || async move { Self::load_from_db(&pool, voucher_id).await },
            )
            .await
    }

    /// Publish a voucher: upsert the durable row and seed the Redis stock
    /// counter the admission script decrements.
    ///
    /// # Errors
    ///
    /// Returns error if the database write or the stock seed fails.
    pub async fn publish(&self, voucher: &SeckillVoucher) -> Result<()> {
        sqlx::query(
            "INSERT INTO seckill_vouchers (voucher_id, stock, begin_time, end_time)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (voucher_id) DO UPDATE
             SET stock = EXCLUDED.stock,
                 begin_time = EXCLUDED.begin_time,
                 end_time = EXCLUDED.end_time",
        )
        .bind(voucher.voucher_id.as_i64())
        .bind(voucher.stock)
        .bind(voucher.begin_time)
        .bind(voucher.end_time)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            FlashSaleError::Database(format!(
                "failed to publish voucher {}: {e}",
                voucher.voucher_id
            ))
        })?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .set(stock_key(voucher.voucher_id), voucher.stock)
            .await
            .map_err(|e| {
                FlashSaleError::Redis(format!(
                    "failed to seed stock for voucher {}: {e}",
                    voucher.voucher_id
                ))
            })?;

        tracing::info!(
            voucher_id = %voucher.voucher_id,
            stock = voucher.stock,
            "voucher published, stock seeded"
        );
        Ok(())
    }

    /// Preload the logical-expiry cache entry for a voucher.
    ///
    /// Returns `Ok(false)` if the voucher does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the database read or cache write fails.
    pub async fn warm_voucher(&self, voucher_id: VoucherId, ttl: Duration) -> Result<bool> {
        match Self::load_from_db(&self.pool, voucher_id).await? {
            Some(voucher) => {
                self.cache
                    .set_with_logical_expiry(&Self::cache_key(voucher_id), &voucher, ttl)
                    .await?;
                tracing::info!(voucher_id = %voucher_id, "voucher cache warmed");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
