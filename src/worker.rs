//! Order fulfillment worker.
//!
//! # Architecture
//!
//! A single-threaded consumer loop per process: block-read one admitted
//! order from the group, take the per-buyer distributed lock, persist
//! transactionally, acknowledge only after the commit. Multiple processes
//! may each run one worker — the cross-process lock keeps per-buyer
//! persistence exclusive — but concurrency inside a process is
//! deliberately capped at one, which keeps lock granularity trivial.
//!
//! # Crash recovery
//!
//! An entry read but not yet acknowledged survives a worker crash on the
//! group's pending-entries list. Whenever the main loop hits an error it
//! runs [`FulfillmentWorker::recover_pending`]: re-read offset `0` (the
//! pending list) until empty, processing each entry exactly like a fresh
//! one. The sweep is idempotent — the repository's duplicate guard turns
//! an already-persisted redelivery into a no-op — so acknowledging only
//! after commit yields at-least-once delivery with effectively-once
//! application.

use crate::config::SeckillConfig;
use crate::error::{FlashSaleError, Result};
use crate::lock::{FlashLock, LockToken};
use crate::orders::{OrderRepository, PersistOutcome};
use crate::queue::{Delivery, OrderQueue};
use std::time::Duration;

/// Single-threaded consumer of admitted orders.
///
/// Owns its queue handle, lock handle and repository — constructed once at
/// process start and driven by [`FulfillmentWorker::run`].
pub struct FulfillmentWorker<R> {
    queue: OrderQueue,
    lock: FlashLock,
    repo: R,
    lock_ttl: Duration,
    lock_retries: u32,
    lock_backoff: Duration,
}

impl<R: OrderRepository> FulfillmentWorker<R> {
    /// Create a new worker from its collaborators and tuning.
    #[must_use]
    pub const fn new(queue: OrderQueue, lock: FlashLock, repo: R, cfg: &SeckillConfig) -> Self {
        Self {
            queue,
            lock,
            repo,
            lock_ttl: Duration::from_secs(cfg.lock_ttl_secs),
            lock_retries: cfg.lock_retries,
            lock_backoff: Duration::from_millis(cfg.lock_backoff_ms),
        }
    }

    /// Run the consumer loop until the process is stopped.
    ///
    /// A failed read or a failed fulfillment never drops an entry: the
    /// read loop retries after its timeout, and unacknowledged entries are
    /// caught by the recovery sweep.
    ///
    /// # Errors
    ///
    /// Returns error only if the consumer group cannot be created at
    /// startup; everything after that is retried in place.
    pub async fn run(&self) -> Result<()> {
        self.queue.ensure_group().await?;
        tracing::info!(stream = %self.queue.stream(), "fulfillment worker started");

        loop {
            match self.queue.read_next().await {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.fulfill(&delivery).await {
                        tracing::warn!(
                            entry_id = %delivery.entry_id,
                            error = %e,
                            "fulfillment failed, entry left pending"
                        );
                        self.recovery_pass().await;
                    }
                }
                Ok(None) => {} // block timeout, keep tailing
                Err(e) => {
                    tracing::warn!(error = %e, "queue read failed");
                    self.recovery_pass().await;
                    tokio::time::sleep(self.lock_backoff).await;
                }
            }
        }
    }

    /// Process entries until a read times out with nothing new.
    ///
    /// For tests and drain tooling; production use is [`Self::run`].
    ///
    /// # Errors
    ///
    /// Returns the first error instead of retrying in place.
    pub async fn drain(&self) -> Result<u64> {
        self.queue.ensure_group().await?;
        let mut processed = 0;
        while let Some(delivery) = self.queue.read_next().await? {
            self.fulfill(&delivery).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn recovery_pass(&self) {
        if let Err(e) = self.recover_pending().await {
            tracing::error!(error = %e, "recovery sweep aborted");
        }
    }

    /// Reprocess every delivered-but-unacknowledged entry, then return.
    ///
    /// Idempotent and safe to re-run at any time: entries that were in
    /// fact persisted before the crash resolve to `AlreadyPersisted` and
    /// are acknowledged without a second insert.
    ///
    /// # Errors
    ///
    /// Returns error if the pending list itself cannot be read; a failing
    /// individual entry is retried in place.
    pub async fn recover_pending(&self) -> Result<()> {
        tracing::info!("recovery sweep over pending entries");
        while let Some(delivery) = self.queue.read_pending().await? {
            if let Err(e) = self.fulfill(&delivery).await {
                tracing::warn!(
                    entry_id = %delivery.entry_id,
                    error = %e,
                    "pending entry failed, will retry"
                );
                tokio::time::sleep(self.lock_backoff).await;
            }
        }
        Ok(())
    }

    async fn try_lock_with_retry(&self, resource: &str) -> Result<Option<LockToken>> {
        for attempt in 0..=self.lock_retries {
            if let Some(token) = self.lock.try_lock(resource, self.lock_ttl).await? {
                return Ok(Some(token));
            }
            if attempt < self.lock_retries {
                tokio::time::sleep(self.lock_backoff).await;
            }
        }
        Ok(None)
    }

    /// Persist one delivery and acknowledge it after the commit.
    async fn fulfill(&self, delivery: &Delivery) -> Result<()> {
        let order = match delivery.order() {
            Ok(order) => order,
            Err(e) => {
                // Poison: no redelivery can grow the missing fields.
                tracing::error!(
                    entry_id = %delivery.entry_id,
                    error = %e,
                    "discarding malformed queue entry"
                );
                self.queue.ack(&delivery.entry_id).await?;
                return Ok(());
            }
        };

        let resource = format!("order:{}", order.buyer_id);
        let Some(token) = self.try_lock_with_retry(&resource).await? else {
            // Another process is persisting for this buyer; leave the
            // entry pending and let redelivery retry.
            return Err(FlashSaleError::LockContended { resource });
        };

        let persisted = self.repo.persist(&order).await;
        if let Err(e) = self.lock.unlock(&resource, &token).await {
            tracing::warn!(resource = %resource, error = %e, "failed to release buyer lock");
        }

        match persisted? {
            PersistOutcome::Persisted => {
                tracing::info!(
                    order_id = %order.order_id,
                    voucher_id = %order.voucher_id,
                    buyer_id = %order.buyer_id,
                    "order persisted"
                );
            }
            PersistOutcome::AlreadyPersisted => {
                tracing::debug!(
                    order_id = %order.order_id,
                    "redelivered entry already persisted"
                );
            }
            PersistOutcome::StockExhausted => {
                // Admission said yes, durable stock says no: the counters
                // drifted. The entry can never succeed, so surface loudly
                // and acknowledge rather than wedge the sweep.
                tracing::error!(
                    order_id = %order.order_id,
                    voucher_id = %order.voucher_id,
                    "durable stock exhausted for admitted order"
                );
            }
        }

        self.queue.ack(&delivery.entry_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::types::{AdmittedOrder, BuyerId, OrderId, VoucherId};
    use redis::aio::ConnectionManager;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// In-memory repository with the same idempotence contract as Postgres.
    #[derive(Default)]
    struct MemoryRepository {
        rows: Mutex<Vec<AdmittedOrder>>,
    }

    impl MemoryRepository {
        fn orders(&self) -> Vec<AdmittedOrder> {
            self.rows.lock().unwrap().clone()
        }
    }

    impl OrderRepository for MemoryRepository {
        async fn find_existing(
            &self,
            buyer_id: BuyerId,
            voucher_id: VoucherId,
        ) -> crate::error::Result<Option<OrderId>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .find(|o| o.buyer_id == buyer_id && o.voucher_id == voucher_id)
                .map(|o| o.order_id))
        }

        async fn persist(&self, order: &AdmittedOrder) -> crate::error::Result<PersistOutcome> {
            let mut rows = self.rows.lock().unwrap();
            if rows
                .iter()
                .any(|o| o.buyer_id == order.buyer_id && o.voucher_id == order.voucher_id)
            {
                return Ok(PersistOutcome::AlreadyPersisted);
            }
            rows.push(*order);
            Ok(PersistOutcome::Persisted)
        }
    }

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7-alpine
    // The Postgres end of the pipeline is covered in tests/pipeline.rs.

    async fn worker_parts() -> (OrderQueue, FlashLock) {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let queue = OrderQueue::new(
            conn.clone(),
            format!("test:stream:{}", Uuid::new_v4()),
            "g1",
            "c1",
            200,
        );
        (queue, FlashLock::new(conn))
    }

    fn test_config() -> SeckillConfig {
        SeckillConfig {
            lock_ttl_secs: 10,
            lock_retries: 3,
            lock_backoff_ms: 20,
            cache_ttl_secs: 60,
            cache_null_ttl_secs: 60,
        }
    }

    fn order(order_id: i64, buyer_id: i64) -> AdmittedOrder {
        AdmittedOrder {
            order_id: OrderId::from_i64(order_id),
            voucher_id: VoucherId::from_i64(7),
            buyer_id: BuyerId::from_i64(buyer_id),
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn drain_persists_and_acks_everything() {
        let (queue, lock) = worker_parts().await;
        queue.ensure_group().await.unwrap();
        for i in 0..5 {
            queue.enqueue(&order(i, 100 + i)).await.unwrap();
        }

        let worker = FulfillmentWorker::new(queue.clone(), lock, MemoryRepository::default(), &test_config());
        assert_eq!(worker.drain().await.unwrap(), 5);

        let buyers: HashSet<i64> = worker
            .repo
            .orders()
            .iter()
            .map(|o| o.buyer_id.as_i64())
            .collect();
        assert_eq!(buyers.len(), 5);
        assert!(queue.read_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn crashed_delivery_is_recovered_exactly_once() {
        let (queue, lock) = worker_parts().await;
        queue.ensure_group().await.unwrap();
        queue.enqueue(&order(1, 200)).await.unwrap();

        // Simulated crash: dequeue without acknowledging.
        let abandoned = queue.read_next().await.unwrap().unwrap();
        drop(abandoned);

        let worker = FulfillmentWorker::new(queue.clone(), lock, MemoryRepository::default(), &test_config());
        worker.recover_pending().await.unwrap();

        assert_eq!(worker.repo.orders().len(), 1, "recovered exactly once");
        assert!(queue.read_pending().await.unwrap().is_none());

        // Re-running the sweep must be a no-op.
        worker.recover_pending().await.unwrap();
        assert_eq!(worker.repo.orders().len(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn redelivered_persisted_entry_is_not_duplicated() {
        let (queue, lock) = worker_parts().await;
        queue.ensure_group().await.unwrap();

        let repo = MemoryRepository::default();
        // Already persisted before the crash, but never acked.
        repo.persist(&order(9, 300)).await.unwrap();
        queue.enqueue(&order(9, 300)).await.unwrap();
        let _crashed = queue.read_next().await.unwrap().unwrap();

        let worker = FulfillmentWorker::new(queue.clone(), lock, repo, &test_config());
        worker.recover_pending().await.unwrap();

        assert_eq!(worker.repo.orders().len(), 1, "no duplicate row");
        assert!(queue.read_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn malformed_entry_is_discarded_not_wedged() {
        let (queue, lock) = worker_parts().await;
        queue.ensure_group().await.unwrap();

        let mut conn = {
            let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
            ConnectionManager::new(client).await.unwrap()
        };
        let _: String = redis::AsyncCommands::xadd(
            &mut conn,
            queue.stream(),
            "*",
            &[("orderId", "not-a-number")],
        )
        .await
        .unwrap();
        queue.enqueue(&order(2, 400)).await.unwrap();

        let worker = FulfillmentWorker::new(queue.clone(), lock, MemoryRepository::default(), &test_config());
        assert_eq!(worker.drain().await.unwrap(), 2);

        assert_eq!(worker.repo.orders().len(), 1, "only the valid entry persists");
        assert!(queue.read_pending().await.unwrap().is_none());
    }
}
