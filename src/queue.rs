//! Durable order queue on Redis Streams.
//!
//! # Delivery semantics
//!
//! **At-least-once** with manual acknowledgement:
//! - The production producer is the admission script itself (the append is
//!   part of the atomic admission); [`OrderQueue::enqueue`] exists for
//!   tests and backfill tooling.
//! - Each entry is delivered to exactly one consumer in the group and
//!   stays on the pending-entries list until that consumer acks it.
//! - If the consumer crashes between read and ack, the entry is pending;
//!   [`OrderQueue::read_pending`] re-reads it during a recovery sweep.
//! - Delivery order within the stream is FIFO; redelivery order across a
//!   recovery sweep is not guaranteed, only eventual delivery.
//!
//! Consumers MUST be idempotent: the persistence layer's duplicate guard
//! turns redelivery into a no-op.

use crate::error::{FlashSaleError, Result};
use crate::types::{AdmittedOrder, BuyerId, OrderId, VoucherId};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use std::collections::HashMap;

/// A queue entry as delivered to this consumer, not yet acknowledged.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Stream entry id, needed to acknowledge.
    pub entry_id: String,
    fields: HashMap<String, String>,
}

impl Delivery {
    fn field_i64(&self, name: &str) -> Result<i64> {
        self.fields
            .get(name)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| FlashSaleError::MalformedEntry {
                entry_id: self.entry_id.clone(),
                field: name.to_string(),
            })
    }

    /// Decode the flat field map into an [`AdmittedOrder`].
    ///
    /// # Errors
    ///
    /// Returns [`FlashSaleError::MalformedEntry`] if a field is absent or
    /// not an integer; such an entry is poison — no redelivery can fix it.
    pub fn order(&self) -> Result<AdmittedOrder> {
        Ok(AdmittedOrder {
            order_id: OrderId::from_i64(self.field_i64("orderId")?),
            voucher_id: VoucherId::from_i64(self.field_i64("voucherId")?),
            buyer_id: BuyerId::from_i64(self.field_i64("buyerId")?),
        })
    }
}

/// Consumer-group handle over the admitted-order stream.
#[derive(Clone)]
pub struct OrderQueue {
    /// Connection manager for connection pooling.
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    block_timeout_ms: u64,
}

impl OrderQueue {
    /// Create a new queue handle.
    pub fn new(
        conn: ConnectionManager,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        block_timeout_ms: u64,
    ) -> Self {
        Self {
            conn,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            block_timeout_ms,
        }
    }

    /// The stream key this queue reads from.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Create the consumer group (and the stream) if missing.
    ///
    /// The group starts at offset `0`, not `$`: orders admitted before the
    /// first worker boot must still be delivered, not silently skipped.
    /// Safe to call repeatedly; an already-existing group is not an error.
    ///
    /// # Errors
    ///
    /// Returns error if group creation fails for any reason other than
    /// the group already existing.
    pub async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;

        match created {
            Ok(_) => {
                tracing::info!(stream = %self.stream, group = %self.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(FlashSaleError::Redis(format!(
                "failed to create group {} on {}: {e}",
                self.group, self.stream
            ))),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    async fn read(&self, offset: &str) -> Result<Option<Delivery>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block(self.block_timeout_ms as usize);

        let reply: StreamReadReply = conn
            .xread_options(&[self.stream.as_str()], &[offset], &options)
            .await
            .map_err(|e| {
                FlashSaleError::Redis(format!("failed to read from {}: {e}", self.stream))
            })?;

        let Some(key) = reply.keys.into_iter().next() else {
            return Ok(None);
        };
        let Some(entry) = key.ids.into_iter().next() else {
            return Ok(None);
        };

        let mut fields = HashMap::with_capacity(entry.map.len());
        for name in entry.map.keys() {
            if let Some(value) = entry.get::<String>(name) {
                fields.insert(name.clone(), value);
            }
        }

        Ok(Some(Delivery {
            entry_id: entry.id,
            fields,
        }))
    }

    /// Block-read the next new entry for this consumer, up to the
    /// configured timeout. `Ok(None)` means the timeout elapsed.
    ///
    /// # Errors
    ///
    /// Returns error if the stream read fails. A failed read does not
    /// drop anything — the entry was never delivered.
    pub async fn read_next(&self) -> Result<Option<Delivery>> {
        self.read(">").await
    }

    /// Read the oldest entry from this consumer's pending-entries list
    /// (delivered but unacknowledged). `Ok(None)` means the list is empty.
    ///
    /// # Errors
    ///
    /// Returns error if the stream read fails.
    pub async fn read_pending(&self) -> Result<Option<Delivery>> {
        self.read("0").await
    }

    /// Acknowledge a processed entry, removing it from the pending list.
    ///
    /// # Errors
    ///
    /// Returns error if the acknowledgement fails; the entry then stays
    /// pending and will be reprocessed by the recovery sweep.
    pub async fn ack(&self, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.stream, &self.group, &[entry_id])
            .await
            .map_err(|e| {
                FlashSaleError::Redis(format!("failed to ack {entry_id} on {}: {e}", self.stream))
            })?;
        tracing::debug!(entry_id = %entry_id, "queue entry acknowledged");
        Ok(())
    }

    /// Append an admitted order directly to the stream.
    ///
    /// The admission script is the production producer; this exists for
    /// tests and for re-enqueueing during operational backfills.
    ///
    /// # Errors
    ///
    /// Returns error if the append fails.
    pub async fn enqueue(&self, order: &AdmittedOrder) -> Result<String> {
        let mut conn = self.conn.clone();
        let entry_id: String = conn
            .xadd(
                &self.stream,
                "*",
                &[
                    ("orderId", order.order_id.as_i64().to_string()),
                    ("voucherId", order.voucher_id.as_i64().to_string()),
                    ("buyerId", order.buyer_id.as_i64().to_string()),
                ],
            )
            .await
            .map_err(|e| {
                FlashSaleError::Redis(format!("failed to append to {}: {e}", self.stream))
            })?;
        Ok(entry_id)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use uuid::Uuid;

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    async fn queue() -> OrderQueue {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        OrderQueue::new(
            conn,
            format!("test:stream:{}", Uuid::new_v4()),
            "g1",
            "c1",
            200,
        )
    }

    fn sample_order() -> AdmittedOrder {
        AdmittedOrder {
            order_id: OrderId::from_i64(42),
            voucher_id: VoucherId::from_i64(7),
            buyer_id: BuyerId::from_i64(1010),
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn round_trip_and_ack_clears_pending() {
        let queue = queue().await;
        queue.ensure_group().await.unwrap();
        queue.enqueue(&sample_order()).await.unwrap();

        let delivery = queue.read_next().await.unwrap().unwrap();
        assert_eq!(delivery.order().unwrap(), sample_order());

        // Unacked: still on the pending list.
        let pending = queue.read_pending().await.unwrap().unwrap();
        assert_eq!(pending.entry_id, delivery.entry_id);

        queue.ack(&delivery.entry_id).await.unwrap();
        assert!(queue.read_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn read_times_out_on_empty_stream() {
        let queue = queue().await;
        queue.ensure_group().await.unwrap();
        assert!(queue.read_next().await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn ensure_group_is_idempotent() {
        let queue = queue().await;
        queue.ensure_group().await.unwrap();
        queue.ensure_group().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn partial_entry_decodes_to_malformed() {
        let queue = queue().await;
        queue.ensure_group().await.unwrap();

        let mut conn = queue.conn.clone();
        let _: String = conn
            .xadd(queue.stream(), "*", &[("orderId", "42")])
            .await
            .unwrap();

        let delivery = queue.read_next().await.unwrap().unwrap();
        let err = delivery.order().unwrap_err();
        assert!(matches!(
            err,
            FlashSaleError::MalformedEntry { ref field, .. } if field == "voucherId"
        ));
    }
}
