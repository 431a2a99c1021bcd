//! Monotonic distributed order-id generator.
//!
//! Ids are 64-bit: the high 32 bits hold seconds elapsed since the service
//! epoch (1 Jan 2022), the low 32 bits a per-day, per-namespace sequence
//! obtained from a single Redis `INCR`. Two calls in the same second get
//! distinct sequence numbers; calls in different seconds never collide even
//! though the daily counter resets with the key. The only serialization
//! point is the `INCR` itself — no central sequencer round trip.
//!
//! The 32-bit timestamp half does not roll over until the year 2158; the
//! sequence half allows 2^32 ids per namespace per day.

use crate::error::{FlashSaleError, Result};
use crate::types::OrderId;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

/// Service epoch: 2022-01-01T00:00:00Z.
const EPOCH_SECS: i64 = 1_640_995_200;

/// Bit width of the sequence half.
const SEQUENCE_BITS: u32 = 32;

/// Compose an id from a relative timestamp and a sequence number.
#[must_use]
#[allow(clippy::cast_lossless)]
pub const fn compose_id(elapsed_secs: i64, sequence: u32) -> i64 {
    (elapsed_secs << SEQUENCE_BITS) | sequence as i64
}

/// Split an id back into its relative timestamp and sequence halves.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub const fn decompose_id(id: i64) -> (i64, u32) {
    (id >> SEQUENCE_BITS, id as u32)
}

/// Generator of globally unique, monotonically increasing order ids.
#[derive(Clone)]
pub struct OrderIdGenerator {
    /// Connection manager for connection pooling.
    conn: ConnectionManager,
}

impl OrderIdGenerator {
    /// Create a new generator over an existing connection manager.
    #[must_use]
    pub const fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Get the Redis counter key for a namespace on a given day.
    fn counter_key(namespace: &str, day: &str) -> String {
        format!("icr:{namespace}:{day}")
    }

    /// Produce the next id for `namespace`.
    ///
    /// Ids from the same second compare by sequence; ids from different
    /// seconds compare by timestamp. Within one namespace the result is
    /// strictly increasing when compared inside the same time unit.
    ///
    /// # Errors
    ///
    /// Returns error if the Redis increment fails, or if the sequence for
    /// this namespace exceeds 2^32 ids in one day.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn next_id(&self, namespace: &str) -> Result<OrderId> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let elapsed = now.timestamp() - EPOCH_SECS;
        let key = Self::counter_key(namespace, &now.format("%Y%m%d").to_string());

        let sequence: i64 = conn
            .incr(&key, 1)
            .await
            .map_err(|e| FlashSaleError::Redis(format!("failed to increment {key}: {e}")))?;

        if sequence > i64::from(u32::MAX) {
            return Err(FlashSaleError::Redis(format!(
                "sequence counter {key} overflowed the 32-bit id half"
            )));
        }

        Ok(OrderId::from_i64(compose_id(elapsed, sequence as u32)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn id_layout_matches_contract() {
        // One second past the epoch, third id of the day.
        let id = compose_id(1, 3);
        assert_eq!(id, (1 << 32) | 3);
        assert_eq!(decompose_id(id), (1, 3));
    }

    proptest! {
        #[test]
        fn compose_decompose_round_trips(elapsed in 0i64..(1 << 31), seq in 0u32..=u32::MAX) {
            prop_assert_eq!(decompose_id(compose_id(elapsed, seq)), (elapsed, seq));
        }

        #[test]
        fn later_seconds_always_compare_greater(
            elapsed in 0i64..(1 << 30),
            gap in 1i64..1000,
            seq_a in 0u32..=u32::MAX,
            seq_b in 0u32..=u32::MAX,
        ) {
            // A later time unit beats any sequence number from an earlier one.
            prop_assert!(compose_id(elapsed + gap, seq_b) > compose_id(elapsed, seq_a));
        }

        #[test]
        fn same_second_orders_by_sequence(elapsed in 0i64..(1 << 31), seq in 0u32..u32::MAX) {
            prop_assert!(compose_id(elapsed, seq + 1) > compose_id(elapsed, seq));
        }
    }

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn concurrent_ids_are_distinct_and_increasing() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let generator = OrderIdGenerator::new(conn);
        let namespace = format!("test-{}", uuid::Uuid::new_v4());

        let mut handles = vec![];
        for _ in 0..100 {
            let generator = generator.clone();
            let namespace = namespace.clone();
            handles.push(tokio::spawn(
                async move { generator.next_id(&namespace).await },
            ));
        }

        let ids: Vec<OrderId> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        let distinct: HashSet<OrderId> = ids.iter().copied().collect();
        assert_eq!(distinct.len(), ids.len(), "all ids must be distinct");

        // Within the same second, sequence numbers strictly increase.
        let mut by_second: std::collections::HashMap<i64, Vec<u32>> =
            std::collections::HashMap::new();
        for id in &ids {
            let (secs, seq) = decompose_id(id.as_i64());
            by_second.entry(secs).or_default().push(seq);
        }
        for sequences in by_second.values_mut() {
            sequences.sort_unstable();
            for pair in sequences.windows(2) {
                assert!(pair[0] < pair[1]);
            }
        }
    }
}
