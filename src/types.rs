//! Domain types for the flash-sale pipeline.
//!
//! Identifiers are 64-bit newtypes rather than UUIDs: order ids carry a
//! time|sequence encoding produced by [`crate::id_generator`], and voucher
//! and buyer ids arrive from the surrounding catalog/user services as
//! integers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a seckill voucher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoucherId(i64);

impl VoucherId {
    /// Create a `VoucherId` from its raw integer.
    #[must_use]
    pub const fn from_i64(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw integer.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for VoucherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a buyer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuyerId(i64);

impl BuyerId {
    /// Create a `BuyerId` from its raw integer.
    #[must_use]
    pub const fn from_i64(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw integer.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for BuyerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an order.
///
/// Encodes seconds-since-epoch in the high 32 bits and a per-day sequence
/// number in the low 32 bits; see [`crate::id_generator`] for the layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(i64);

impl OrderId {
    /// Create an `OrderId` from its raw integer.
    #[must_use]
    pub const fn from_i64(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw integer.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Records
// ============================================================================

/// An admitted-but-not-yet-persisted order, as carried by the order queue.
///
/// This is the message produced by a successful admission and consumed by
/// the fulfillment worker. `created_at` is assigned by the durable store at
/// persistence time, so it is not part of this record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmittedOrder {
    /// Pre-generated order id (obtained before admission).
    pub order_id: OrderId,
    /// Voucher being purchased.
    pub voucher_id: VoucherId,
    /// Buyer the unit was reserved for.
    pub buyer_id: BuyerId,
}

/// Catalog row for a seckill voucher.
///
/// Read through the cache-aside layer; `stock` here is the durable counter,
/// which trails the Redis counter the admission script decrements.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeckillVoucher {
    /// Voucher id.
    pub voucher_id: VoucherId,
    /// Remaining durable stock.
    pub stock: i32,
    /// When the sale opens.
    pub begin_time: DateTime<Utc>,
    /// When the sale closes.
    pub end_time: DateTime<Utc>,
}

impl SeckillVoucher {
    /// Whether the sale window is open at `now`.
    #[must_use]
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.begin_time <= now && now < self.end_time
    }
}

// ============================================================================
// Admission outcome
// ============================================================================

/// User-visible result of an admission attempt.
///
/// Rejections are outcomes, not errors: they are final answers returned
/// synchronously to the buyer and are never retried on their behalf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// The buyer won a unit; the order will be persisted asynchronously.
    Admitted {
        /// Order id the buyer can poll for.
        order_id: OrderId,
    },
    /// Stock is exhausted.
    InsufficientStock,
    /// This buyer already holds an order for this voucher.
    DuplicateOrder,
    /// The sale has not opened yet.
    NotYetOpen,
    /// The sale has already closed.
    AlreadyClosed,
    /// No such voucher exists.
    UnknownVoucher,
}

impl AdmissionOutcome {
    /// Whether the buyer was admitted.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn sale_window_is_half_open() {
        let now = Utc::now();
        let voucher = SeckillVoucher {
            voucher_id: VoucherId::from_i64(7),
            stock: 100,
            begin_time: now,
            end_time: now + Duration::hours(1),
        };
        assert!(voucher.is_open_at(now));
        assert!(voucher.is_open_at(now + Duration::minutes(59)));
        assert!(!voucher.is_open_at(now + Duration::hours(1)));
        assert!(!voucher.is_open_at(now - Duration::seconds(1)));
    }

    #[test]
    fn order_ids_order_by_raw_value() {
        assert!(OrderId::from_i64(2) > OrderId::from_i64(1));
    }
}
