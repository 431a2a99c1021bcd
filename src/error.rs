//! Error types for the flash-sale pipeline.
//!
//! Admission rejections (insufficient stock, duplicate order) are not in
//! this taxonomy: they are [`crate::types::AdmissionOutcome`] variants,
//! returned synchronously to the buyer. This enum covers infrastructure
//! failures and the two worker-local conditions (lock contention, poison
//! queue entries) that need the entry id attached.

use thiserror::Error;

/// Result type alias for flash-sale operations.
pub type Result<T> = std::result::Result<T, FlashSaleError>;

/// Failure modes of the admission and fulfillment pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlashSaleError {
    // ═══════════════════════════════════════════════════════════
    // Store failures
    // ═══════════════════════════════════════════════════════════
    /// A Redis command or script failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// A database query or transaction failed.
    #[error("Database error: {0}")]
    Database(String),

    /// JSON (de)serialization of a cache entry failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ═══════════════════════════════════════════════════════════
    // Pipeline conditions
    // ═══════════════════════════════════════════════════════════
    /// The per-buyer lock stayed contended through the retry budget.
    ///
    /// Surfaced only by the fulfillment worker; the queue entry is left
    /// pending so redelivery retries it.
    #[error("lock on {resource} still contended after retries")]
    LockContended {
        /// Lock resource name that stayed held.
        resource: String,
    },

    /// A queue entry is missing a required field and can never be
    /// processed, on this delivery or any redelivery.
    #[error("malformed queue entry {entry_id}: missing or invalid field {field}")]
    MalformedEntry {
        /// Stream entry id of the poison entry.
        entry_id: String,
        /// The field that was absent or unparseable.
        field: String,
    },

    /// The admission script returned a code outside its 0/1/2 contract.
    #[error("admission script returned unexpected code {0}")]
    Protocol(i64),
}

impl FlashSaleError {
    /// Returns `true` if retrying the same operation later can succeed.
    ///
    /// Store failures are transient (the read loop retries after its
    /// timeout); malformed entries and protocol violations are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Redis(_) | Self::Database(_) | Self::LockContended { .. }
        )
    }
}
