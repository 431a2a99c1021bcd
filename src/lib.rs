//! Flash-sale (seckill) admission and fulfillment pipeline.
//!
//! Lets a large burst of concurrent buyers compete for a strictly limited
//! voucher stock without overselling, with at most one order per buyer,
//! and with no lost or duplicated orders across worker crashes. The
//! fast admission decision is decoupled from slower persistent order
//! creation by a durable queue.
//!
//! # Architecture
//!
//! ```text
//! buyer request
//!      │
//!      ▼
//! ┌───────────────────┐   pre-generated id   ┌──────────────────┐
//! │  SeckillService   │◄─────────────────────│ OrderIdGenerator │
//! │ (window pre-check)│                      │   (INCR per day) │
//! └─────────┬─────────┘                      └──────────────────┘
//!           ▼
//! ┌───────────────────┐  one atomic Lua round trip:
//! │     Admission     │  stock check → duplicate check →
//! │     (script)      │  decrement + reserve + XADD
//! └─────────┬─────────┘
//!           ▼
//! ┌───────────────────┐   XREADGROUP / XACK   ┌──────────────────┐
//! │    OrderQueue     │◄──────────────────────│ Fulfillment      │
//! │  (Redis Stream)   │                       │ Worker           │
//! └───────────────────┘                       └────────┬─────────┘
//!                             per-buyer FlashLock      │
//!                             transactional persist    ▼
//!                                             ┌──────────────────┐
//!                                             │   PostgreSQL     │
//!                                             │ orders + stock   │
//!                                             └──────────────────┘
//! ```
//!
//! # Key properties
//!
//! - **Exact admission**: the Lua script runs as one indivisible unit, so
//!   for stock = N exactly N buyers are admitted regardless of concurrency.
//! - **One order per buyer**: best-effort guard in the script, enforced
//!   authoritatively inside the persistence transaction.
//! - **Crash safety**: queue entries are acknowledged only after the
//!   database commit; a crashed worker's in-flight entries are replayed by
//!   the recovery sweep, and redelivery is idempotent.
//!
//! The surrounding catalog/social CRUD application (HTTP routing, entity
//! persistence, sessions) is an external collaborator and lives elsewhere.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod id_generator;
pub mod lock;
pub mod orders;
pub mod queue;
pub mod types;
pub mod worker;

pub use admission::{Admission, SeckillService};
pub use cache::CacheClient;
pub use catalog::VoucherCatalog;
pub use config::Config;
pub use error::{FlashSaleError, Result};
pub use id_generator::OrderIdGenerator;
pub use lock::FlashLock;
pub use orders::{OrderRepository, PersistOutcome, PgOrderRepository};
pub use queue::OrderQueue;
pub use types::{AdmissionOutcome, AdmittedOrder, BuyerId, OrderId, SeckillVoucher, VoucherId};
pub use worker::FulfillmentWorker;
