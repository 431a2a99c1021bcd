//! Redis-based distributed mutual-exclusion lock.
//!
//! # Architecture
//!
//! A lock is one Redis key:
//! - **Key**: `lock:{resource}` → holder token
//! - **Acquire**: `SET key token NX EX ttl` — succeeds only if absent
//! - **Release**: Lua compare-and-delete — deletes only if the stored
//!   token still equals the caller's
//!
//! `try_lock` never blocks: contention is an immediate `None`, and callers
//! bring their own retry/backoff policy. The TTL is a safety valve against
//! holder crash, not a correctness mechanism; critical sections must
//! complete well within it.
//!
//! # Example
//!
//! ```no_run
//! use flashsale::lock::FlashLock;
//! use std::time::Duration;
//!
//! # async fn example(lock: FlashLock) -> flashsale::error::Result<()> {
//! if let Some(token) = lock.try_lock("order:42", Duration::from_secs(10)).await? {
//!     // ... critical section ...
//!     lock.unlock("order:42", &token).await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{FlashSaleError, Result};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Compare-and-delete release. Unconditional DEL would let a caller whose
/// lock expired delete the key a new holder legitimately owns.
const UNLOCK_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
";

/// Proof of lock ownership returned by a successful acquisition.
///
/// The token value is `{generation}-{sequence}`: a per-handle uuid plus an
/// atomic counter, so no two acquisitions ever share a token, across calls,
/// tasks, or process restarts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    /// The raw token value stored under the lock key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Distributed lock over a shared Redis instance.
#[derive(Clone)]
pub struct FlashLock {
    /// Connection manager for connection pooling.
    conn: ConnectionManager,
    /// Generation uuid minted when this handle was constructed.
    generation: Arc<str>,
    /// Per-handle acquisition counter.
    seq: Arc<AtomicU64>,
}

impl FlashLock {
    /// Create a new lock handle over an existing connection manager.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            generation: Uuid::new_v4().simple().to_string().into(),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get the Redis key for a lock resource.
    fn lock_key(resource: &str) -> String {
        format!("lock:{resource}")
    }

    /// Mint the next holder token.
    fn next_token(&self) -> LockToken {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        LockToken(format!("{}-{seq}", self.generation))
    }

    /// Try to acquire exclusive ownership of `resource` for at most `ttl`.
    ///
    /// Returns `Ok(None)` immediately if the lock is already held; never
    /// blocks or waits.
    ///
    /// # Errors
    ///
    /// Returns error if the Redis command fails.
    pub async fn try_lock(&self, resource: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let mut conn = self.conn.clone();
        let key = Self::lock_key(resource);
        let token = self.next_token();

        let acquired: bool = redis::cmd("SET")
            .arg(&key)
            .arg(token.as_str())
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| FlashSaleError::Redis(format!("failed to acquire lock {key}: {e}")))?;

        if acquired {
            tracing::debug!(resource = %resource, token = %token.as_str(), "acquired lock");
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    /// Release `resource` if and only if it is still held with `token`.
    ///
    /// Returns `Ok(false)` when the token no longer matches or the key has
    /// expired: someone else now legitimately owns the lock, and that is
    /// benign, not an error.
    ///
    /// # Errors
    ///
    /// Returns error if the Redis script invocation fails.
    pub async fn unlock(&self, resource: &str, token: &LockToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = Self::lock_key(resource);

        let script = redis::Script::new(UNLOCK_SCRIPT);
        let deleted: i64 = script
            .key(&key)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| FlashSaleError::Redis(format!("failed to release lock {key}: {e}")))?;

        if deleted == 0 {
            tracing::debug!(
                resource = %resource,
                token = %token.as_str(),
                "lock token mismatch on release, lock left intact"
            );
        }
        Ok(deleted == 1)
    }
}
