//! Cache-aside layer with penetration and stampede mitigation.
//!
//! # Architecture
//!
//! Two read strategies, selected per use case:
//!
//! - [`CacheClient::get_or_load`] — penetration-resistant read-through. A
//!   backing-store miss writes a short-lived **tombstone** (cached empty
//!   string) so repeated lookups for a nonexistent key stop reaching the
//!   backing store. Positive entries get a jittered TTL so a batch of keys
//!   written together does not expire together.
//!
//! - [`CacheClient::get_with_logical_expiry`] — for hot keys that must
//!   never block a caller on a slow rebuild. Entries carry an embedded
//!   logical expiry and never physically expire; a stale read returns the
//!   stale value immediately and races for the rebuild lock, the single
//!   winner rebuilding on a background task. Requires the cache to be
//!   warmed: a true miss means the data does not exist.
//!
//! Wire format is JSON; logical-expiry entries use the envelope
//! `{"data": <value>, "expireTime": <timestamp>}`.

use crate::error::{FlashSaleError, Result};
use crate::lock::FlashLock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

/// TTL for the per-key rebuild lock. Rebuilds are a single backing-store
/// read plus one SET; well under this.
const REBUILD_LOCK_TTL: Duration = Duration::from_secs(10);

/// JSON envelope for logical-expiry entries.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct LogicalEnvelope<T> {
    data: T,
    #[serde(rename = "expireTime")]
    expire_time: DateTime<Utc>,
}

/// Read-through cache over a shared Redis instance.
#[derive(Clone)]
pub struct CacheClient {
    /// Connection manager for connection pooling.
    conn: ConnectionManager,
    /// Lock gating logical-expiry rebuilds, one winner per key.
    lock: FlashLock,
}

impl CacheClient {
    /// Create a new cache client over an existing connection manager.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        let lock = FlashLock::new(conn.clone());
        Self { conn, lock }
    }

    /// Apply ±10% jitter to a TTL so co-written entries expire spread out.
    fn jittered_secs(ttl: Duration) -> u64 {
        let base = ttl.as_secs().max(1);
        let spread = (base / 10).max(1);
        let low = base.saturating_sub(spread);
        rand::thread_rng().gen_range(low..=base + spread).max(1)
    }

    /// Store a positive entry as JSON with a jittered TTL.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the Redis write fails.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(value)
            .map_err(|e| FlashSaleError::Serialization(format!("failed to encode {key}: {e}")))?;

        let _: () = conn
            .set_ex(key, json, Self::jittered_secs(ttl))
            .await
            .map_err(|e| FlashSaleError::Redis(format!("failed to write {key}: {e}")))?;
        Ok(())
    }

    /// Store an entry with an embedded logical expiry and no physical TTL.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the Redis write fails.
    pub async fn set_with_logical_expiry<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let envelope = LogicalEnvelope {
            data: value,
            expire_time: Utc::now()
                + ChronoDuration::seconds(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
        };
        let json = serde_json::to_string(&envelope)
            .map_err(|e| FlashSaleError::Serialization(format!("failed to encode {key}: {e}")))?;

        let _: () = conn
            .set(key, json)
            .await
            .map_err(|e| FlashSaleError::Redis(format!("failed to write {key}: {e}")))?;
        Ok(())
    }

    /// Penetration-resistant read-through.
    ///
    /// On cache hit, deserialize and return. On tombstone hit, return
    /// `Ok(None)` without calling `fallback`. On miss, call `fallback`:
    /// `Some` is cached with a jittered `ttl`, `None` is recorded as a
    /// tombstone with `null_ttl` before returning.
    ///
    /// # Errors
    ///
    /// Returns error if Redis fails, a cached value cannot be decoded, or
    /// the fallback itself fails.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        null_ttl: Duration,
        fallback: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let mut conn = self.conn.clone();
        let cached: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| FlashSaleError::Redis(format!("failed to read {key}: {e}")))?;

        match cached {
            Some(json) if json.is_empty() => {
                // Tombstone: confirmed absent, don't touch the backing store.
                tracing::debug!(key = %key, "tombstone hit");
                Ok(None)
            }
            Some(json) => {
                let value = serde_json::from_str(&json).map_err(|e| {
                    FlashSaleError::Serialization(format!("failed to decode {key}: {e}"))
                })?;
                Ok(Some(value))
            }
            None => match fallback().await? {
                Some(value) => {
                    self.set_json(key, &value, ttl).await?;
                    Ok(Some(value))
                }
                None => {
                    let _: () = conn
                        .set_ex(key, "", null_ttl.as_secs().max(1))
                        .await
                        .map_err(|e| {
                            FlashSaleError::Redis(format!("failed to write tombstone {key}: {e}"))
                        })?;
                    tracing::debug!(key = %key, "backing store miss, tombstone written");
                    Ok(None)
                }
            },
        }
    }

    /// Logical-expiry read-through for pre-warmed hot keys.
    ///
    /// A fresh entry is returned directly. A stale entry is returned
    /// immediately as well, while the single winner of the rebuild lock
    /// (`lock:{rebuild_resource}`) refreshes the entry on a spawned task;
    /// every other concurrent reader keeps getting the stale value and is
    /// never blocked. A true miss returns `Ok(None)`: logical-expiry keys
    /// are warmed up front, so absence means the data does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if Redis fails or a cached envelope cannot be decoded.
    /// Rebuild failures are logged on the background task, not surfaced,
    /// and the entry stays stale until a later reader wins the lock again.
    pub async fn get_with_logical_expiry<T, F, Fut>(
        &self,
        key: &str,
        rebuild_resource: &str,
        ttl: Duration,
        fallback: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send,
    {
        let mut conn = self.conn.clone();
        let cached: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| FlashSaleError::Redis(format!("failed to read {key}: {e}")))?;

        let Some(json) = cached else {
            return Ok(None);
        };
        let envelope: LogicalEnvelope<T> = serde_json::from_str(&json)
            .map_err(|e| FlashSaleError::Serialization(format!("failed to decode {key}: {e}")))?;

        if envelope.expire_time > Utc::now() {
            return Ok(Some(envelope.data));
        }

        // Stale. Race for the rebuild lock; losers just serve stale data.
        if let Some(token) = self.lock.try_lock(rebuild_resource, REBUILD_LOCK_TTL).await? {
            // Another winner may have finished between our read and the
            // lock; re-check before spending a backing-store round trip.
            let fresh: Option<String> = conn
                .get(key)
                .await
                .map_err(|e| FlashSaleError::Redis(format!("failed to re-read {key}: {e}")))?;
            if let Some(fresh_json) = fresh {
                match serde_json::from_str::<LogicalEnvelope<T>>(&fresh_json) {
                    Ok(fresh_envelope) if fresh_envelope.expire_time > Utc::now() => {
                        let _ = self.lock.unlock(rebuild_resource, &token).await;
                        return Ok(Some(fresh_envelope.data));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = self.lock.unlock(rebuild_resource, &token).await;
                        return Err(FlashSaleError::Serialization(format!(
                            "failed to decode {key}: {e}"
                        )));
                    }
                }
            }

            let cache = self.clone();
            let key = key.to_string();
            let resource = rebuild_resource.to_string();
            tokio::spawn(async move {
                match fallback().await {
                    Ok(Some(value)) => {
                        if let Err(e) = cache.set_with_logical_expiry(&key, &value, ttl).await {
                            tracing::warn!(key = %key, error = %e, "cache rebuild write failed");
                        } else {
                            tracing::debug!(key = %key, "cache entry rebuilt");
                        }
                    }
                    Ok(None) => {
                        tracing::warn!(key = %key, "cache rebuild found no backing row");
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "cache rebuild failed");
                    }
                }
                if let Err(e) = cache.lock.unlock(&resource, &token).await {
                    tracing::warn!(resource = %resource, error = %e, "rebuild lock release failed");
                }
            });
        }

        Ok(Some(envelope.data))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..1000 {
            let secs = CacheClient::jittered_secs(Duration::from_secs(600));
            assert!((540..=660).contains(&secs), "jittered to {secs}");
        }
    }

    #[test]
    fn jitter_handles_tiny_ttls() {
        for _ in 0..100 {
            let secs = CacheClient::jittered_secs(Duration::from_secs(1));
            assert!((1..=2).contains(&secs));
        }
    }

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    async fn client() -> CacheClient {
        let redis = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        CacheClient::new(ConnectionManager::new(redis).await.unwrap())
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn tombstone_suppresses_repeat_fallback_calls() {
        let cache = client().await;
        let key = format!("test:cache:{}", Uuid::new_v4());
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let result: Option<String> = cache
                .get_or_load(
                    &key,
                    Duration::from_secs(60),
                    Duration::from_secs(60),
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    },
                )
                .await
                .unwrap();
            assert!(result.is_none());
        }

        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "fallback must run once inside the tombstone window"
        );
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn positive_entries_serve_from_cache() {
        let cache = client().await;
        let key = format!("test:cache:{}", Uuid::new_v4());
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let result: Option<String> = cache
                .get_or_load(
                    &key,
                    Duration::from_secs(60),
                    Duration::from_secs(60),
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Some("hello".to_string()))
                    },
                )
                .await
                .unwrap();
            assert_eq!(result.as_deref(), Some("hello"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn stale_logical_entry_serves_stale_and_rebuilds_once() {
        let cache = client().await;
        let key = format!("test:cache:{}", Uuid::new_v4());
        let resource = format!("rebuild:{key}");

        // Warm with an already-expired envelope.
        let stale = LogicalEnvelope {
            data: "stale".to_string(),
            expire_time: Utc::now() - ChronoDuration::seconds(5),
        };
        let mut conn = cache.conn.clone();
        let _: () = conn
            .set(&key, serde_json::to_string(&stale).unwrap())
            .await
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_for_read = Arc::clone(&calls);
        let first: Option<String> = cache
            .get_with_logical_expiry(&key, &resource, Duration::from_secs(60), move || async move {
                calls_for_read.fetch_add(1, Ordering::SeqCst);
                Ok(Some("fresh".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("stale"), "stale value served immediately");

        // Let the background rebuild land.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let second: Option<String> = cache
            .get_with_logical_expiry(&key, &resource, Duration::from_secs(60), || async {
                Ok(Some("unused".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(second.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn logical_miss_means_absent() {
        let cache = client().await;
        let key = format!("test:cache:{}", Uuid::new_v4());

        let result: Option<String> = cache
            .get_with_logical_expiry(&key, "rebuild:none", Duration::from_secs(60), || async {
                Ok(Some("should not be called".to_string()))
            })
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
