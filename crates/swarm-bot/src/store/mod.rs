//! Persistent coordination store.
//!
//! Cross-restart and cross-process capital state lives behind `CoordStore`:
//! a key-value interface with compare-and-set, hashes, sets, and named locks
//! with TTL. `MemoryStore` backs single-process runs and tests; `RedisStore`
//! backs multi-process deployments.
//!
//! Loss of the store is never recovered locally: callers fail closed.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Errors from the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out")]
    Timeout,

    #[error("lock {0} is held by another owner")]
    LockHeld(String),

    /// The lock TTL expired while we believed we held it. Callers must
    /// treat this as a coordination fault.
    #[error("lock {0} was lost before release")]
    LockLost(String),

    #[error("malformed value at {key}: {detail}")]
    Malformed { key: String, detail: String },
}

/// Possession of a named lock. Must be returned via `release_lock`;
/// `is_expired` tells whether the TTL lapsed while held.
#[derive(Debug)]
pub struct LockGuard {
    pub name: String,
    pub(crate) token: String,
    acquired_at: Instant,
    ttl: Duration,
}

impl LockGuard {
    pub(crate) fn new(name: String, token: String, ttl: Duration) -> Self {
        Self {
            name,
            token,
            acquired_at: Instant::now(),
            ttl,
        }
    }

    /// Whether the TTL has lapsed since acquisition.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() > self.ttl
    }
}

/// Key-value coordination store.
///
/// Every implementation must provide atomic compare-and-set and named locks
/// with TTL; multi-key updates in callers are serialized through the locks.
#[async_trait]
pub trait CoordStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Atomic integer increment; missing keys start at zero.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Set `key` to `value` iff its current value equals `expect`
    /// (`None` = key absent). Returns whether the swap happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expect: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> Result<(), StoreError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Single acquisition attempt. `LockHeld` when another owner holds it.
    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<LockGuard, StoreError>;

    /// Release a held lock. `LockLost` when the TTL expired and someone
    /// else may have acquired it in between.
    async fn release_lock(&self, guard: LockGuard) -> Result<(), StoreError>;
}

/// Acquire a lock, polling until `deadline` elapses.
pub async fn acquire_lock_with_deadline(
    store: &dyn CoordStore,
    name: &str,
    ttl: Duration,
    deadline: Duration,
) -> Result<LockGuard, StoreError> {
    let started = Instant::now();
    loop {
        match store.acquire_lock(name, ttl).await {
            Ok(guard) => return Ok(guard),
            Err(StoreError::LockHeld(_)) if started.elapsed() < deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(StoreError::LockHeld(_)) => return Err(StoreError::Timeout),
            Err(e) => return Err(e),
        }
    }
}
