//! In-process coordination store.
//!
//! Implements the full `CoordStore` contract, including lock TTLs and
//! compare-and-set, against process-local state. Used for single-process
//! runs and as the simulated store in tests.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{CoordStore, LockGuard, StoreError};

#[derive(Debug, Default)]
struct MemoryInner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    locks: HashMap<String, LockEntry>,
}

#[derive(Debug)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

/// In-memory `CoordStore`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.lock().strings.insert(key.into(), value.into());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock();
        let current: i64 = match inner.strings.get(key) {
            Some(v) => v.parse().map_err(|_| StoreError::Malformed {
                key: key.into(),
                detail: "not an integer".into(),
            })?,
            None => 0,
        };
        let next = current + delta;
        inner.strings.insert(key.into(), next.to_string());
        Ok(next)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expect: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let current = inner.strings.get(key).map(|s| s.as_str());
        if current != expect {
            return Ok(false);
        }
        inner.strings.insert(key.into(), value.into());
        Ok(true)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.inner.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .hashes
            .entry(key.into())
            .or_default()
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .sets
            .entry(key.into())
            .or_default()
            .insert(member.into());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(set) = self.inner.lock().sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<LockGuard, StoreError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(entry) = inner.locks.get(name) {
            if entry.expires_at > now {
                return Err(StoreError::LockHeld(name.into()));
            }
        }
        let token = Uuid::new_v4().to_string();
        inner.locks.insert(
            name.into(),
            LockEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(LockGuard::new(name.into(), token, ttl))
    }

    async fn release_lock(&self, guard: LockGuard) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        match inner.locks.get(&guard.name) {
            Some(entry) if entry.token == guard.token => {
                inner.locks.remove(&guard.name);
                Ok(())
            }
            _ => Err(StoreError::LockLost(guard.name.clone())),
        }
    }
}
