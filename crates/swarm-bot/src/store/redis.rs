//! Redis-backed coordination store.
//!
//! Locks are `SET NX PX` with a per-guard token; release and compare-and-set
//! go through small Lua scripts so they stay atomic on the server. Every
//! operation runs under the store operation timeout and fails closed.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::time::timeout;
use uuid::Uuid;

use super::{CoordStore, LockGuard, StoreError};

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then return 0 end
else
    if current then return 0 end
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

/// Redis `CoordStore`.
pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    release_script: Script,
    cas_script: Script,
}

impl RedisStore {
    /// Connect to the store at `url`.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn,
            op_timeout,
            release_script: Script::new(RELEASE_LOCK_SCRIPT),
            cas_script: Script::new(CAS_SCRIPT),
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        timeout(self.op_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl CoordStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.run(async move { conn.get(key).await }).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.run(async move { conn.set(key, value).await }).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.run(async move { conn.del(key).await }).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        self.run(async move { conn.incr(key, delta).await }).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expect: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let script = &self.cas_script;
        let has_expect = if expect.is_some() { "1" } else { "0" };
        let expect = expect.unwrap_or_default();
        let swapped: i64 = self
            .run(async move {
                script
                    .key(key)
                    .arg(has_expect)
                    .arg(expect)
                    .arg(value)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(swapped == 1)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        self.run(async move { conn.hgetall(key).await }).await
    }

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let items: Vec<(String, String)> = fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.run(async move { conn.hset_multiple(key, &items).await })
            .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.run(async move { conn.sadd(key, member).await }).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.run(async move { conn.srem(key, member).await }).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.run(async move { conn.smembers(key).await }).await
    }

    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<LockGuard, StoreError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis() as u64;
        let token_arg = token.clone();
        let reply: Option<String> = self
            .run(async move {
                redis::cmd("SET")
                    .arg(name)
                    .arg(&token_arg)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        match reply {
            Some(_) => Ok(LockGuard::new(name.to_string(), token, ttl)),
            None => Err(StoreError::LockHeld(name.to_string())),
        }
    }

    async fn release_lock(&self, guard: LockGuard) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let script = &self.release_script;
        let name = guard.name.clone();
        let token = guard.token.clone();
        let deleted: i64 = self
            .run(async move {
                script
                    .key(&name)
                    .arg(&token)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        if deleted == 1 {
            Ok(())
        } else {
            Err(StoreError::LockLost(guard.name))
        }
    }
}
