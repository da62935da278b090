//! Redis-backed store.
//!
//! Built on the redis crate's multiplexed [`ConnectionManager`], which owns
//! reconnection and applies AUTH/SELECT from the connection URL on fresh
//! connections only. Every operation is wrapped in [`STORE_OP_TIMEOUT`].

use super::{Store, StoreError, STORE_OP_TIMEOUT};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::future::Future;

/// Production store client over a shared multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connects to the store. Fails fast so a bad address or rejected AUTH is
    /// caught at bootstrap, not on the first request.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the URL is invalid or the first
    /// connect fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|err| StoreError::Connection(format!("client open: {err}")))?;
        let manager = tokio::time::timeout(STORE_OP_TIMEOUT * 5, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|err| StoreError::Connection(format!("connect: {err}")))?;
        Ok(Self { manager })
    }

    async fn with_deadline<T, F>(fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(STORE_OP_TIMEOUT, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|err| {
                if err.is_connection_refusal() || err.is_connection_dropped() {
                    StoreError::Connection(err.to_string())
                } else {
                    StoreError::Protocol(err.to_string())
                }
            })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        Self::with_deadline(async move { conn.get(key).await }).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        Self::with_deadline(async move { conn.set_ex::<_, _, ()>(key, value, ttl_secs).await })
            .await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        Self::with_deadline(async move { conn.incr(key, delta).await }).await
    }

    async fn incr_by_with_ttl(
        &self,
        key: &str,
        delta: i64,
        ttl_secs: u64,
    ) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        let (value,): (i64,) = Self::with_deadline(async move {
            redis::pipe()
                .cmd("INCRBY")
                .arg(key)
                .arg(delta)
                .cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs)
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await?;
        Ok(value)
    }

    async fn decr_by_if_exists(
        &self,
        key: &str,
        delta: i64,
    ) -> Result<Option<i64>, StoreError> {
        if !self.exists(key).await? {
            return Ok(None);
        }
        let mut conn = self.manager.clone();
        let value = Self::with_deadline(async move { conn.decr(key, delta).await }).await?;
        Ok(Some(value))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        Self::with_deadline(async move { conn.expire(key, ttl_secs as i64).await }).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        Self::with_deadline(async move { conn.del::<_, ()>(key).await }).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        Self::with_deadline(async move { conn.exists(key).await }).await
    }

    async fn scan_match(&self, pattern: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        let pattern = pattern.to_string();
        Self::with_deadline(async move {
            let mut cursor: u64 = 0;
            let mut found = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await?;
                found.extend(batch);
                cursor = next;
                if cursor == 0 || found.len() >= limit {
                    break;
                }
            }
            found.truncate(limit);
            Ok(found)
        })
        .await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let keys = keys.to_vec();
        Self::with_deadline(async move {
            let mut pipe = redis::pipe();
            for key in &keys {
                pipe.cmd("GET").arg(key);
            }
            pipe.query_async(&mut conn).await
        })
        .await
    }
}
