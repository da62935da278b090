//! Shared key/value store access.
//!
//! The gateway keeps all cross-instance state (token mappings, quota
//! counters, enforcement directives, active sessions) in a Redis-compatible
//! store. [`Store`] is the seam: [`RedisStore`] is the production backend,
//! [`MemoryStore`] backs tests and single-instance deployments with the same
//! TTL semantics.
//!
//! Every operation carries a short deadline. Request-path callers treat any
//! [`StoreError`] as "no data" — a store outage degrades enforcement, it
//! never takes the gateway down with it.

pub mod keys;
mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Deadline for a single store operation.
pub const STORE_OP_TIMEOUT: Duration = Duration::from_secs(1);

/// Store operation failure. Always treated as transient by callers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// Connection could not be established or was lost.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// The operation exceeded [`STORE_OP_TIMEOUT`].
    #[error("store operation timed out")]
    Timeout,

    /// The store replied with something unexpected.
    #[error("store protocol error: {0}")]
    Protocol(String),
}

impl From<StoreError> for crate::errors::GateError {
    fn from(err: StoreError) -> Self {
        Self::StoreTransient(err.to_string())
    }
}

/// Typed operations over the shared store.
///
/// Key shapes come exclusively from [`keys`]; implementations never interpret
/// key contents. Pipelined batches submit commands in order but are not
/// transactions — callers tolerate interleaving between batches.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads a string value. `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a string value with a TTL in seconds.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Atomically adds `delta` and returns the new value, creating the key at
    /// zero first when absent.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Pipelined `INCRBY` + `EXPIRE`: adds `delta` and refreshes the TTL in
    /// one round trip. Returns the new value.
    async fn incr_by_with_ttl(
        &self,
        key: &str,
        delta: i64,
        ttl_secs: u64,
    ) -> Result<i64, StoreError>;

    /// Subtracts `delta` only when the key already exists, so missing keys
    /// are a harmless no-op and never materialize. Returns the new value, or
    /// `None` when the key was absent.
    ///
    /// The existence check and the decrement are not atomic; a key expiring
    /// between them produces one spurious key with the remaining-mirror TTL,
    /// which the next sync overwrites.
    async fn decr_by_if_exists(&self, key: &str, delta: i64)
        -> Result<Option<i64>, StoreError>;

    /// Sets a TTL on an existing key. Returns `false` when the key is absent.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError>;

    /// Deletes a key. Deleting an absent key succeeds.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Returns `true` when the key exists and has not expired.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Cursor-scans keys matching a glob pattern, stopping after `limit`
    /// matches. The snapshot is not point-in-time; keys created or expired
    /// mid-scan may or may not appear.
    async fn scan_match(&self, pattern: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Pipelined multi-get preserving input order.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;
}
