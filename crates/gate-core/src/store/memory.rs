//! In-memory store backend.
//!
//! Implements the full [`Store`] contract including TTL expiry and glob
//! pattern scans. Backs the test suites and single-instance deployments that
//! have no external store; semantics mirror the Redis backend so code paths
//! exercised against one behave the same against the other.

use super::{Store, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local store with Redis-equivalent semantics.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a live entry, removing it when expired.
    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    fn parse_counter(value: Option<&str>) -> Result<i64, StoreError> {
        match value {
            None => Ok(0),
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| StoreError::Protocol(format!("not an integer: {raw}"))),
        }
    }

    /// Number of live keys. Test helper.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.is_expired(now));
        entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forces a key to expire immediately. Test helper.
    pub fn force_expire(&self, key: &str) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.expires_at = Some(Instant::now());
        }
    }
}

/// Glob match supporting `*` only, the subset the gateway's patterns use.
fn glob_match(pattern: &str, key: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(stripped) => rest = stripped,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
        };
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock();
        let current = Self::live_value(&mut entries, key);
        let next = Self::parse_counter(current.as_deref())? + delta;
        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(key.to_string(), Entry { value: next.to_string(), expires_at });
        Ok(next)
    }

    async fn incr_by_with_ttl(
        &self,
        key: &str,
        delta: i64,
        ttl_secs: u64,
    ) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock();
        let current = Self::live_value(&mut entries, key);
        let next = Self::parse_counter(current.as_deref())? + delta;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(next)
    }

    async fn decr_by_if_exists(
        &self,
        key: &str,
        delta: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut entries = self.entries.lock();
        let Some(current) = Self::live_value(&mut entries, key) else {
            return Ok(None);
        };
        let next = Self::parse_counter(Some(&current))? - delta;
        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(key.to_string(), Entry { value: next.to_string(), expires_at });
        Ok(Some(next))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + Duration::from_secs(ttl_secs));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key).is_some())
    }

    async fn scan_match(&self, pattern: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.is_expired(now));
        let mut found: Vec<String> = entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .take(limit)
            .cloned()
            .collect();
        found.sort();
        Ok(found)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let mut entries = self.entries.lock();
        Ok(keys.iter().map(|key| Self::live_value(&mut entries, key)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", 60).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry_removes_value() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", 60).await.unwrap();
        store.force_expire("k");
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_incr_creates_and_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("c", 1).await.unwrap(), 1);
        assert_eq!(store.incr_by("c", 5).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_incr_with_ttl_refreshes_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by_with_ttl("c", 1, 60).await.unwrap(), 1);
        assert_eq!(store.incr_by_with_ttl("c", 1, 60).await.unwrap(), 2);
        store.force_expire("c");
        assert_eq!(store.incr_by_with_ttl("c", 1, 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let store = MemoryStore::new();
        store.set_ex("k", "hello", 60).await.unwrap();
        assert!(store.incr_by("k", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_decr_if_exists_noop_when_absent() {
        let store = MemoryStore::new();
        assert_eq!(store.decr_by_if_exists("r", 1).await.unwrap(), None);
        assert!(!store.exists("r").await.unwrap());

        store.set_ex("r", "10", 60).await.unwrap();
        assert_eq!(store.decr_by_if_exists("r", 3).await.unwrap(), Some(7));
        assert_eq!(store.decr_by_if_exists("r", 10).await.unwrap(), Some(-3));
    }

    #[tokio::test]
    async fn test_expire_only_touches_live_keys() {
        let store = MemoryStore::new();
        assert!(!store.expire("k", 60).await.unwrap());
        store.set_ex("k", "v", 60).await.unwrap();
        assert!(store.expire("k", 120).await.unwrap());
    }

    #[tokio::test]
    async fn test_del_is_idempotent() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", 60).await.unwrap();
        store.del("k").await.unwrap();
        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_match_filters_and_limits() {
        let store = MemoryStore::new();
        store.set_ex("active_session:U1:P1", "{}", 60).await.unwrap();
        store.set_ex("active_session:U1:P2", "{}", 60).await.unwrap();
        store.set_ex("active_session:U2:P1", "{}", 60).await.unwrap();
        store.set_ex("token_map:T1", "{}", 60).await.unwrap();

        let all = store.scan_match("active_session:*", 100).await.unwrap();
        assert_eq!(all.len(), 3);

        let user1 = store.scan_match("active_session:U1:*", 100).await.unwrap();
        assert_eq!(user1, vec!["active_session:U1:P1", "active_session:U1:P2"]);

        let limited = store.scan_match("active_session:*", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_scan_skips_expired() {
        let store = MemoryStore::new();
        store.set_ex("enforce:ip:1.1.1.1", "{}", 60).await.unwrap();
        store.set_ex("enforce:ip:2.2.2.2", "{}", 60).await.unwrap();
        store.force_expire("enforce:ip:1.1.1.1");

        let found = store.scan_match("enforce:*", 100).await.unwrap();
        assert_eq!(found, vec!["enforce:ip:2.2.2.2"]);
    }

    #[tokio::test]
    async fn test_mget_preserves_order() {
        let store = MemoryStore::new();
        store.set_ex("a", "1", 60).await.unwrap();
        store.set_ex("c", "3", 60).await.unwrap();

        let values = store
            .mget(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None, Some("3".to_string())]);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("active_session:*", "active_session:U1:P1"));
        assert!(glob_match("active_session:U1:*", "active_session:U1:P1"));
        assert!(!glob_match("active_session:U1:*", "active_session:U2:P1"));
        assert!(glob_match("quota:req:*", "quota:req:ip:1.2.3.4:daily:2025-03-09"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exact:more"));
        assert!(glob_match("*:suffix", "anything:suffix"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
    }
}
