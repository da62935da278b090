//! Active playback session tracking.
//!
//! One record per `(user, play_session_id)` pair, kept alive by a sliding
//! 90-second TTL. Natural expiry is how a session ends; nothing deletes
//! these records explicitly. The admission check in the pipeline and the
//! session heartbeat loop both read through this module.

use crate::{
    identity::Fingerprint,
    store::{keys, Store, StoreError},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Stored `active_session:<user>:<psid>` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSession {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    pub client_ip: String,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub bytes_sent: u64,
}

impl ActiveSession {
    fn from_fingerprint(fp: &Fingerprint, now: DateTime<Utc>) -> Self {
        Self {
            device_id: fp.device_id.clone(),
            device_name: fp.device_name.clone(),
            client_name: fp.client_name.clone(),
            client_ip: fp.client_ip.clone(),
            started_at: now,
            last_seen: now,
            bytes_sent: 0,
        }
    }
}

/// A session record together with its owning user and play session id.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub user_id: String,
    pub play_session_id: String,
    #[serde(flatten)]
    pub session: ActiveSession,
}

/// Store-backed session operations.
#[derive(Clone)]
pub struct SessionTracker {
    store: Arc<dyn Store>,
}

impl SessionTracker {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns `true` when the pair already has a live record, i.e. the
    /// request is a continuation of an admitted session.
    pub async fn exists(&self, user_id: &str, play_session_id: &str) -> Result<bool, StoreError> {
        self.store.exists(&keys::active_session(user_id, play_session_id)).await
    }

    /// Counts live sessions for one user by pattern scan.
    pub async fn count_for_user(&self, user_id: &str) -> Result<usize, StoreError> {
        let found = self
            .store
            .scan_match(&keys::active_session_pattern(user_id), 256)
            .await?;
        Ok(found.len())
    }

    /// Writes a fresh session record with the sliding TTL.
    ///
    /// Two concurrent admitters of the same pair may both land here; both
    /// writes carry identical content shape and the TTL unifies, so the race
    /// is tolerated.
    pub async fn admit(
        &self,
        user_id: &str,
        play_session_id: &str,
        fp: &Fingerprint,
    ) -> Result<(), StoreError> {
        let record = ActiveSession::from_fingerprint(fp, Utc::now());
        self.write(user_id, play_session_id, &record).await
    }

    /// Refreshes a session after a response: bumps `last_seen`, accumulates
    /// bytes and resets the TTL. Recreates the record when it expired
    /// mid-stream.
    pub async fn refresh(
        &self,
        user_id: &str,
        play_session_id: &str,
        fp: &Fingerprint,
        bytes_sent: u64,
    ) -> Result<(), StoreError> {
        let key = keys::active_session(user_id, play_session_id);
        let now = Utc::now();
        let mut record = match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str::<ActiveSession>(&raw).unwrap_or_else(|err| {
                warn!(key = %key, error = %err, "undecodable session record, recreating");
                ActiveSession::from_fingerprint(fp, now)
            }),
            None => ActiveSession::from_fingerprint(fp, now),
        };
        record.last_seen = now;
        record.bytes_sent = record.bytes_sent.saturating_add(bytes_sent);
        self.write(user_id, play_session_id, &record).await
    }

    /// Reads every live session on this store, up to `limit`.
    pub async fn snapshot_all(&self, limit: usize) -> Result<Vec<SessionSnapshot>, StoreError> {
        let session_keys = self.store.scan_match(keys::ALL_SESSIONS_PATTERN, limit).await?;
        if session_keys.is_empty() {
            return Ok(Vec::new());
        }
        let values = self.store.mget(&session_keys).await?;

        let mut snapshots = Vec::with_capacity(session_keys.len());
        for (key, value) in session_keys.iter().zip(values) {
            let Some((user_id, play_session_id)) = keys::parse_session_key(key) else {
                continue;
            };
            let Some(raw) = value else {
                continue; // expired between scan and read
            };
            match serde_json::from_str::<ActiveSession>(&raw) {
                Ok(session) => {
                    snapshots.push(SessionSnapshot { user_id, play_session_id, session });
                }
                Err(err) => warn!(key = %key, error = %err, "undecodable session record"),
            }
        }
        Ok(snapshots)
    }

    /// Counts every live session on this store.
    pub async fn count_all(&self) -> Result<usize, StoreError> {
        let found = self.store.scan_match(keys::ALL_SESSIONS_PATTERN, 4096).await?;
        Ok(found.len())
    }

    async fn write(
        &self,
        user_id: &str,
        play_session_id: &str,
        record: &ActiveSession,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record)
            .map_err(|err| StoreError::Protocol(err.to_string()))?;
        self.store
            .set_ex(&keys::active_session(user_id, play_session_id), &raw, keys::SESSION_TTL_SECS)
            .await
    }
}
