//! Bounded in-memory telemetry buffers.
//!
//! The request path only ever appends; the agent's flush loop drains in
//! FIFO batches. Both buffers are lossy by design: entries older than
//! [`ENTRY_TTL`] or beyond capacity are discarded and counted, never
//! retried. A gateway that cannot reach the control plane keeps serving and
//! sheds telemetry first.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Maximum age an entry may wait in the buffer before it is dropped.
pub const ENTRY_TTL: Duration = Duration::from_secs(300);

/// Capacity of each buffer; overflow evicts the oldest entry.
const BUFFER_CAPACITY: usize = 10_000;

/// One served request, as reported to the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub uri: String,
    pub method: String,
    pub status: u16,
    pub bytes_sent: u64,
    pub request_time_ms: u64,
    pub upstream_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// One denied request, as reported to the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedLogEntry {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub uri: String,
    pub method: String,
    /// Machine-readable denial reason (`uri_blocked`, `rate_limit_rps`, ...).
    pub reason: String,
    /// Rule pattern, directive reason or similar context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

struct Timestamped<T> {
    entered_at: Instant,
    entry: T,
}

struct Queue<T> {
    entries: Mutex<VecDeque<Timestamped<T>>>,
    lost: AtomicU64,
}

impl<T> Queue<T> {
    fn new() -> Self {
        Self { entries: Mutex::new(VecDeque::new()), lost: AtomicU64::new(0) }
    }

    fn push(&self, entry: T) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let mut dropped = 0u64;
        while entries.front().is_some_and(|e| now.duration_since(e.entered_at) >= ENTRY_TTL) {
            entries.pop_front();
            dropped += 1;
        }
        if entries.len() >= BUFFER_CAPACITY {
            entries.pop_front();
            dropped += 1;
        }
        entries.push_back(Timestamped { entered_at: now, entry });
        if dropped > 0 {
            self.lost.fetch_add(dropped, Ordering::Relaxed);
        }
    }

    fn drain(&self, max: usize) -> Vec<T> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let mut expired = 0u64;
        while entries.front().is_some_and(|e| now.duration_since(e.entered_at) >= ENTRY_TTL) {
            entries.pop_front();
            expired += 1;
        }
        if expired > 0 {
            self.lost.fetch_add(expired, Ordering::Relaxed);
        }
        let take = max.min(entries.len());
        entries.drain(..take).map(|e| e.entry).collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// The gateway's two telemetry queues.
pub struct TelemetryBuffer {
    access: Queue<AccessLogEntry>,
    blocked: Queue<BlockedLogEntry>,
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self { access: Queue::new(), blocked: Queue::new() }
    }

    pub fn push_access(&self, entry: AccessLogEntry) {
        self.access.push(entry);
    }

    pub fn push_blocked(&self, entry: BlockedLogEntry) {
        self.blocked.push(entry);
    }

    /// Removes and returns up to `max` access entries, oldest first.
    #[must_use]
    pub fn drain_access(&self, max: usize) -> Vec<AccessLogEntry> {
        self.access.drain(max)
    }

    /// Removes and returns up to `max` blocked entries, oldest first.
    #[must_use]
    pub fn drain_blocked(&self, max: usize) -> Vec<BlockedLogEntry> {
        self.blocked.drain(max)
    }

    #[must_use]
    pub fn access_len(&self) -> usize {
        self.access.len()
    }

    #[must_use]
    pub fn blocked_len(&self) -> usize {
        self.blocked.len()
    }

    /// Entries discarded so far (age or capacity), across both queues.
    #[must_use]
    pub fn lost_count(&self) -> u64 {
        self.access.lost.load(Ordering::Relaxed) + self.blocked.lost.load(Ordering::Relaxed)
    }

    /// Counts entries dropped because a flush failed after draining.
    pub fn count_flush_loss(&self, n: u64) {
        self.access.lost.fetch_add(n, Ordering::Relaxed);
    }
}
