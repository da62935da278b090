//! Telemetry flush loop: drain buffered access and blocked logs plus queued
//! login reports, and upload them in bounded batches.

use super::Agent;
use crate::{capture::LoginEvent, errors::GateError, store::keys};
use tracing::{debug, warn};

/// Per-flush batch ceilings.
const ACCESS_BATCH: usize = 500;
const BLOCKED_BATCH: usize = 200;
const TOKEN_REPORT_BATCH: usize = 100;

impl Agent {
    /// One flush cycle. Drained entries that fail to upload are counted as
    /// lost; there is no retry queue.
    pub(crate) async fn telemetry_flush_tick(&self) -> Result<(), GateError> {
        let access = self.telemetry.drain_access(ACCESS_BATCH);
        if !access.is_empty() {
            let count = access.len();
            match self.control.push_access_logs(access).await {
                Ok(()) => debug!(count, "access logs flushed"),
                Err(err) => {
                    self.telemetry.count_flush_loss(count as u64);
                    warn!(count, error = %err, "access log flush failed, entries lost");
                }
            }
        }

        let blocked = self.telemetry.drain_blocked(BLOCKED_BATCH);
        if !blocked.is_empty() {
            let count = blocked.len();
            match self.control.push_blocked_logs(blocked).await {
                Ok(()) => debug!(count, "blocked logs flushed"),
                Err(err) => {
                    self.telemetry.count_flush_loss(count as u64);
                    warn!(count, error = %err, "blocked log flush failed, entries lost");
                }
            }
        }

        self.flush_token_reports().await
    }

    /// Drains queued login reports from the store and uploads each one.
    /// Records are deleted as they are read; a failed upload is logged as a
    /// lost event.
    async fn flush_token_reports(&self) -> Result<(), GateError> {
        let report_keys = self
            .store
            .scan_match(keys::ALL_TOKEN_REPORT_PATTERN, TOKEN_REPORT_BATCH)
            .await?;
        if report_keys.is_empty() {
            return Ok(());
        }

        let values = self.store.mget(&report_keys).await?;
        for (key, value) in report_keys.iter().zip(values) {
            if let Err(err) = self.store.del(key).await {
                warn!(key = %key, error = %err, "failed to dequeue login report");
            }
            let Some(raw) = value else {
                continue; // expired between scan and read
            };
            let event: LoginEvent = match serde_json::from_str(&raw) {
                Ok(event) => event,
                Err(err) => {
                    warn!(key = %key, error = %err, "undecodable login report, dropping");
                    continue;
                }
            };
            if let Err(err) = self.control.push_login_event(&event).await {
                warn!(
                    user_id = %event.emby_user_id,
                    error = %err,
                    "login event upload failed, event lost"
                );
            }
        }
        debug!(count = report_keys.len(), "login reports drained");
        Ok(())
    }
}
