//! Log-phase bookkeeping.
//!
//! Runs after the response has been sent, off the client's latency path:
//! telemetry append, active-session refresh, quota counter increments and
//! remaining-mirror decrements. Nothing here can fail a request; store
//! errors are logged and dropped.

use crate::{
    request::RequestContext,
    session::SessionTracker,
    store::{keys, Store},
    telemetry::{AccessLogEntry, TelemetryBuffer},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::error;

/// Facts about a finished request, measured by the transport layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOutcome {
    pub status: u16,
    pub bytes_sent: u64,
    pub request_time_ms: u64,
    pub upstream_time_ms: u64,
}

/// The log-phase recorder.
#[derive(Clone)]
pub struct LogPhaseRecorder {
    store: Arc<dyn Store>,
    telemetry: Arc<TelemetryBuffer>,
    sessions: SessionTracker,
}

impl LogPhaseRecorder {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, telemetry: Arc<TelemetryBuffer>) -> Self {
        let sessions = SessionTracker::new(store.clone());
        Self { store, telemetry, sessions }
    }

    /// Records one finished request.
    pub async fn record(&self, ctx: &RequestContext, outcome: RequestOutcome) {
        let fp = &ctx.fingerprint;

        self.telemetry.push_access(AccessLogEntry {
            timestamp: Utc::now(),
            client_ip: fp.client_ip.clone(),
            uri: fp.uri.clone(),
            method: fp.method.clone(),
            status: outcome.status,
            bytes_sent: outcome.bytes_sent,
            request_time_ms: outcome.request_time_ms,
            upstream_time_ms: outcome.upstream_time_ms,
            client_name: fp.client_name.clone(),
            client_version: fp.client_version.clone(),
            device_id: fp.device_id.clone(),
            device_name: fp.device_name.clone(),
            user_id: fp.user_id.clone(),
            play_session_id: fp.play_session_id.clone(),
            user_agent: ctx.user_agent.clone(),
        });

        if let (Some(user_id), Some(psid)) = (fp.user_id.as_deref(), fp.play_session_id.as_deref())
        {
            if let Err(err) = self.sessions.refresh(user_id, psid, fp, outcome.bytes_sent).await {
                error!(error = %err, "session refresh failed");
            }
        }

        self.bump_quota_counters(ctx, &outcome).await;
        self.decrement_remaining(ctx, &outcome).await;
    }

    /// Dimension/value pairs this request is accounted against.
    fn dimensions(ctx: &RequestContext) -> Vec<(keys::Dimension, String)> {
        let fp = &ctx.fingerprint;
        let mut dims = vec![(keys::Dimension::Ip, fp.client_ip.clone())];
        if let Some(user_id) = &fp.user_id {
            dims.push((keys::Dimension::User, user_id.clone()));
        }
        if let Some(device_id) = &fp.device_id {
            dims.push((keys::Dimension::Device, device_id.clone()));
        }
        dims
    }

    async fn bump_quota_counters(&self, ctx: &RequestContext, outcome: &RequestOutcome) {
        let now = Utc::now();
        for (dimension, value) in Self::dimensions(ctx) {
            for period in keys::COUNTER_PERIODS {
                let period_key = period.key_for(now);
                let ttl = period.counter_ttl_secs();

                let req_key = keys::quota(keys::QuotaKind::Req, dimension, &value, period, &period_key);
                if let Err(err) = self.store.incr_by_with_ttl(&req_key, 1, ttl).await {
                    error!(key = %req_key, error = %err, "quota counter increment failed");
                }

                if outcome.bytes_sent > 0 {
                    let bw_key =
                        keys::quota(keys::QuotaKind::Bw, dimension, &value, period, &period_key);
                    if let Err(err) = self
                        .store
                        .incr_by_with_ttl(&bw_key, outcome.bytes_sent as i64, ttl)
                        .await
                    {
                        error!(key = %bw_key, error = %err, "bandwidth counter increment failed");
                    }
                }
            }
        }
    }

    async fn decrement_remaining(&self, ctx: &RequestContext, outcome: &RequestOutcome) {
        for (dimension, value) in Self::dimensions(ctx) {
            for period in keys::MIRROR_PERIODS {
                let req_key = keys::remain(keys::QuotaKind::Req, dimension, &value, period);
                if let Err(err) = self.store.decr_by_if_exists(&req_key, 1).await {
                    error!(key = %req_key, error = %err, "remaining mirror decrement failed");
                }

                if outcome.bytes_sent > 0 {
                    let bw_key = keys::remain(keys::QuotaKind::Bw, dimension, &value, period);
                    if let Err(err) = self
                        .store
                        .decr_by_if_exists(&bw_key, outcome.bytes_sent as i64)
                        .await
                    {
                        error!(key = %bw_key, error = %err, "remaining mirror decrement failed");
                    }
                }
            }
        }
    }
}
