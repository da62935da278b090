//! Quota sync loop: upload absolute counters, mirror the returned headroom,
//! and refresh rules plus enforcements out-of-band.

use super::Agent;
use crate::{
    control::types::{QuotaCounter, QuotaSyncRequest},
    errors::GateError,
    policy::{PolicySnapshot, RateLimitConfig},
    store::keys,
};
use tracing::{debug, warn};

/// Upper bound on counters uploaded per sync.
const COUNTER_SCAN_LIMIT: usize = 4096;

impl Agent {
    /// One sync cycle. Counters are absolute, so repeating a sync after a
    /// partial failure converges to the same central state.
    pub(crate) async fn quota_sync_tick(&self) -> Result<(), GateError> {
        let counters = self.collect_counters().await?;
        let count = counters.len();

        let data = self.control.quota_sync(&QuotaSyncRequest { counters }).await?;
        debug!(
            uploaded = count,
            remaining = data.remaining.len(),
            enforcements = data.enforcements.len(),
            "quota sync completed"
        );

        self.write_remaining_mirrors(&data.remaining).await;
        self.replace_enforcements(&data.enforcements).await;

        self.refresh_rate_limits().await;
        Ok(())
    }

    /// Scans request counters and pairs each with its bandwidth counterpart.
    /// A missing counterpart reads as zero; the scan-then-read window means a
    /// pair can be torn, which the absolute-counter upload tolerates.
    async fn collect_counters(&self) -> Result<Vec<QuotaCounter>, GateError> {
        let req_keys = self
            .store
            .scan_match(keys::ALL_QUOTA_REQ_PATTERN, COUNTER_SCAN_LIMIT)
            .await?;
        if req_keys.is_empty() {
            return Ok(Vec::new());
        }

        let bw_keys: Vec<String> = req_keys
            .iter()
            .map(|key| keys::bw_counterpart(key).unwrap_or_default())
            .collect();
        let req_values = self.store.mget(&req_keys).await?;
        let bw_values = self.store.mget(&bw_keys).await?;

        let mut counters = Vec::with_capacity(req_keys.len());
        for ((key, req_value), bw_value) in req_keys.iter().zip(req_values).zip(bw_values) {
            let Some(parts) = keys::parse_quota_key(key) else {
                warn!(key = %key, "unparseable quota key, skipping");
                continue;
            };
            counters.push(QuotaCounter {
                dimension: parts.dimension,
                value: parts.value,
                period: parts.period,
                period_key: parts.period_key,
                requests: parse_counter(req_value.as_deref()),
                bandwidth: parse_counter(bw_value.as_deref()),
            });
        }
        Ok(counters)
    }

    async fn write_remaining_mirrors(
        &self,
        remaining: &[crate::control::types::RemainingEntry],
    ) {
        for entry in remaining {
            let pairs: [(keys::QuotaKind, Option<i64>); 2] = [
                (keys::QuotaKind::Req, entry.requests),
                (keys::QuotaKind::Bw, entry.bandwidth),
            ];
            for (kind, value) in pairs {
                let Some(value) = value else {
                    continue;
                };
                let key = keys::remain(kind, entry.dimension, &entry.value, entry.period);
                if let Err(err) = self
                    .store
                    .set_ex(&key, &value.to_string(), keys::REMAIN_TTL_SECS)
                    .await
                {
                    tracing::error!(key = %key, error = %err, "failed to write remaining mirror");
                }
            }
        }
    }

    /// Out-of-band rules refresh via `GET /rate-limits`. Failures here are
    /// soft; the next config pull or sync catches up.
    async fn refresh_rate_limits(&self) {
        let info = match self.control.rate_limits().await {
            Ok(info) => info,
            Err(err) => {
                warn!(error = %err, "rate limits poll failed");
                return;
            }
        };

        self.replace_enforcements(&info.enforcements).await;

        // Rules live inside the snapshot; re-install it with the fresh list.
        if let Some(current) = self.config_cache.load() {
            self.config_cache.install(PolicySnapshot::new(
                current.version,
                current.service_type.clone(),
                current.policy.clone(),
                RateLimitConfig { rules: info.rules, enforcements: info.enforcements },
            ));
        }
    }
}

fn parse_counter(raw: Option<&str>) -> i64 {
    raw.and_then(|value| value.parse().ok()).unwrap_or(0)
}
