//! Control-plane wire shapes.

use crate::{
    policy::{EnforcementDirective, GatePolicy, RateLimitConfig, RateLimitRule},
    store::keys::{Dimension, Period},
};
use serde::{Deserialize, Serialize};

/// The control plane wraps every response payload in `{"data": ...}`.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

/// `GET /config/version` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigVersionInfo {
    pub version: u64,
    #[serde(default)]
    pub has_update: bool,
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

/// `GET /config` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigPayload {
    pub version: u64,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default, rename = "lua_config")]
    pub policy: Option<GatePolicy>,
    #[serde(default)]
    pub rate_limit_config: Option<RateLimitConfig>,
}

/// `POST /ack` body.
#[derive(Debug, Clone, Serialize)]
pub struct AckRequest {
    pub snapshot_id: String,
    pub status: String,
}

/// `POST /heartbeat` body.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRequest {
    pub agent_version: String,
    pub current_config_version: u64,
    pub status: String,
    pub metadata: HeartbeatMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatMetadata {
    pub access_log_pending: usize,
    pub blocked_log_pending: usize,
    pub telemetry_lost: u64,
    pub active_sessions: usize,
}

/// `GET /rate-limits` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitsInfo {
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
    #[serde(default)]
    pub enforcements: Vec<EnforcementDirective>,
}

/// One uploaded counter pair: requests plus bandwidth for a dimension value
/// and period window. A missing bandwidth counterpart is reported as zero.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaCounter {
    pub dimension: Dimension,
    pub value: String,
    pub period: Period,
    pub period_key: String,
    pub requests: i64,
    pub bandwidth: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaSyncRequest {
    pub counters: Vec<QuotaCounter>,
}

/// Quota headroom computed centrally, mirrored into the store with a short
/// TTL. `None` on an axis means no quota is configured there.
#[derive(Debug, Clone, Deserialize)]
pub struct RemainingEntry {
    pub dimension: Dimension,
    pub value: String,
    pub period: Period,
    #[serde(default)]
    pub requests: Option<i64>,
    #[serde(default)]
    pub bandwidth: Option<i64>,
}

/// `POST /telemetry/quota-sync` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuotaSyncData {
    #[serde(default)]
    pub remaining: Vec<RemainingEntry>,
    #[serde(default)]
    pub enforcements: Vec<EnforcementDirective>,
}

/// Batch body for the access-log and blocked-request endpoints.
#[derive(Debug, Serialize)]
pub struct TelemetryBatch<T: Serialize> {
    pub entries: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_and_version_info() {
        let info: Envelope<ConfigVersionInfo> = serde_json::from_str(
            r#"{"data": {"version": 12, "has_update": true, "snapshot_id": "snap-1"}}"#,
        )
        .unwrap();
        assert_eq!(info.data.version, 12);
        assert!(info.data.has_update);
        assert_eq!(info.data.snapshot_id.as_deref(), Some("snap-1"));

        let minimal: Envelope<ConfigVersionInfo> =
            serde_json::from_str(r#"{"data": {"version": 3}}"#).unwrap();
        assert!(!minimal.data.has_update);
        assert!(minimal.data.snapshot_id.is_none());
    }

    #[test]
    fn test_config_payload_deserializes_lua_config() {
        let payload: ConfigPayload = serde_json::from_str(
            r#"{
                "version": 5,
                "service_type": "emby",
                "lua_config": {"max_streams": 3},
                "rate_limit_config": {"rules": [{"apply_to": "ip", "rate_per_second": 10}]}
            }"#,
        )
        .unwrap();
        assert_eq!(payload.version, 5);
        assert_eq!(payload.policy.unwrap().max_streams, 3);
        assert_eq!(payload.rate_limit_config.unwrap().rules.len(), 1);
    }

    #[test]
    fn test_config_payload_tolerates_absent_sections() {
        let payload: ConfigPayload = serde_json::from_str(r#"{"version": 5}"#).unwrap();
        assert!(payload.policy.is_none());
        assert!(payload.rate_limit_config.is_none());
        assert!(payload.service_type.is_none());
    }

    #[test]
    fn test_quota_sync_data_defaults() {
        let data: QuotaSyncData = serde_json::from_str("{}").unwrap();
        assert!(data.remaining.is_empty());
        assert!(data.enforcements.is_empty());

        let data: QuotaSyncData = serde_json::from_str(
            r#"{"remaining": [{"dimension": "user", "value": "U1", "period": "daily", "requests": 120}]}"#,
        )
        .unwrap();
        assert_eq!(data.remaining.len(), 1);
        assert_eq!(data.remaining[0].requests, Some(120));
        assert_eq!(data.remaining[0].bandwidth, None);
    }

    #[test]
    fn test_counter_serialization_shape() {
        let counter = QuotaCounter {
            dimension: Dimension::Ip,
            value: "1.2.3.4".to_string(),
            period: Period::Daily,
            period_key: "2025-03-09".to_string(),
            requests: 42,
            bandwidth: 1_000_000,
        };
        let json = serde_json::to_value(&counter).unwrap();
        assert_eq!(json["dimension"], "ip");
        assert_eq!(json["period"], "daily");
        assert_eq!(json["requests"], 42);
    }
}
