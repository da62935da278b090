//! Config pull loop: poll the version endpoint, fetch and apply on change,
//! acknowledge the applied snapshot.

use super::Agent;
use crate::{
    control::types::ConfigPayload,
    errors::GateError,
    policy::{GatePolicy, PolicySnapshot, RateLimitConfig},
};
use tracing::{debug, info, warn};

impl Agent {
    /// One pull cycle. A no-op when the control plane reports no update and
    /// its version does not exceed the installed one — no store writes, no
    /// ACK.
    pub(crate) async fn config_pull_tick(&self) -> Result<(), GateError> {
        let info = self.control.config_version().await?;
        let local_version = self.config_cache.version();

        if !info.has_update && info.version <= local_version {
            debug!(local_version, remote_version = info.version, "config up to date");
            return Ok(());
        }

        let payload = self.control.fetch_config().await?;
        let version = payload.version;
        self.apply_config(payload).await;
        info!(version, "config snapshot applied");

        if let Some(snapshot_id) = info.snapshot_id.as_deref() {
            if let Err(err) = self.control.ack(snapshot_id, "applied").await {
                warn!(snapshot_id, error = %err, "config ACK failed");
            }
        }
        Ok(())
    }

    /// Installs the payload as the new snapshot. Sections absent from the
    /// payload keep their currently installed values; the enforcement key
    /// set in the store is replaced to match the new directive list.
    pub(crate) async fn apply_config(&self, payload: ConfigPayload) {
        let prior = self.config_cache.load();

        let service_type = payload
            .service_type
            .or_else(|| prior.as_ref().map(|p| p.service_type.clone()))
            .unwrap_or_else(|| "emby".to_string());
        let policy = payload
            .policy
            .or_else(|| prior.as_ref().map(|p| p.policy.clone()))
            .unwrap_or_else(GatePolicy::default);
        let rate_limits = payload
            .rate_limit_config
            .or_else(|| prior.as_ref().map(|p| p.rate_limits.clone()))
            .unwrap_or_else(RateLimitConfig::default);

        self.replace_enforcements(&rate_limits.enforcements).await;
        self.config_cache
            .install(PolicySnapshot::new(payload.version, service_type, policy, rate_limits));
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::agent_with;
    use crate::policy::{EnforcementDirective, OverAction};
    use crate::store::keys::Dimension;
    use crate::store::Store;

    const CONFIG_BODY: &str = r#"{"data": {
        "version": 4,
        "service_type": "emby",
        "lua_config": {"max_streams": 2, "client_whitelist": ["Infuse"]},
        "rate_limit_config": {
            "rules": [{"apply_to": "ip", "rate_per_second": 10}],
            "enforcements": [{
                "dimension": "ip",
                "dimension_value": "192.0.2.1",
                "action": "reject",
                "reason": "abuse"
            }]
        }
    }}"#;

    #[tokio::test]
    async fn test_pull_applies_snapshot_and_acks() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/media-slave/config/version")
            .with_status(200)
            .with_body(r#"{"data": {"version": 4, "has_update": true, "snapshot_id": "s4"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/api/v1/media-slave/config")
            .with_status(200)
            .with_body(CONFIG_BODY)
            .create_async()
            .await;
        let ack = server
            .mock("POST", "/api/v1/media-slave/ack")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"snapshot_id": "s4", "status": "applied"}"#.to_string(),
            ))
            .with_status(200)
            .create_async()
            .await;

        let h = agent_with(&server, None);
        h.agent.config_pull_tick().await.unwrap();

        let snapshot = h.config_cache.load().expect("snapshot installed");
        assert_eq!(snapshot.version, 4);
        assert_eq!(snapshot.policy.max_streams, 2);
        assert_eq!(snapshot.rate_limits.rules.len(), 1);
        assert!(h.store.exists("enforce:ip:192.0.2.1").await.unwrap());
        ack.assert_async().await;
    }

    #[tokio::test]
    async fn test_pull_is_noop_without_update() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/media-slave/config/version")
            .with_status(200)
            .with_body(r#"{"data": {"version": 0, "has_update": false}}"#)
            .create_async()
            .await;
        // No /config or /ack mocks: fetching either would fail the test.

        let h = agent_with(&server, None);
        h.agent.config_pull_tick().await.unwrap();
        assert!(h.config_cache.load().is_none());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_pull_fetches_when_remote_version_is_newer() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/media-slave/config/version")
            .with_status(200)
            .with_body(r#"{"data": {"version": 4, "has_update": false}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/api/v1/media-slave/config")
            .with_status(200)
            .with_body(CONFIG_BODY)
            .create_async()
            .await;

        let h = agent_with(&server, None);
        h.agent.config_pull_tick().await.unwrap();
        assert_eq!(h.config_cache.version(), 4);
    }

    #[tokio::test]
    async fn test_apply_keeps_prior_sections_when_absent() {
        let server = mockito::Server::new_async().await;
        let h = agent_with(&server, None);

        let envelope: serde_json::Value = serde_json::from_str(CONFIG_BODY).unwrap();
        let full: crate::control::types::ConfigPayload =
            serde_json::from_value(envelope["data"].clone()).unwrap();
        h.agent.apply_config(full).await;
        assert_eq!(h.config_cache.load().unwrap().policy.max_streams, 2);

        // Version-only payload: policy and rules survive.
        let partial: crate::control::types::ConfigPayload =
            serde_json::from_str(r#"{"version": 9}"#).unwrap();
        h.agent.apply_config(partial).await;

        let snapshot = h.config_cache.load().unwrap();
        assert_eq!(snapshot.version, 9);
        assert_eq!(snapshot.policy.max_streams, 2);
        assert_eq!(snapshot.rate_limits.rules.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_replaces_enforcement_set() {
        let server = mockito::Server::new_async().await;
        let h = agent_with(&server, None);
        h.store.set_ex("enforce:user:stale", "{}", 600).await.unwrap();

        let payload = crate::control::types::ConfigPayload {
            version: 2,
            service_type: None,
            policy: None,
            rate_limit_config: Some(crate::policy::RateLimitConfig {
                rules: Vec::new(),
                enforcements: vec![EnforcementDirective {
                    dimension: Dimension::Device,
                    dimension_value: "D9".to_string(),
                    action: OverAction::Throttle,
                    reason: None,
                    throttle_rate_bps: Some(100_000),
                    effective_until: None,
                }],
            }),
        };
        h.agent.apply_config(payload).await;

        assert!(!h.store.exists("enforce:user:stale").await.unwrap());
        assert!(h.store.exists("enforce:device:D9").await.unwrap());
    }
}
