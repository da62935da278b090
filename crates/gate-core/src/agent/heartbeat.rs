//! Heartbeat loop: report liveness and a few queue depths.

use super::Agent;
use crate::{
    config::AGENT_VERSION,
    control::types::{HeartbeatMetadata, HeartbeatRequest},
    errors::GateError,
};
use tracing::debug;

impl Agent {
    pub(crate) async fn heartbeat_tick(&self) -> Result<(), GateError> {
        let active_sessions = match self.sessions.count_all().await {
            Ok(count) => count,
            Err(err) => {
                debug!(error = %err, "session count unavailable for heartbeat");
                0
            }
        };

        let request = HeartbeatRequest {
            agent_version: AGENT_VERSION.to_string(),
            current_config_version: self.config_cache.version(),
            status: "ok".to_string(),
            metadata: HeartbeatMetadata {
                access_log_pending: self.telemetry.access_len(),
                blocked_log_pending: self.telemetry.blocked_len(),
                telemetry_lost: self.telemetry.lost_count(),
                active_sessions,
            },
        };
        self.control.heartbeat(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::agent_with;
    use crate::store::Store;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_heartbeat_reports_counts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/media-slave/heartbeat")
            .match_body(Matcher::PartialJsonString(
                r#"{"current_config_version": 0, "status": "ok", "metadata": {"active_sessions": 1}}"#
                    .to_string(),
            ))
            .with_status(200)
            .create_async()
            .await;

        let h = agent_with(&server, None);
        h.store.set_ex("active_session:U1:P1", "{}", 90).await.unwrap();

        h.agent.heartbeat_tick().await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_heartbeat_surfaces_control_plane_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/media-slave/heartbeat")
            .with_status(502)
            .create_async()
            .await;

        let h = agent_with(&server, None);
        let err = h.agent.heartbeat_tick().await.unwrap_err();
        assert!(err.is_transient());
    }
}
