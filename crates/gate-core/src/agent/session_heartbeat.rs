//! Session heartbeat loop: push a realtime snapshot of active playback
//! sessions. Empty snapshots are still sent so the control plane can clear
//! stale central state for this instance.

use super::Agent;
use crate::errors::GateError;
use tracing::debug;

/// Upper bound on sessions included per snapshot.
const SNAPSHOT_LIMIT: usize = 4096;

impl Agent {
    pub(crate) async fn session_heartbeat_tick(&self) -> Result<(), GateError> {
        let snapshots = self.sessions.snapshot_all(SNAPSHOT_LIMIT).await?;
        let count = snapshots.len();
        self.control.session_heartbeat(snapshots).await?;
        debug!(count, "session snapshot pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::agent_with;
    use crate::session::ActiveSession;
    use crate::store::Store;
    use chrono::Utc;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_snapshot_includes_live_sessions() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/slave/telemetry/realtime/heartbeat")
            .match_body(Matcher::PartialJsonString(
                r#"{"sessions": [{"user_id": "U1", "play_session_id": "P1"}]}"#.to_string(),
            ))
            .with_status(200)
            .create_async()
            .await;

        let h = agent_with(&server, None);
        let session = ActiveSession {
            device_id: Some("D1".to_string()),
            device_name: None,
            client_name: None,
            client_ip: "10.0.0.1".to_string(),
            started_at: Utc::now(),
            last_seen: Utc::now(),
            bytes_sent: 100,
        };
        h.store
            .set_ex("active_session:U1:P1", &serde_json::to_string(&session).unwrap(), 90)
            .await
            .unwrap();

        h.agent.session_heartbeat_tick().await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_still_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/slave/telemetry/realtime/heartbeat")
            .match_body(Matcher::JsonString(r#"{"sessions": []}"#.to_string()))
            .with_status(200)
            .create_async()
            .await;

        let h = agent_with(&server, None);
        h.agent.session_heartbeat_tick().await.unwrap();
        mock.assert_async().await;
    }
}
