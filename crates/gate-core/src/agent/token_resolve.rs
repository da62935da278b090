//! Token resolve loop: poll the upstream media server's session list and
//! persist device-to-user fallbacks for devices the gateway has never seen
//! log in.

use super::Agent;
use crate::{
    errors::GateError,
    identity::DeviceUserRecord,
    store::keys,
};
use tracing::{debug, error};

impl Agent {
    /// One resolve cycle. Only fills gaps: an existing fallback for a device
    /// is left untouched so a learned binding is not churned by polling.
    pub(crate) async fn token_resolve_tick(&self) -> Result<(), GateError> {
        let Some(emby) = &self.emby else {
            return Ok(());
        };

        let sessions = emby.sessions().await?;
        let mut written = 0usize;
        for session in sessions {
            let (Some(user_id), Some(device_id)) = (&session.user_id, &session.device_id) else {
                continue;
            };
            if user_id.is_empty() || device_id.is_empty() {
                continue;
            }

            let key = keys::device_user(device_id);
            match self.store.exists(&key).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    error!(key = %key, error = %err, "device-user existence check failed");
                    continue;
                }
            }

            let record = DeviceUserRecord {
                user_id: user_id.clone(),
                username: session.user_name.clone().unwrap_or_default(),
                device_name: session.device_name.clone(),
                client_name: session.client.clone(),
                client_version: session.application_version.clone(),
                resolved_from: "sessions_poll".to_string(),
            };
            let raw = match serde_json::to_string(&record) {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::warn!(error = %err, "unencodable device-user record");
                    continue;
                }
            };
            match self.store.set_ex(&key, &raw, keys::IDENTITY_TTL_SECS).await {
                Ok(()) => written += 1,
                Err(err) => error!(key = %key, error = %err, "failed to write device-user record"),
            }
        }
        debug!(written, "device-user fallbacks resolved");
        Ok(())
    }
}
