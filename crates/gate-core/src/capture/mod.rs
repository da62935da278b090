//! Login response capture.
//!
//! Successful authentication responses are the one place the gateway can
//! learn an authoritative `token → user` binding, so the proxy buffers the
//! bodies of `POST /Users/AuthenticateByName` and
//! `POST /Users/AuthenticateWithQuickConnect` responses and hands them here.
//! The captured binding is persisted as a token mapping and queued as a
//! login report for the control plane.
//!
//! The response bytes themselves are never altered; a body this module
//! cannot decode is logged and forgotten.

use crate::{
    identity::{Fingerprint, TokenRecord},
    store::{keys, Store},
};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Login event queued for the control plane's telemetry endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginEvent {
    pub event_type: String,
    pub emby_user_id: String,
    pub emby_username: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
    pub client_ip: String,
    pub success: bool,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(rename = "AccessToken")]
    access_token: Option<String>,
    #[serde(rename = "User")]
    user: Option<AuthUser>,
    #[serde(rename = "SessionInfo")]
    session_info: Option<AuthSessionInfo>,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    #[serde(rename = "Id")]
    id: Option<String>,
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "Policy")]
    policy: Option<AuthUserPolicy>,
}

#[derive(Debug, Deserialize)]
struct AuthUserPolicy {
    #[serde(rename = "IsAdministrator", default)]
    is_administrator: bool,
}

#[derive(Debug, Deserialize)]
struct AuthSessionInfo {
    #[serde(rename = "DeviceId")]
    device_id: Option<String>,
    #[serde(rename = "DeviceName")]
    device_name: Option<String>,
    #[serde(rename = "Client")]
    client: Option<String>,
    #[serde(rename = "ApplicationVersion")]
    application_version: Option<String>,
}

/// Returns `true` for requests whose responses should be buffered for
/// capture. Path comparison is case-insensitive.
#[must_use]
pub fn is_login_request(method: &str, path: &str) -> bool {
    if !method.eq_ignore_ascii_case("POST") {
        return false;
    }
    let path = path.to_ascii_lowercase();
    path.ends_with("/users/authenticatebyname")
        || path.ends_with("/users/authenticatewithquickconnect")
}

/// Persists learned token bindings from buffered login responses.
#[derive(Clone)]
pub struct LoginCapture {
    store: Arc<dyn Store>,
}

impl LoginCapture {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Processes a complete 200-response body. Only call for requests that
    /// passed [`is_login_request`]; non-200 responses must not reach here.
    pub async fn process_body(&self, fp: &Fingerprint, body: &[u8]) {
        let parsed: AuthResponse = match serde_json::from_slice(body) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "login response body is not decodable JSON, ignoring");
                return;
            }
        };

        let Some(token) = parsed.access_token.filter(|t| !t.is_empty()) else {
            warn!("login response carries no AccessToken, ignoring");
            return;
        };
        let Some(user) = parsed.user else {
            warn!("login response carries no User, ignoring");
            return;
        };
        let Some(user_id) = user.id.filter(|id| !id.is_empty()) else {
            warn!("login response carries no User.Id, ignoring");
            return;
        };
        let username = user.name.unwrap_or_default();
        let is_admin = user.policy.is_some_and(|p| p.is_administrator);

        let session = parsed.session_info;
        let record = TokenRecord {
            user_id: user_id.clone(),
            username: username.clone(),
            device_id: session
                .as_ref()
                .and_then(|s| s.device_id.clone())
                .or_else(|| fp.device_id.clone()),
            device_name: session
                .as_ref()
                .and_then(|s| s.device_name.clone())
                .or_else(|| fp.device_name.clone()),
            client_name: session
                .as_ref()
                .and_then(|s| s.client.clone())
                .or_else(|| fp.client_name.clone()),
            client_version: session
                .as_ref()
                .and_then(|s| s.application_version.clone())
                .or_else(|| fp.client_version.clone()),
            client_ip: Some(fp.client_ip.clone()),
            login_time: Some(Utc::now().to_rfc3339()),
            is_admin,
        };

        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "failed to encode token record");
                return;
            }
        };
        if let Err(err) = self
            .store
            .set_ex(&keys::token_map(&token), &raw, keys::IDENTITY_TTL_SECS)
            .await
        {
            tracing::error!(error = %err, "failed to persist token mapping");
            return;
        }

        self.queue_report(&record).await;
        info!(user_id = %record.user_id, username = %record.username, "captured login token binding");
    }

    async fn queue_report(&self, record: &TokenRecord) {
        let event = LoginEvent {
            event_type: "login".to_string(),
            emby_user_id: record.user_id.clone(),
            emby_username: record.username.clone(),
            device_id: record.device_id.clone(),
            device_name: record.device_name.clone(),
            client_name: record.client_name.clone(),
            client_version: record.client_version.clone(),
            client_ip: record.client_ip.clone().unwrap_or_default(),
            success: true,
        };
        let raw = match serde_json::to_string(&event) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "failed to encode login event");
                return;
            }
        };
        let nonce = rand::rng().random_range(0..1_000_000u32);
        let key = keys::token_report(Utc::now(), nonce);
        if let Err(err) = self.store.set_ex(&key, &raw, keys::TOKEN_REPORT_TTL_SECS).await {
            tracing::error!(error = %err, "failed to queue login report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const LOGIN_BODY: &str = r#"{
        "AccessToken": "T2",
        "User": {"Id": "U2", "Name": "alice", "Policy": {"IsAdministrator": false}},
        "SessionInfo": {"DeviceId": "S-D", "DeviceName": "S-Name", "Client": "Emby iOS", "ApplicationVersion": "2.1.0"}
    }"#;

    fn capture() -> (Arc<MemoryStore>, LoginCapture) {
        let store = Arc::new(MemoryStore::new());
        let capture = LoginCapture::new(store.clone());
        (store, capture)
    }

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            client_ip: "203.0.113.4".to_string(),
            device_id: Some("D2".to_string()),
            device_name: Some("iPhone".to_string()),
            client_name: Some("Infuse".to_string()),
            client_version: Some("7.9.0".to_string()),
            ..Fingerprint::default()
        }
    }

    #[test]
    fn test_login_request_matching() {
        assert!(is_login_request("POST", "/Users/AuthenticateByName"));
        assert!(is_login_request("post", "/emby/users/authenticatebyname"));
        assert!(is_login_request("POST", "/Users/AuthenticateWithQuickConnect"));

        assert!(!is_login_request("GET", "/Users/AuthenticateByName"));
        assert!(!is_login_request("POST", "/Users/AuthenticateByName/extra"));
        assert!(!is_login_request("POST", "/Videos/v/stream"));
    }

    #[tokio::test]
    async fn test_capture_persists_mapping_and_report() {
        let (store, capture) = capture();
        capture.process_body(&fingerprint(), LOGIN_BODY.as_bytes()).await;

        let raw = store.get("token_map:T2").await.unwrap().expect("mapping persisted");
        let record: TokenRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.user_id, "U2");
        assert_eq!(record.username, "alice");
        // SessionInfo fields win over request-side identity.
        assert_eq!(record.device_id.as_deref(), Some("S-D"));
        assert_eq!(record.client_name.as_deref(), Some("Emby iOS"));
        assert_eq!(record.client_ip.as_deref(), Some("203.0.113.4"));
        assert!(!record.is_admin);

        let reports = store.scan_match("token_report:*", 10).await.unwrap();
        assert_eq!(reports.len(), 1);
        let raw = store.get(&reports[0]).await.unwrap().unwrap();
        let event: LoginEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(event.event_type, "login");
        assert_eq!(event.emby_user_id, "U2");
        assert_eq!(event.emby_username, "alice");
        assert!(event.success);
    }

    #[tokio::test]
    async fn test_capture_merges_request_identity_when_session_info_absent() {
        let (store, capture) = capture();
        let body = r#"{"AccessToken": "T3", "User": {"Id": "U3", "Name": "bob"}}"#;
        capture.process_body(&fingerprint(), body.as_bytes()).await;

        let raw = store.get("token_map:T3").await.unwrap().unwrap();
        let record: TokenRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.device_id.as_deref(), Some("D2"));
        assert_eq!(record.device_name.as_deref(), Some("iPhone"));
        assert_eq!(record.client_name.as_deref(), Some("Infuse"));
        assert_eq!(record.client_version.as_deref(), Some("7.9.0"));
    }

    #[tokio::test]
    async fn test_replay_produces_equivalent_mapping() {
        let (store, capture) = capture();
        capture.process_body(&fingerprint(), LOGIN_BODY.as_bytes()).await;
        let first = store.get("token_map:T2").await.unwrap().unwrap();
        let first: TokenRecord = serde_json::from_str(&first).unwrap();

        capture.process_body(&fingerprint(), LOGIN_BODY.as_bytes()).await;
        let second = store.get("token_map:T2").await.unwrap().unwrap();
        let second: TokenRecord = serde_json::from_str(&second).unwrap();

        assert_eq!(first.user_id, second.user_id);
        assert_eq!(first.username, second.username);
        assert_eq!(first.device_id, second.device_id);
    }

    #[tokio::test]
    async fn test_malformed_or_incomplete_bodies_are_ignored() {
        let (store, capture) = capture();

        capture.process_body(&fingerprint(), b"{not json").await;
        capture.process_body(&fingerprint(), br#"{"User": {"Id": "U"}}"#).await;
        capture.process_body(&fingerprint(), br#"{"AccessToken": "T"}"#).await;
        capture
            .process_body(&fingerprint(), br#"{"AccessToken": "T", "User": {"Name": "x"}}"#)
            .await;

        assert!(store.is_empty());
    }
}
