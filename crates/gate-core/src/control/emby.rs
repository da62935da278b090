//! Upstream media server API client.
//!
//! Used only by the token resolve loop to poll active sessions, which is the
//! out-of-band way to learn which user a device belongs to when no login has
//! passed through this instance.

use crate::errors::GateError;
use serde::Deserialize;
use std::time::Duration;

/// Deadline for one upstream API call.
const UPSTREAM_API_TIMEOUT: Duration = Duration::from_secs(5);

/// One session reported by `GET /emby/Sessions`.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbySession {
    #[serde(rename = "UserId", default)]
    pub user_id: Option<String>,
    #[serde(rename = "UserName", default)]
    pub user_name: Option<String>,
    #[serde(rename = "DeviceId", default)]
    pub device_id: Option<String>,
    #[serde(rename = "DeviceName", default)]
    pub device_name: Option<String>,
    #[serde(rename = "Client", default)]
    pub client: Option<String>,
    #[serde(rename = "ApplicationVersion", default)]
    pub application_version: Option<String>,
}

/// Minimal client for the upstream media server's system API.
#[derive(Clone)]
pub struct EmbyClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl EmbyClient {
    /// # Errors
    ///
    /// Returns [`GateError::FatalBootstrap`] if the HTTP client cannot be
    /// constructed.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, GateError> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_API_TIMEOUT)
            .connect_timeout(Duration::from_secs(3))
            .use_rustls_tls()
            .build()
            .map_err(|err| GateError::FatalBootstrap(format!("http client build failed: {err}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// `GET /emby/Sessions`
    pub async fn sessions(&self) -> Result<Vec<EmbySession>, GateError> {
        let url = format!("{}/emby/Sessions", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await
            .map_err(|err| GateError::UpstreamApi(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GateError::UpstreamApi(format!("GET /emby/Sessions returned {status}")));
        }
        response
            .json::<Vec<EmbySession>>()
            .await
            .map_err(|err| GateError::Parse(format!("sessions decode: {err}")))
    }
}
