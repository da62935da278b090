//! Typed control-plane HTTP client.
//!
//! All agent traffic to the central admin service goes through here: the
//! `Authorization: App <token>` header, the agent User-Agent and the 10 s
//! deadline are applied once at construction. The upstream system exposes
//! two API roots — gateway management under `/api/v1/media-slave` and
//! telemetry ingestion under `/api/v1/slave` — and both are composed
//! canonically here rather than via relative path tricks.

pub mod emby;
pub mod types;

pub use self::emby::EmbyClient;

use crate::{
    capture::LoginEvent,
    config::AGENT_VERSION,
    errors::GateError,
    session::SessionSnapshot,
    telemetry::{AccessLogEntry, BlockedLogEntry},
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use self::types::{
    AckRequest, ConfigPayload, ConfigVersionInfo, Envelope, HeartbeatRequest, QuotaSyncData,
    QuotaSyncRequest, RateLimitsInfo, TelemetryBatch,
};

/// Deadline for one control-plane call.
const CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the control plane's gateway API.
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    gateway_base: String,
    telemetry_base: String,
}

impl ControlPlaneClient {
    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::FatalBootstrap`] if the token is not a valid
    /// header value or the HTTP client cannot be constructed.
    pub fn new(base_url: &str, app_token: &str) -> Result<Self, GateError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("App {app_token}"))
            .map_err(|err| GateError::FatalBootstrap(format!("invalid APP_TOKEN: {err}")))?;
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(format!("UHDSlave/{AGENT_VERSION}"))
            .timeout(CONTROL_PLANE_TIMEOUT)
            .connect_timeout(Duration::from_secs(5))
            .use_rustls_tls()
            .build()
            .map_err(|err| GateError::FatalBootstrap(format!("http client build failed: {err}")))?;

        let base = base_url.trim_end_matches('/');
        Ok(Self {
            http,
            gateway_base: format!("{base}/api/v1/media-slave"),
            telemetry_base: format!("{base}/api/v1/slave"),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, GateError> {
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| GateError::ControlPlaneUnreachable(sanitize(&err)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GateError::ControlPlaneUnreachable(format!(
                "GET {url} returned {status}"
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| GateError::Parse(format!("GET {url}: {err}")))
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: String,
        body: &B,
    ) -> Result<reqwest::Response, GateError> {
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| GateError::ControlPlaneUnreachable(sanitize(&err)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GateError::ControlPlaneUnreachable(format!(
                "POST {url} returned {status}"
            )));
        }
        Ok(response)
    }

    /// `GET /config/version`
    pub async fn config_version(&self) -> Result<ConfigVersionInfo, GateError> {
        let url = format!("{}/config/version", self.gateway_base);
        Ok(self.get_json::<Envelope<ConfigVersionInfo>>(url).await?.data)
    }

    /// `GET /config`
    pub async fn fetch_config(&self) -> Result<ConfigPayload, GateError> {
        let url = format!("{}/config", self.gateway_base);
        Ok(self.get_json::<Envelope<ConfigPayload>>(url).await?.data)
    }

    /// `POST /ack`
    pub async fn ack(&self, snapshot_id: &str, status: &str) -> Result<(), GateError> {
        let url = format!("{}/ack", self.gateway_base);
        self.post_json(
            url,
            &AckRequest { snapshot_id: snapshot_id.to_string(), status: status.to_string() },
        )
        .await?;
        Ok(())
    }

    /// `POST /heartbeat`
    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<(), GateError> {
        let url = format!("{}/heartbeat", self.gateway_base);
        self.post_json(url, request).await?;
        Ok(())
    }

    /// `GET /rate-limits`
    pub async fn rate_limits(&self) -> Result<RateLimitsInfo, GateError> {
        let url = format!("{}/rate-limits", self.gateway_base);
        Ok(self.get_json::<Envelope<RateLimitsInfo>>(url).await?.data)
    }

    /// `POST /telemetry/access-logs`
    pub async fn push_access_logs(&self, entries: Vec<AccessLogEntry>) -> Result<(), GateError> {
        let url = format!("{}/telemetry/access-logs", self.telemetry_base);
        self.post_json(url, &TelemetryBatch { entries }).await?;
        Ok(())
    }

    /// `POST /telemetry/blocked-requests`
    pub async fn push_blocked_logs(&self, entries: Vec<BlockedLogEntry>) -> Result<(), GateError> {
        let url = format!("{}/telemetry/blocked-requests", self.telemetry_base);
        self.post_json(url, &TelemetryBatch { entries }).await?;
        Ok(())
    }

    /// `POST /telemetry/login`
    pub async fn push_login_event(&self, event: &LoginEvent) -> Result<(), GateError> {
        let url = format!("{}/telemetry/login", self.telemetry_base);
        self.post_json(url, event).await?;
        Ok(())
    }

    /// `POST /telemetry/quota-sync`
    pub async fn quota_sync(&self, request: &QuotaSyncRequest) -> Result<QuotaSyncData, GateError> {
        let url = format!("{}/telemetry/quota-sync", self.telemetry_base);
        let response = self.post_json(url.clone(), request).await?;
        Ok(response
            .json::<Envelope<QuotaSyncData>>()
            .await
            .map_err(|err| GateError::Parse(format!("POST {url}: {err}")))?
            .data)
    }

    /// `POST /telemetry/realtime/heartbeat`
    pub async fn session_heartbeat(
        &self,
        sessions: Vec<SessionSnapshot>,
    ) -> Result<(), GateError> {
        let url = format!("{}/telemetry/realtime/heartbeat", self.telemetry_base);
        self.post_json(url, &serde_json::json!({ "sessions": sessions })).await?;
        Ok(())
    }
}

/// Strips connection details from reqwest errors before they reach logs.
fn sanitize(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        "connection refused or unreachable".to_string()
    } else {
        "network error".to_string()
    }
}
