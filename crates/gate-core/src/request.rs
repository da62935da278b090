//! Per-request views shared between the pipeline and the log phase.

use crate::identity::Fingerprint;
use std::collections::HashMap;

/// Transport-agnostic view of an inbound request.
///
/// Built once by the server layer from the raw request parts; the pipeline
/// and the identity extractor only ever see this. Header names are stored
/// lowercased.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    headers: HashMap<String, String>,
}

impl InboundRequest {
    #[must_use]
    pub fn new(
        client_ip: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        query: Option<String>,
        headers: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            client_ip: client_ip.into(),
            method: method.into(),
            path: path.into(),
            query,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect(),
        }
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// First query parameter with the given (case-sensitive) name,
    /// percent-decoded.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Request path with query string, as recorded in telemetry.
    #[must_use]
    pub fn uri(&self) -> String {
        match &self.query {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }
}

/// State accumulated by the pipeline for the log phase.
///
/// The transport layer consults `throttle_rate_bps` while streaming the
/// response; the recorder consumes the fingerprint afterwards.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub fingerprint: Fingerprint,
    /// Bytes-per-second cap requested by an enforcement or rate-limit rule.
    pub throttle_rate_bps: Option<u64>,
    pub user_agent: Option<String>,
}
