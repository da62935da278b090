//! Identity extraction and resolution.
//!
//! Media clients announce who they are in wildly inconsistent places: the
//! `X-Emby-Authorization` header, the bare `Authorization` header, dedicated
//! `X-Emby-*` headers, query parameters, or nothing but a User-Agent. Each
//! fingerprint field is resolved by an ordered list of sources; the first
//! non-empty value wins.
//!
//! Fields the request itself cannot answer are back-filled from the store:
//! a token maps to the user that logged in with it ([`TokenRecord`]), and a
//! device falls back to the user last seen on it ([`DeviceUserRecord`]).

use crate::{
    request::InboundRequest,
    store::{keys, Store},
};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::{debug, error};

/// Identity attributes extracted from a single request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    pub client_ip: String,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub user_id: Option<String>,
    pub token: Option<String>,
    pub play_session_id: Option<String>,
    pub uri: String,
    pub method: String,
}

/// Stored `token_map:<token>` record. Invariant: `user_id` is non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRecord {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub login_time: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

/// Stored `device_user:<device_id>` record, written only by the session
/// polling loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceUserRecord {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
    #[serde(default)]
    pub resolved_from: String,
}

static CLIENT_FIELD: LazyLock<regex::Regex> = LazyLock::new(|| quoted_field("Client"));
static VERSION_FIELD: LazyLock<regex::Regex> = LazyLock::new(|| quoted_field("Version"));
static DEVICE_ID_FIELD: LazyLock<regex::Regex> = LazyLock::new(|| quoted_field("DeviceId"));
static DEVICE_FIELD: LazyLock<regex::Regex> = LazyLock::new(|| quoted_field("Device"));
static USER_ID_FIELD: LazyLock<regex::Regex> = LazyLock::new(|| quoted_field("UserId"));
static TOKEN_FIELD: LazyLock<regex::Regex> = LazyLock::new(|| quoted_field("Token"));
static UA_VERSION_LONG: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(\d+\.\d+\.\d+)").expect("valid pattern"));
static UA_VERSION_SHORT: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(\d+\.\d+)").expect("valid pattern"));

fn quoted_field(name: &str) -> regex::Regex {
    regex::Regex::new(&format!(r#"(?i)\b{name}="([^"]*)""#)).expect("valid pattern")
}

/// First non-empty capture of `field` across the two authorization headers.
fn auth_header_field(req: &InboundRequest, field: &regex::Regex) -> Option<String> {
    ["x-emby-authorization", "authorization"]
        .into_iter()
        .filter_map(|name| req.header(name))
        .filter_map(|value| field.captures(value))
        .map(|caps| caps[1].to_string())
        .find(|value| !value.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn client_name(req: &InboundRequest) -> Option<String> {
    auth_header_field(req, &CLIENT_FIELD)
        .or_else(|| non_empty(req.header("x-emby-client").map(str::to_string)))
        .or_else(|| non_empty(req.query_param("X-Emby-Client")))
        .or_else(|| {
            let ua = req.header("user-agent")?;
            non_empty(Some(ua.split('/').next().unwrap_or("").trim().to_string()))
        })
}

fn client_version(req: &InboundRequest) -> Option<String> {
    auth_header_field(req, &VERSION_FIELD)
        .or_else(|| non_empty(req.header("x-emby-client-version").map(str::to_string)))
        .or_else(|| non_empty(req.query_param("X-Emby-Client-Version")))
        .or_else(|| {
            let ua = req.header("user-agent")?;
            UA_VERSION_LONG
                .captures(ua)
                .or_else(|| UA_VERSION_SHORT.captures(ua))
                .map(|caps| caps[1].to_string())
        })
}

fn device_id(req: &InboundRequest) -> Option<String> {
    auth_header_field(req, &DEVICE_ID_FIELD)
        .or_else(|| non_empty(req.query_param("DeviceId")))
        .or_else(|| non_empty(req.query_param("deviceId")))
}

fn device_name(req: &InboundRequest) -> Option<String> {
    auth_header_field(req, &DEVICE_FIELD)
}

fn user_id(req: &InboundRequest) -> Option<String> {
    auth_header_field(req, &USER_ID_FIELD)
        .or_else(|| non_empty(req.query_param("UserId")))
        .or_else(|| non_empty(req.query_param("userId")))
}

fn token(req: &InboundRequest) -> Option<String> {
    non_empty(req.header("x-emby-token").map(str::to_string))
        .or_else(|| auth_header_field(req, &TOKEN_FIELD))
        .or_else(|| non_empty(req.query_param("X-Emby-Token")))
        .or_else(|| non_empty(req.query_param("api_key")))
}

fn play_session_id(req: &InboundRequest) -> Option<String> {
    non_empty(req.query_param("PlaySessionId")).or_else(|| non_empty(req.query_param("playSessionId")))
}

/// Extracts the fingerprint from a request. Pure; no store access.
#[must_use]
pub fn extract(req: &InboundRequest) -> Fingerprint {
    Fingerprint {
        client_ip: req.client_ip.clone(),
        client_name: client_name(req),
        client_version: client_version(req),
        device_id: device_id(req),
        device_name: device_name(req),
        user_id: user_id(req),
        token: token(req),
        play_session_id: play_session_id(req),
        uri: req.uri(),
        method: req.method.clone(),
    }
}

/// Numeric version comparison: `current >= required`.
///
/// Each input is tokenized into its decimal runs (non-digits are
/// separators), the shorter sequence is zero-padded, and the sequences are
/// compared element-wise. Missing or digit-free inputs compare as
/// insufficient.
#[must_use]
pub fn is_sufficient(current: Option<&str>, required: &str) -> bool {
    let Some(current) = current else {
        return false;
    };
    let current_parts = numeric_parts(current);
    let required_parts = numeric_parts(required);
    if current_parts.is_empty() || required_parts.is_empty() {
        return false;
    }

    let len = current_parts.len().max(required_parts.len());
    for i in 0..len {
        let cur = current_parts.get(i).copied().unwrap_or(0);
        let req = required_parts.get(i).copied().unwrap_or(0);
        if cur != req {
            return cur > req;
        }
    }
    true
}

fn numeric_parts(version: &str) -> Vec<u64> {
    version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Back-fills the fingerprint from store state.
///
/// 1. Token known, user unknown: adopt the token mapping's user and any
///    missing device/client fields, refresh its TTL.
/// 2. Token and user both known: refresh the mapping TTL only.
/// 3. Still no user but a device id: adopt the device-user fallback.
///
/// Store failures are logged and leave the fingerprint as extracted; the
/// pipeline continues with whatever identity the request itself carried.
pub async fn back_fill(store: &dyn Store, fp: &mut Fingerprint) {
    if let Some(token) = fp.token.clone() {
        let key = keys::token_map(&token);
        if fp.user_id.is_none() {
            match store.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<TokenRecord>(&raw) {
                    Ok(record) if !record.user_id.is_empty() => {
                        fp.user_id = Some(record.user_id);
                        if fp.device_id.is_none() {
                            fp.device_id = record.device_id;
                        }
                        if fp.device_name.is_none() {
                            fp.device_name = record.device_name;
                        }
                        if fp.client_name.is_none() {
                            fp.client_name = record.client_name;
                        }
                        refresh_ttl(store, &key).await;
                    }
                    Ok(_) => debug!(key = %key, "token mapping has empty user_id, ignoring"),
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "undecodable token mapping")
                    }
                },
                Ok(None) => {}
                Err(err) => error!(error = %err, "token mapping lookup failed"),
            }
        } else {
            refresh_ttl(store, &key).await;
        }
    }

    if fp.user_id.is_none() {
        if let Some(device_id) = fp.device_id.clone() {
            let key = keys::device_user(&device_id);
            match store.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<DeviceUserRecord>(&raw) {
                    Ok(record) if !record.user_id.is_empty() => {
                        fp.user_id = Some(record.user_id);
                        if fp.device_name.is_none() {
                            fp.device_name = record.device_name;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "undecodable device-user record")
                    }
                },
                Ok(None) => {}
                Err(err) => error!(error = %err, "device-user lookup failed"),
            }
        }
    }
}

async fn refresh_ttl(store: &dyn Store, key: &str) {
    if let Err(err) = store.expire(key, keys::IDENTITY_TTL_SECS).await {
        error!(key = %key, error = %err, "failed to refresh identity TTL");
    }
}
