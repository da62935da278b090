//! The proxy hot path.
//!
//! Every request that is not `/health` lands in [`proxy_handler`]: build the
//! transport-agnostic request view, run the policy pipeline, then either
//! render the denial locally or forward upstream and stream the response
//! back through a metered body. Login responses are buffered so the capture
//! can learn the token binding; everything else streams.

use crate::stream::metered_stream;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use gate_core::{
    capture::{self, LoginCapture},
    policy::{AccessDecision, Denial, PolicyEngine},
    recorder::{LogPhaseRecorder, RequestOutcome},
    request::{InboundRequest, RequestContext},
};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tracing::{debug, warn};

/// Request bodies above this size are rejected before forwarding.
const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

/// Deadline for the upstream exchange (headers, not full body streaming).
const UPSTREAM_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Shared state for the proxy handler.
pub struct GatewayState {
    pub engine: PolicyEngine,
    pub recorder: LogPhaseRecorder,
    pub capture: LoginCapture,
    pub upstream: reqwest::Client,
    pub upstream_url: String,
}

impl GatewayState {
    fn upstream_uri(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(query) if !query.is_empty() => {
                format!("{}{}?{}", self.upstream_url, path, query)
            }
            _ => format!("{}{}", self.upstream_url, path),
        }
    }
}

/// Builds the shared upstream HTTP client.
///
/// # Errors
///
/// Returns an error when the TLS backend cannot be initialized.
pub fn build_upstream_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .pool_idle_timeout(std::time::Duration::from_secs(30))
        .pool_max_idle_per_host(32)
        .connect_timeout(std::time::Duration::from_secs(5))
        .timeout(UPSTREAM_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .use_rustls_tls()
        .tcp_nodelay(true)
        .build()
}

/// Handles one proxied request end to end.
pub async fn proxy_handler(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let started = Instant::now();
    let inbound = to_inbound(&req, addr);
    let method = inbound.method.clone();
    let path = inbound.path.clone();

    let (decision, ctx) = state.engine.evaluate(&inbound).await;

    match decision {
        AccessDecision::Deny(denial) => {
            let response = render_denial(&denial);
            finish(&state, ctx, denial.status, 0, started, 0);
            response
        }
        AccessDecision::FakeCounts { value } => {
            let body = fake_counts_document(value).to_string();
            let bytes_sent = body.len() as u64;
            let response = (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, HeaderValue::from_static("application/json")),
                    (
                        header::CACHE_CONTROL,
                        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
                    ),
                    (
                        header::HeaderName::from_static("x-detailpreload-bytes"),
                        HeaderValue::from_static("-1"),
                    ),
                ],
                body,
            )
                .into_response();
            finish(&state, ctx, 200, bytes_sent, started, 0);
            response
        }
        AccessDecision::Allow => forward(state, inbound, ctx, req, started, &method, &path).await,
    }
}

/// Forwards an allowed request upstream and streams the response back.
async fn forward(
    state: Arc<GatewayState>,
    inbound: InboundRequest,
    ctx: RequestContext,
    req: Request,
    started: Instant,
    method: &str,
    path: &str,
) -> Response {
    let url = state.upstream_uri(&inbound.path, inbound.query.as_deref());
    let reqwest_method = match Method::from_bytes(method.as_bytes()) {
        Ok(method) => method,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let headers = forwardable_headers(req.headers());
    let body = match axum::body::to_bytes(req.into_body(), MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let upstream_started = Instant::now();
    let upstream_response = match state
        .upstream
        .request(reqwest_method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            warn!(path, error = %err, "upstream request failed");
            let response =
                (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response();
            finish(&state, ctx, 502, 0, started, upstream_started.elapsed().as_millis() as u64);
            return response;
        }
    };

    let status = upstream_response.status();
    let upstream_time_ms = upstream_started.elapsed().as_millis() as u64;
    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in upstream_response.headers() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    // Login responses are buffered whole so the capture can decode them; the
    // bytes returned to the client are exactly the upstream bytes.
    if capture::is_login_request(method, path) && status.as_u16() == 200 {
        let body = match upstream_response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                warn!(path, error = %err, "failed to read login response body");
                let response = (StatusCode::BAD_GATEWAY, "upstream body error").into_response();
                finish(&state, ctx, 502, 0, started, upstream_time_ms);
                return response;
            }
        };
        state.capture.process_body(&ctx.fingerprint, &body).await;

        let bytes_sent = body.len() as u64;
        let response = builder
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
        finish(&state, ctx, status.as_u16(), bytes_sent, started, upstream_time_ms);
        return response;
    }

    // Everything else streams through the metered body; the log phase runs
    // from the stream's completion hook so bytes_sent reflects what actually
    // left the gateway.
    let recorder = state.recorder.clone();
    let status_code = status.as_u16();
    let request_start = started;
    let throttle = ctx.throttle_rate_bps;
    if throttle.is_some() {
        debug!(path, throttle_rate_bps = throttle, "streaming response throttled");
    }
    let body_stream = metered_stream(
        upstream_response.bytes_stream(),
        throttle,
        move |bytes_sent| {
            let outcome = RequestOutcome {
                status: status_code,
                bytes_sent,
                request_time_ms: request_start.elapsed().as_millis() as u64,
                upstream_time_ms,
            };
            tokio::spawn(async move {
                recorder.record(&ctx, outcome).await;
            });
        },
    );

    builder
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Builds the transport-agnostic request view from axum parts.
fn to_inbound(req: &Request, addr: SocketAddr) -> InboundRequest {
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    InboundRequest::new(
        client_ip(req.headers(), addr),
        req.method().as_str(),
        req.uri().path(),
        req.uri().query().map(str::to_string),
        headers,
    )
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    addr.ip().to_string()
}

/// Headers never forwarded in either direction.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection" |
            "keep-alive" |
            "proxy-authenticate" |
            "proxy-authorization" |
            "te" |
            "trailer" |
            "transfer-encoding" |
            "upgrade" |
            "content-length" |
            "host"
    )
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Renders a policy denial with the gateway's denial headers.
fn render_denial(denial: &Denial) -> Response {
    (
        StatusCode::from_u16(denial.status).unwrap_or(StatusCode::FORBIDDEN),
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8")),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-store, no-cache, must-revalidate"),
            ),
            (
                header::HeaderName::from_static("x-detailpreload-bytes"),
                HeaderValue::from_static("-1"),
            ),
        ],
        denial.message.clone(),
    )
        .into_response()
}

/// The synthetic library counts document.
fn fake_counts_document(value: i64) -> serde_json::Value {
    serde_json::json!({
        "MovieCount": value,
        "SeriesCount": value,
        "EpisodeCount": value,
        "AlbumCount": value,
        "SongCount": value,
        "ArtistCount": value,
        "MusicVideoCount": value,
        "BoxSetCount": value,
        "BookCount": value,
        "TrailerCount": value,
        "ProgramCount": value,
        "ItemCount": value
    })
}

/// Hands a finished (non-streamed) request to the log phase.
fn finish(
    state: &Arc<GatewayState>,
    ctx: RequestContext,
    status: u16,
    bytes_sent: u64,
    started: Instant,
    upstream_time_ms: u64,
) {
    let recorder = state.recorder.clone();
    let outcome = RequestOutcome {
        status,
        bytes_sent,
        request_time_ms: started.elapsed().as_millis() as u64,
        upstream_time_ms,
    };
    tokio::spawn(async move {
        recorder.record(&ctx, outcome).await;
    });
}
