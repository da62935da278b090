//! Router assembly: the health probe plus the catch-all proxy.

use crate::proxy::{proxy_handler, GatewayState};
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

/// Request body ceiling applied in front of the proxy handler.
const REQUEST_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Liveness probe. Deliberately does not touch the store or the control
/// plane: a degraded gateway still serves.
pub async fn handle_health() -> &'static str {
    "OK"
}

/// Builds the gateway router. Every path except `/health` is proxied.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .fallback(proxy_handler)
        .layer(RequestBodyLimitLayer::new(REQUEST_BODY_LIMIT))
        .with_state(state)
}
