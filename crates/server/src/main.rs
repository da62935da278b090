use anyhow::Result;
use axum::serve;
use gate_core::{
    policy::{ConfigCache, LocalRateLimiter, PolicyEngine},
    Agent, GateConfig, LogPhaseRecorder, LoginCapture, RedisStore, Store, TelemetryBuffer,
};
use server::{proxy::GatewayState, routes};
use std::{net::SocketAddr, sync::Arc};
use tokio::{signal, sync::broadcast};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system based on the configuration.
fn init_logging(config: &GateConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,gate_core={level},server={level}",
            level = config.gate_log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.gate_log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config =
        GateConfig::load().map_err(|e| anyhow::anyhow!("configuration load failed: {e}"))?;
    init_logging(&config);

    // Missing mandatory values or a rejected first store connect are fatal:
    // exit non-zero rather than run an unenforceable gateway.
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("configuration invalid: {e}"))?;

    info!(version = gate_core::config::AGENT_VERSION, "starting media gateway");
    debug!(
        upstream_url = %config.upstream_url,
        bind_port = config.gate_bind_port,
        token_resolve = config.token_resolve_enabled(),
        "configuration loaded"
    );

    let store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(&config.redis_url())
            .await
            .map_err(|e| anyhow::anyhow!("store connect failed: {e}"))?,
    );
    info!(host = %config.redis_host, port = config.redis_port, "store connected");

    let config_cache = Arc::new(ConfigCache::new());
    let telemetry = Arc::new(TelemetryBuffer::new());
    let limiter = Arc::new(LocalRateLimiter::new());
    limiter.start_cleanup_task();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Exactly one agent per deployment; it is started here, once, next to
    // the listener.
    let agent = Arc::new(
        Agent::new(config.clone(), store.clone(), config_cache.clone(), telemetry.clone())
            .map_err(|e| anyhow::anyhow!("agent init failed: {e}"))?,
    );
    let agent_handles = agent.start(&shutdown_tx);

    let state = Arc::new(GatewayState {
        engine: PolicyEngine::new(store.clone(), config_cache, limiter, telemetry.clone()),
        recorder: LogPhaseRecorder::new(store.clone(), telemetry),
        capture: LoginCapture::new(store.clone()),
        upstream: server::proxy::build_upstream_client()
            .map_err(|e| anyhow::anyhow!("upstream client build failed: {e}"))?,
        upstream_url: config.upstream_url.trim_end_matches('/').to_string(),
    });

    let app = routes::build_router(state);
    let addr = config
        .socket_addr()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;
    info!(address = %addr, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    if let Err(e) = serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error occurred");
    }

    let _ = shutdown_tx.send(());
    for handle in agent_handles {
        handle.abort();
    }
    info!("gateway shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, starting graceful shutdown");
}
