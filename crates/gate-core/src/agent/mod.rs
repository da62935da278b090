//! Background agent.
//!
//! Six independent periodic loops keep this instance synchronized with the
//! control plane: config pull, telemetry flush, quota sync, heartbeat,
//! session heartbeat, and (when upstream API credentials are configured)
//! token resolution. Loops are staggered at startup, never share a tick, and
//! re-arm on every exit path — a failing body logs and waits for the next
//! interval, it never kills its loop or a sibling.
//!
//! Exactly one agent runs per deployment; the binary starts it once next to
//! the listener.

mod config_pull;
mod heartbeat;
mod quota_sync;
mod session_heartbeat;
mod telemetry_flush;
mod token_resolve;

use crate::{
    config::GateConfig,
    control::{ControlPlaneClient, EmbyClient},
    errors::GateError,
    policy::{ConfigCache, EnforcementDirective},
    session::SessionTracker,
    store::{keys, Store},
    telemetry::TelemetryBuffer,
};
use chrono::Utc;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{sync::broadcast, task::JoinHandle, time::interval};
use tracing::{debug, error, info};

/// Shared state of all agent loops.
pub struct Agent {
    store: Arc<dyn Store>,
    config_cache: Arc<ConfigCache>,
    control: ControlPlaneClient,
    telemetry: Arc<TelemetryBuffer>,
    sessions: SessionTracker,
    emby: Option<EmbyClient>,
    settings: GateConfig,
}

impl Agent {
    /// # Errors
    ///
    /// Returns [`GateError::FatalBootstrap`] when a client cannot be built
    /// from the configuration.
    pub fn new(
        settings: GateConfig,
        store: Arc<dyn Store>,
        config_cache: Arc<ConfigCache>,
        telemetry: Arc<TelemetryBuffer>,
    ) -> Result<Self, GateError> {
        let control = ControlPlaneClient::new(&settings.uhdadmin_url, &settings.app_token)?;
        let emby = if settings.token_resolve_enabled() {
            Some(EmbyClient::new(&settings.emby_server_url, &settings.emby_api_key)?)
        } else {
            None
        };
        let sessions = SessionTracker::new(store.clone());
        Ok(Self { store, config_cache, control, telemetry, sessions, emby, settings })
    }

    /// Spawns every loop. Handles finish when the shutdown channel fires.
    #[must_use]
    pub fn start(self: Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            self.clone().spawn_loop(
                "config_pull",
                Duration::from_secs(1),
                self.settings.config_pull_interval(),
                shutdown.subscribe(),
                |agent| async move { agent.config_pull_tick().await },
            ),
            self.clone().spawn_loop(
                "telemetry_flush",
                Duration::from_secs(5),
                self.settings.telemetry_flush_interval(),
                shutdown.subscribe(),
                |agent| async move { agent.telemetry_flush_tick().await },
            ),
            self.clone().spawn_loop(
                "quota_sync",
                Duration::from_secs(10),
                self.settings.quota_sync_interval(),
                shutdown.subscribe(),
                |agent| async move { agent.quota_sync_tick().await },
            ),
            self.clone().spawn_loop(
                "heartbeat",
                Duration::from_secs(3),
                self.settings.heartbeat_interval(),
                shutdown.subscribe(),
                |agent| async move { agent.heartbeat_tick().await },
            ),
            self.clone().spawn_loop(
                "session_heartbeat",
                Duration::from_secs(8),
                self.settings.session_heartbeat_interval(),
                shutdown.subscribe(),
                |agent| async move { agent.session_heartbeat_tick().await },
            ),
        ];

        if self.emby.is_some() {
            handles.push(self.clone().spawn_loop(
                "token_resolve",
                Duration::from_secs(7),
                self.settings.token_resolve_interval(),
                shutdown.subscribe(),
                |agent| async move { agent.token_resolve_tick().await },
            ));
        }

        info!(loops = handles.len(), "agent started");
        handles
    }

    /// One spawned loop: initial stagger delay, then tick-driven execution
    /// until shutdown. Body errors are logged; the interval re-arms
    /// regardless of how the body exited.
    fn spawn_loop<F, Fut>(
        self: Arc<Self>,
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
        body: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Agent>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), GateError>> + Send,
    {
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(initial_delay) => {}
                _ = shutdown_rx.recv() => {
                    debug!(loop_name = name, "agent loop shut down before first tick");
                    return;
                }
            }

            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = body(self.clone()).await {
                            error!(loop_name = name, error = %err, "agent loop tick failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(loop_name = name, "agent loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Replaces the `enforce:*` key set: old directives are deleted before
    /// the new set is written, each with a TTL derived from its
    /// `effective_until`.
    pub(crate) async fn replace_enforcements(&self, directives: &[EnforcementDirective]) {
        let existing = match self.store.scan_match(keys::ALL_ENFORCE_PATTERN, 4096).await {
            Ok(existing) => existing,
            Err(err) => {
                error!(error = %err, "enforcement scan failed, keeping current set");
                return;
            }
        };
        for key in &existing {
            if let Err(err) = self.store.del(key).await {
                error!(key = %key, error = %err, "failed to delete stale enforcement");
            }
        }

        let now = Utc::now();
        let mut written = 0usize;
        for directive in directives {
            let key = keys::enforce(directive.dimension, &directive.dimension_value);
            let raw = match serde_json::to_string(directive) {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "unencodable directive, skipping");
                    continue;
                }
            };
            match self.store.set_ex(&key, &raw, directive.ttl_secs(now)).await {
                Ok(()) => written += 1,
                Err(err) => error!(key = %key, error = %err, "failed to write enforcement"),
            }
        }
        debug!(removed = existing.len(), written, "enforcement set replaced");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::store::MemoryStore;

    pub(crate) struct AgentHarness {
        pub store: Arc<MemoryStore>,
        pub config_cache: Arc<ConfigCache>,
        pub telemetry: Arc<TelemetryBuffer>,
        pub agent: Agent,
    }

    /// Agent wired to a mockito control plane and an in-memory store.
    pub(crate) fn agent_with(server: &mockito::Server, emby_url: Option<&str>) -> AgentHarness {
        let store = Arc::new(MemoryStore::new());
        let config_cache = Arc::new(ConfigCache::new());
        let telemetry = Arc::new(TelemetryBuffer::new());

        let settings = GateConfig {
            uhdadmin_url: server.url(),
            app_token: "test-token".to_string(),
            emby_api_key: emby_url.map(|_| "emby-key".to_string()).unwrap_or_default(),
            emby_server_url: emby_url.unwrap_or("").to_string(),
            ..GateConfig::default()
        };
        let agent =
            Agent::new(settings, store.clone(), config_cache.clone(), telemetry.clone()).unwrap();
        AgentHarness { store, config_cache, telemetry, agent }
    }
}
