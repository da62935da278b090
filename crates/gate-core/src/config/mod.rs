//! Gateway configuration with layered loading.
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: hardcoded in `set_default` calls below
//! 2. **Config file**: TOML file specified by `GATE_CONFIG` env var
//! 3. **Environment variables**: flat names (`UHDADMIN_URL`, `REDIS_HOST`,
//!    `CONFIG_PULL_INTERVAL`, ...) override specific fields
//!
//! Two values are mandatory: `UHDADMIN_URL` and `APP_TOKEN`. [`GateConfig::validate`]
//! turns their absence into a fatal bootstrap error; everything else has a
//! usable default.

use crate::errors::GateError;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Gateway agent version reported to the control plane.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Root configuration for a gateway instance.
///
/// Field names match the environment variable names lowercased, so the flat
/// `Environment` source maps directly onto this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Control-plane base URL. Mandatory.
    #[serde(default)]
    pub uhdadmin_url: String,

    /// Control-plane application token. Mandatory.
    #[serde(default)]
    pub app_token: String,

    /// Store host. Defaults to `127.0.0.1`.
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Store port. Defaults to `6379`.
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Store logical database index. Defaults to `0`.
    #[serde(default)]
    pub redis_db: i64,

    /// Store password. Empty string means no AUTH.
    #[serde(default)]
    pub redis_password: String,

    /// Config pull loop interval in seconds. Defaults to `30`.
    #[serde(default = "default_config_pull_interval")]
    pub config_pull_interval: u64,

    /// Telemetry flush loop interval in seconds. Defaults to `60`.
    #[serde(default = "default_telemetry_flush_interval")]
    pub telemetry_flush_interval: u64,

    /// Quota sync loop interval in seconds. Defaults to `300`.
    #[serde(default = "default_quota_sync_interval")]
    pub quota_sync_interval: u64,

    /// Heartbeat loop interval in seconds. Defaults to `60`.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// Session heartbeat loop interval in seconds. Defaults to `30`.
    #[serde(default = "default_session_heartbeat_interval")]
    pub session_heartbeat_interval: u64,

    /// Token resolve loop interval in seconds. Defaults to `30`.
    #[serde(default = "default_token_resolve_interval")]
    pub token_resolve_interval: u64,

    /// Upstream media server API key for session polling. Empty disables the
    /// token resolve loop.
    #[serde(default)]
    pub emby_api_key: String,

    /// Upstream media server base URL for session polling. Empty disables
    /// the token resolve loop.
    #[serde(default)]
    pub emby_server_url: String,

    /// Base URL requests are proxied to. Defaults to `http://127.0.0.1:8096`.
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// Listener bind address. Defaults to `0.0.0.0`.
    #[serde(default = "default_bind_address")]
    pub gate_bind_address: String,

    /// Listener bind port. Defaults to `8097`.
    #[serde(default = "default_bind_port")]
    pub gate_bind_port: u16,

    /// Log level (e.g. "info", "debug"). Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub gate_log_level: String,

    /// Log output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub gate_log_format: String,
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_config_pull_interval() -> u64 {
    30
}

fn default_telemetry_flush_interval() -> u64 {
    60
}

fn default_quota_sync_interval() -> u64 {
    300
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_session_heartbeat_interval() -> u64 {
    30
}

fn default_token_resolve_interval() -> u64 {
    30
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:8096".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    8097
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            uhdadmin_url: String::new(),
            app_token: String::new(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            redis_db: 0,
            redis_password: String::new(),
            config_pull_interval: default_config_pull_interval(),
            telemetry_flush_interval: default_telemetry_flush_interval(),
            quota_sync_interval: default_quota_sync_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            session_heartbeat_interval: default_session_heartbeat_interval(),
            token_resolve_interval: default_token_resolve_interval(),
            emby_api_key: String::new(),
            emby_server_url: String::new(),
            upstream_url: default_upstream_url(),
            gate_bind_address: default_bind_address(),
            gate_bind_port: default_bind_port(),
            gate_log_level: default_log_level(),
            gate_log_format: default_log_format(),
        }
    }
}

impl GateConfig {
    /// Loads configuration from a TOML file with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be parsed or a value fails
    /// to deserialize.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("redis_host", "127.0.0.1")?
            .set_default("redis_port", 6379)?
            .set_default("redis_db", 0)?
            .set_default("config_pull_interval", 30)?
            .set_default("telemetry_flush_interval", 60)?
            .set_default("quota_sync_interval", 300)?
            .set_default("heartbeat_interval", 60)?
            .set_default("session_heartbeat_interval", 30)?
            .set_default("token_resolve_interval", 30)?
            .set_default("upstream_url", "http://127.0.0.1:8096")?
            .set_default("gate_bind_address", "0.0.0.0")?
            .set_default("gate_bind_port", 8097)?
            .set_default("gate_log_level", "info")?
            .set_default("gate_log_format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::default().try_parsing(true))
            .build()?;

        builder.try_deserialize()
    }

    /// Loads configuration from `config/gate.toml` (overridable via the
    /// `GATE_CONFIG` env var) with environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("GATE_CONFIG").unwrap_or_else(|_| "config/gate.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Validates mandatory values and basic consistency.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::FatalBootstrap`] if `UHDADMIN_URL` or `APP_TOKEN`
    /// is missing, or a URL/interval is malformed.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.uhdadmin_url.is_empty() {
            return Err(GateError::FatalBootstrap("UHDADMIN_URL is not set".to_string()));
        }
        if !self.uhdadmin_url.starts_with("http") {
            return Err(GateError::FatalBootstrap(format!(
                "UHDADMIN_URL is not an http(s) URL: {}",
                self.uhdadmin_url
            )));
        }
        if self.app_token.is_empty() {
            return Err(GateError::FatalBootstrap("APP_TOKEN is not set".to_string()));
        }
        if !self.upstream_url.starts_with("http") {
            return Err(GateError::FatalBootstrap(format!(
                "UPSTREAM_URL is not an http(s) URL: {}",
                self.upstream_url
            )));
        }
        if self.gate_bind_port == 0 {
            return Err(GateError::FatalBootstrap("bind port must be greater than 0".to_string()));
        }
        for (name, value) in [
            ("CONFIG_PULL_INTERVAL", self.config_pull_interval),
            ("TELEMETRY_FLUSH_INTERVAL", self.telemetry_flush_interval),
            ("QUOTA_SYNC_INTERVAL", self.quota_sync_interval),
            ("HEARTBEAT_INTERVAL", self.heartbeat_interval),
            ("SESSION_HEARTBEAT_INTERVAL", self.session_heartbeat_interval),
            ("TOKEN_RESOLVE_INTERVAL", self.token_resolve_interval),
        ] {
            if value == 0 {
                return Err(GateError::FatalBootstrap(format!("{name} must be greater than 0")));
            }
        }
        if !["json", "pretty"].contains(&self.gate_log_format.as_str()) {
            return Err(GateError::FatalBootstrap(
                "GATE_LOG_FORMAT must be 'json' or 'pretty'".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the store connection URL, including AUTH and SELECT parameters
    /// when configured.
    #[must_use]
    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.redis_password, self.redis_host, self.redis_port, self.redis_db
            )
        }
    }

    /// Returns `true` if the token resolve loop should run.
    #[must_use]
    pub fn token_resolve_enabled(&self) -> bool {
        !self.emby_api_key.is_empty() && !self.emby_server_url.is_empty()
    }

    #[must_use]
    pub fn config_pull_interval(&self) -> Duration {
        Duration::from_secs(self.config_pull_interval)
    }

    #[must_use]
    pub fn telemetry_flush_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_flush_interval)
    }

    #[must_use]
    pub fn quota_sync_interval(&self) -> Duration {
        Duration::from_secs(self.quota_sync_interval)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    #[must_use]
    pub fn session_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.session_heartbeat_interval)
    }

    #[must_use]
    pub fn token_resolve_interval(&self) -> Duration {
        Duration::from_secs(self.token_resolve_interval)
    }

    /// Returns the listener socket address.
    ///
    /// # Errors
    ///
    /// Returns an error string if the address cannot be parsed.
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, String> {
        format!("{}:{}", self.gate_bind_address, self.gate_bind_port)
            .parse()
            .map_err(|_| {
                format!(
                    "Invalid socket address: {}:{}",
                    self.gate_bind_address, self.gate_bind_port
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn valid_config() -> GateConfig {
        GateConfig {
            uhdadmin_url: "https://admin.example.com".to_string(),
            app_token: "tok".to_string(),
            ..GateConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();
        assert_eq!(config.redis_host, "127.0.0.1");
        assert_eq!(config.redis_port, 6379);
        assert_eq!(config.redis_db, 0);
        assert_eq!(config.config_pull_interval, 30);
        assert_eq!(config.telemetry_flush_interval, 60);
        assert_eq!(config.quota_sync_interval, 300);
        assert_eq!(config.heartbeat_interval, 60);
        assert_eq!(config.session_heartbeat_interval, 30);
        assert_eq!(config.token_resolve_interval, 30);
        assert_eq!(config.gate_bind_port, 8097);
        assert_eq!(config.upstream_url, "http://127.0.0.1:8096");
    }

    #[test]
    fn test_validate_requires_mandatory_values() {
        let config = GateConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());

        let mut config = valid_config();
        assert!(config.validate().is_ok());

        config.app_token.clear();
        assert!(config.validate().unwrap_err().is_fatal());
    }

    #[test]
    fn test_validate_rejects_bad_urls_and_intervals() {
        let mut config = valid_config();
        config.uhdadmin_url = "not-a-url".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.quota_sync_interval = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.gate_log_format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_url_shapes() {
        let mut config = valid_config();
        assert_eq!(config.redis_url(), "redis://127.0.0.1:6379/0");

        config.redis_password = "secret".to_string();
        config.redis_db = 2;
        assert_eq!(config.redis_url(), "redis://:secret@127.0.0.1:6379/2");
    }

    #[test]
    fn test_token_resolve_requires_both_values() {
        let mut config = valid_config();
        assert!(!config.token_resolve_enabled());

        config.emby_api_key = "key".to_string();
        assert!(!config.token_resolve_enabled());

        config.emby_server_url = "http://emby:8096".to_string();
        assert!(config.token_resolve_enabled());
    }

    #[test]
    fn test_socket_addr() {
        let config = valid_config();
        let addr = config.socket_addr().unwrap();
        assert_eq!(addr.port(), 8097);

        let mut config = valid_config();
        config.gate_bind_address = "not an address".to_string();
        assert!(config.socket_addr().is_err());
    }

    #[test]
    #[serial]
    fn test_environment_override() {
        std::env::set_var("UHDADMIN_URL", "https://env.example.com");
        std::env::set_var("APP_TOKEN", "env-token");
        std::env::set_var("REDIS_PORT", "6380");

        let config = GateConfig::from_file("/nonexistent/gate.toml").unwrap();
        assert_eq!(config.uhdadmin_url, "https://env.example.com");
        assert_eq!(config.app_token, "env-token");
        assert_eq!(config.redis_port, 6380);
        assert!(config.validate().is_ok());

        std::env::remove_var("UHDADMIN_URL");
        std::env::remove_var("APP_TOKEN");
        std::env::remove_var("REDIS_PORT");
    }
}
