//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: GATEWAY_)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/gateway-edge/{service_name}/config.toml
//! 4. System directory: /etc/gateway-edge/{service_name}/config.toml
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Root configuration structure, shared as an `Arc` across every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub kv: KvConfig,
    pub credentials: CredentialConfig,
    pub session: SessionConfig,
    pub websocket: WebSocketConfig,
    pub reaper: ReaperConfig,
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

/// Service-level configuration: bind address, identity, logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_environment")]
    pub environment: String,

    /// This replica's host identifier, used to stamp connection records and
    /// the WS `welcome` frame's `gateway_id`.
    #[serde(default = "default_replica_host")]
    pub replica_host: String,

    /// This replica's externally reachable port, paired with `replica_host`.
    #[serde(default = "default_port")]
    pub replica_port: u16,
}

impl ServiceConfig {
    /// The `host:port` identifier stamped onto connection records.
    pub fn gateway_id(&self) -> String {
        format!("{}:{}", self.replica_host, self.replica_port)
    }
}

/// KV connection pool configuration (C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// KV connection URL (redis://host:port).
    pub url: String,

    #[serde(default = "default_kv_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl KvConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

/// Credential service configuration (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Shared HS256 signing secret.
    pub secret: String,

    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,

    #[serde(default)]
    pub issuer: Option<String>,

    #[serde(default)]
    pub audience: Option<String>,

    /// Access token lifetime in minutes.
    #[serde(default = "default_token_expiry_minutes")]
    pub token_expiry_minutes: i64,
}

impl CredentialConfig {
    pub fn token_expiry(&self) -> Duration {
        Duration::from_secs(self.token_expiry_minutes as u64 * 60)
    }
}

/// Session store and tracker configuration (C3/C4/C5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// KV TTL applied to session and connection records, in seconds.
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,

    /// Local read-cache TTL for sessions/users, in seconds.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Throttle window for connection-timestamp / session `last_access`
    /// writes, in seconds.
    #[serde(default = "default_touch_interval")]
    pub touch_interval_secs: u64,

    /// Batched write-behind flush interval, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
    pub fn touch_interval(&self) -> Duration {
        Duration::from_secs(self.touch_interval_secs)
    }
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// WebSocket engine configuration (C8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// De-duplication cache TTL for `update_api_key`-style intents.
    #[serde(default = "default_dedup_cache_ttl")]
    pub dedup_cache_ttl_secs: u64,

    /// Interval between cache-janitor sweeps of the de-dup cache.
    #[serde(default = "default_dedup_cleanup_interval")]
    pub dedup_cleanup_interval_secs: u64,

    /// How often (in inbound frames worth of continuous chatter) the engine
    /// re-verifies the token mid-socket.
    #[serde(default = "default_reverify_interval")]
    pub reverify_interval_secs: u64,
}

impl WebSocketConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
    pub fn dedup_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_cache_ttl_secs)
    }
    pub fn dedup_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.dedup_cleanup_interval_secs)
    }
    pub fn reverify_interval(&self) -> Duration {
        Duration::from_secs(self.reverify_interval_secs)
    }
}

/// Reaper configuration (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval_days")]
    pub interval_days: u64,

    #[serde(default = "default_max_inactive_days")]
    pub max_inactive_days: u64,
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_days * 86_400)
    }
    pub fn max_inactive(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_inactive_days as i64)
    }
}

/// Upstream forwarder configuration (C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    #[serde(default = "default_circuit_recovery_timeout_secs")]
    pub circuit_recovery_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ForwarderConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
    pub fn circuit_recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_recovery_timeout_secs)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Ambient HTTP middleware configuration (body limit, CORS mode, etc).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,

    #[serde(default = "default_true")]
    pub catch_panic: bool,

    #[serde(default = "default_true")]
    pub compression: bool,

    #[serde(default = "default_cors_mode")]
    pub cors_mode: String,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            body_limit_mb: default_body_limit_mb(),
            catch_panic: true,
            compression: true,
            cors_mode: default_cors_mode(),
        }
    }
}

// Default value functions

fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_environment() -> String {
    "dev".to_string()
}
fn default_replica_host() -> String {
    "127.0.0.1".to_string()
}
fn default_kv_max_connections() -> usize {
    1000
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    2
}
fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}
fn default_token_expiry_minutes() -> i64 {
    30
}
fn default_session_timeout() -> u64 {
    3600
}
fn default_cache_ttl() -> u64 {
    30
}
fn default_touch_interval() -> u64 {
    30
}
fn default_flush_interval_ms() -> u64 {
    100
}
fn default_ping_interval() -> u64 {
    25
}
fn default_pong_timeout() -> u64 {
    30
}
fn default_inactivity_timeout() -> u64 {
    60
}
fn default_dedup_cache_ttl() -> u64 {
    300
}
fn default_dedup_cleanup_interval() -> u64 {
    60
}
fn default_reverify_interval() -> u64 {
    60
}
fn default_reaper_interval_days() -> u64 {
    1
}
fn default_max_inactive_days() -> u64 {
    365
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_retry_max_delay_ms() -> u64 {
    10000
}
fn default_circuit_failure_threshold() -> u32 {
    5
}
fn default_circuit_recovery_timeout_secs() -> u64 {
    30
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_body_limit_mb() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_cors_mode() -> String {
    "permissive".to_string()
}

impl Config {
    /// Load configuration from all sources, inferring the service name from
    /// the binary name.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "gateway-edge".to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name.
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new();

        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("GATEWAY_").split("_"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration from a specific file, bypassing XDG directories.
    /// Useful for testing or non-standard deployments.
    pub fn load_from(path: &str) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("GATEWAY_").split("_"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration purely from defaults merged with the given
    /// serializable overrides — used by tests that construct a `Config`
    /// in-process rather than from a file.
    pub fn from_defaults(overrides: impl Serialize) -> Result<Self> {
        Figment::new()
            .merge(Serialized::defaults(overrides))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("config.toml"));

        let xdg_dirs = xdg::BaseDirectories::with_prefix("gateway-edge");
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Ok(path) = xdg_dirs.place_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc/gateway-edge").join(service_name).join("config.toml"));

        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            service: ServiceConfig {
                name: "gateway-edge".into(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                environment: default_environment(),
                replica_host: default_replica_host(),
                replica_port: default_port(),
            },
            kv: KvConfig {
                url: "redis://127.0.0.1:6379".into(),
                max_connections: default_kv_max_connections(),
                connection_timeout_secs: default_connection_timeout(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay(),
            },
            credentials: CredentialConfig {
                secret: "test-secret".into(),
                algorithm: default_jwt_algorithm(),
                issuer: None,
                audience: None,
                token_expiry_minutes: default_token_expiry_minutes(),
            },
            session: SessionConfig {
                timeout_secs: default_session_timeout(),
                cache_ttl_secs: default_cache_ttl(),
                touch_interval_secs: default_touch_interval(),
                flush_interval_ms: default_flush_interval_ms(),
            },
            websocket: WebSocketConfig {
                ping_interval_secs: default_ping_interval(),
                pong_timeout_secs: default_pong_timeout(),
                inactivity_timeout_secs: default_inactivity_timeout(),
                dedup_cache_ttl_secs: default_dedup_cache_ttl(),
                dedup_cleanup_interval_secs: default_dedup_cleanup_interval(),
                reverify_interval_secs: default_reverify_interval(),
            },
            reaper: ReaperConfig {
                interval_days: default_reaper_interval_days(),
                max_inactive_days: default_max_inactive_days(),
            },
            forwarder: ForwarderConfig {
                retry_max_attempts: default_retry_max_attempts(),
                retry_base_delay_ms: default_retry_base_delay_ms(),
                retry_max_delay_ms: default_retry_max_delay_ms(),
                circuit_failure_threshold: default_circuit_failure_threshold(),
                circuit_recovery_timeout_secs: default_circuit_recovery_timeout_secs(),
                request_timeout_secs: default_request_timeout_secs(),
            },
            middleware: MiddlewareConfig::default(),
        }
    }

    #[test]
    fn gateway_id_combines_host_and_port() {
        let config = sample();
        assert_eq!(config.service.gateway_id(), "127.0.0.1:8080");
    }

    #[test]
    fn defaults_match_spec() {
        let config = sample();
        assert_eq!(config.websocket.ping_interval_secs, 25);
        assert_eq!(config.websocket.pong_timeout_secs, 30);
        assert_eq!(config.websocket.inactivity_timeout_secs, 60);
        assert_eq!(config.websocket.dedup_cache_ttl_secs, 300);
        assert_eq!(config.session.touch_interval_secs, 30);
        assert_eq!(config.forwarder.circuit_failure_threshold, 5);
        assert_eq!(config.reaper.max_inactive_days, 365);
    }

    #[test]
    fn load_from_missing_file_falls_back_to_env_and_defaults() {
        std::env::set_var("GATEWAY_SERVICE_NAME", "test-svc");
        std::env::set_var("GATEWAY_KV_URL", "redis://localhost:6379");
        std::env::set_var("GATEWAY_CREDENTIALS_SECRET", "env-secret");
        let config = Config::load_from("/nonexistent/config.toml");
        assert!(config.is_ok());
        let config = config.unwrap();
        assert_eq!(config.service.name, "test-svc");
        assert_eq!(config.credentials.secret, "env-secret");
    }
}
