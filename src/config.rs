//! Configuration loading, defaults, and validation.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** - `KUBETUNNEL_ENDPOINT`,
//!    `KUBETUNNEL_BOOTSTRAP_TOKEN`, `KUBETUNNEL_CLUSTER_NAME`,
//!    `KUBETUNNEL_LISTEN`, `KUBETUNNEL_API_KEY`
//! 2. **Config file** - path via `--config <path>`, or `kubetunnel.toml` in CWD
//! 3. **Compiled defaults** - see each field's default value below
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [agent]
//! endpoint = "https://dashboard.example.com"
//! cluster_name = "prod-eu-1"
//! bootstrap_token = "one-time-token"      # first start only
//! # cluster_id = "..."                    # set after registration
//! # token = "..."                         # permanent credential
//! credentials_file = "/var/lib/kubetunnel/credentials.json"
//! outbound_queue = 256
//! request_concurrency = 64                 # proxied requests served at once
//! # health_listen = "0.0.0.0:8081"         # tunnel status for liveness probes
//!
//! [tunnel]
//! max_message_size = 16777216              # 16 MB
//! backoff_base_ms = 1000
//! backoff_cap_ms = 60000
//! heartbeat_interval_secs = 30             # dashboard -> agent ping
//! heartbeat_timeout_secs = 90              # evict agent after this long without pong
//! request_timeout_secs = 30
//!
//! [dashboard]
//! listen = "0.0.0.0:8080"
//! bootstrap_tokens = ["one-time-token"]
//!
//! [hub]
//! ping_interval_secs = 54                  # must be < pong_wait_secs
//! pong_wait_secs = 60
//! write_wait_secs = 10
//! max_message_size = 4096
//! send_queue = 256
//!
//! [auth.tokens]
//! admin = "browser-secret"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::Backoff;

/// Default config file looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "kubetunnel.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("hub.ping_interval_secs ({ping}s) must be shorter than hub.pong_wait_secs ({pong}s)")]
    LivenessOrder { ping: u64, pong: u64 },
    #[error("tunnel.backoff_base_ms must be greater than zero")]
    ZeroBackoffBase,
    #[error("tunnel.backoff_base_ms ({base}) exceeds tunnel.backoff_cap_ms ({cap})")]
    BackoffBaseAboveCap { base: u64, cap: u64 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("agent needs either bootstrap_token or both cluster_id and token")]
    MissingCredentials,
    #[error("agent.endpoint is not set")]
    MissingEndpoint,
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Agent-side settings: where to connect and with which credential.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Dashboard base URL (`http(s)://host[:port]`).
    #[serde(default)]
    pub endpoint: String,
    /// Display name sent with registration.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// One-time registration token. Ignored once `cluster_id`/`token` are known.
    pub bootstrap_token: Option<String>,
    /// Cluster id assigned by the dashboard at registration.
    pub cluster_id: Option<String>,
    /// Permanent credential assigned by the dashboard at registration.
    pub token: Option<String>,
    /// Where registered credentials are stored across restarts.
    pub credentials_file: Option<String>,
    /// Capacity of the responses/events queue feeding the tunnel writer (default 256).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Maximum proxied requests handled concurrently (default 64).
    #[serde(default = "default_request_concurrency")]
    pub request_concurrency: usize,
    /// Optional address for the agent's `GET /api/health` (tunnel status).
    pub health_listen: Option<String>,
}

/// Tunnel transport and reconnect settings, shared by agent and dashboard.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Maximum tunnel frame size in bytes (default 16 MB).
    #[serde(default = "default_tunnel_max_message_size")]
    pub max_message_size: usize,
    /// Reconnect backoff base in milliseconds (default 1000).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Reconnect backoff cap in milliseconds (default 60 000).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Seconds between dashboard heartbeat pings (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds without a pong before the dashboard drops an agent (default 90).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Seconds the dashboard waits for a proxied request's response (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Dashboard HTTP listener and agent bootstrap tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// One-time tokens agents may redeem at registration.
    #[serde(default)]
    pub bootstrap_tokens: Vec<String>,
}

/// Subscriber hub liveness and buffering.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Seconds between server pings to an idle browser session (default 54).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Seconds a session may stay silent before it is closed (default 60).
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,
    /// Per-frame write deadline in seconds (default 10).
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,
    /// Maximum inbound control frame size in bytes (default 4096).
    #[serde(default = "default_hub_max_message_size")]
    pub max_message_size: usize,
    /// Outbound queue capacity per session (default 256).
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
}

/// Browser-facing authentication.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Principal name -> bearer token. Override/extend with `KUBETUNNEL_API_KEY`
    /// (registered as principal `admin`).
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_cluster_name() -> String {
    "default".to_string()
}
fn default_outbound_queue() -> usize {
    256
}
fn default_request_concurrency() -> usize {
    64
}
fn default_tunnel_max_message_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_cap_ms() -> u64 {
    60_000
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_request_timeout() -> u64 {
    30
}
fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_ping_interval() -> u64 {
    54
}
fn default_pong_wait() -> u64 {
    60
}
fn default_write_wait() -> u64 {
    10
}
fn default_hub_max_message_size() -> usize {
    4096
}
fn default_send_queue() -> usize {
    256
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            cluster_name: default_cluster_name(),
            bootstrap_token: None,
            cluster_id: None,
            token: None,
            credentials_file: None,
            outbound_queue: default_outbound_queue(),
            request_concurrency: default_request_concurrency(),
            health_listen: None,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_tunnel_max_message_size(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bootstrap_tokens: Vec::new(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            pong_wait_secs: default_pong_wait(),
            write_wait_secs: default_write_wait(),
            max_message_size: default_hub_max_message_size(),
            send_queue: default_send_queue(),
        }
    }
}

impl TunnelConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::ZeroBackoffBase);
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(ConfigError::BackoffBaseAboveCap {
                base: self.backoff_base_ms,
                cap: self.backoff_cap_ms,
            });
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Zero("tunnel.max_message_size"));
        }
        Ok(())
    }
}

impl HubConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    /// A ping interval at or above the liveness deadline would let a healthy
    /// session time out before it is ever pinged.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_interval_secs == 0 {
            return Err(ConfigError::Zero("hub.ping_interval_secs"));
        }
        if self.ping_interval_secs >= self.pong_wait_secs {
            return Err(ConfigError::LivenessOrder {
                ping: self.ping_interval_secs,
                pong: self.pong_wait_secs,
            });
        }
        if self.send_queue == 0 {
            return Err(ConfigError::Zero("hub.send_queue"));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Zero("hub.max_message_size"));
        }
        Ok(())
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        let registered = self.cluster_id.is_some() && self.token.is_some();
        if !registered && self.bootstrap_token.is_none() && self.credentials_file.is_none() {
            return Err(ConfigError::MissingCredentials);
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::Zero("agent.outbound_queue"));
        }
        if self.request_concurrency == 0 {
            return Err(ConfigError::Zero("agent.request_concurrency"));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `kubetunnel.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = var("KUBETUNNEL_ENDPOINT") {
            self.agent.endpoint = endpoint;
        }
        if let Some(token) = var("KUBETUNNEL_BOOTSTRAP_TOKEN") {
            self.agent.bootstrap_token = Some(token);
        }
        if let Some(name) = var("KUBETUNNEL_CLUSTER_NAME") {
            self.agent.cluster_name = name;
        }
        if let Some(listen) = var("KUBETUNNEL_LISTEN") {
            self.dashboard.listen = listen;
        }
        if let Some(key) = var("KUBETUNNEL_API_KEY") {
            self.auth.tokens.insert("admin".to_string(), key);
        }
    }

    /// Checks needed by the agent subcommand.
    pub fn validate_agent(&self) -> Result<(), ConfigError> {
        self.tunnel.validate()?;
        self.agent.validate()
    }

    /// Checks needed by the dashboard subcommand.
    pub fn validate_dashboard(&self) -> Result<(), ConfigError> {
        self.tunnel.validate()?;
        self.hub.validate()?;
        if self.tunnel.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Zero("tunnel.heartbeat_interval_secs"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid_for_dashboard() {
        let config = Config::default();
        config.validate_dashboard().unwrap();
        assert_eq!(config.hub.ping_interval(), Duration::from_secs(54));
        assert_eq!(config.tunnel.backoff().delay(6), Duration::from_secs(60));
    }

    #[test]
    fn test_ping_interval_must_be_below_pong_wait() {
        let hub = HubConfig {
            ping_interval_secs: 60,
            pong_wait_secs: 60,
            ..HubConfig::default()
        };
        assert!(matches!(
            hub.validate(),
            Err(ConfigError::LivenessOrder { ping: 60, pong: 60 })
        ));
    }

    #[test]
    fn test_backoff_base_above_cap_rejected() {
        let tunnel = TunnelConfig {
            backoff_base_ms: 5000,
            backoff_cap_ms: 1000,
            ..TunnelConfig::default()
        };
        assert!(matches!(
            tunnel.validate(),
            Err(ConfigError::BackoffBaseAboveCap { .. })
        ));
    }

    #[test]
    fn test_agent_requires_some_credential() {
        let agent = AgentConfig {
            endpoint: "http://dash:8080".into(),
            ..AgentConfig::default()
        };
        assert!(matches!(
            agent.validate(),
            Err(ConfigError::MissingCredentials)
        ));

        let agent = AgentConfig {
            bootstrap_token: Some("once".into()),
            ..agent
        };
        agent.validate().unwrap();
    }

    #[test]
    fn test_parse_toml_and_env_overrides() {
        let mut config = Config::parse(
            r#"
            [agent]
            endpoint = "http://dash:8080"
            cluster_name = "edge"
            cluster_id = "c-1"
            token = "perm"

            [hub]
            ping_interval_secs = 5
            pong_wait_secs = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.cluster_name, "edge");
        assert_eq!(config.hub.pong_wait_secs, 10);
        assert_eq!(config.hub.send_queue, 256);

        config.apply_env(|key| match key {
            "KUBETUNNEL_CLUSTER_NAME" => Some("override".to_string()),
            "KUBETUNNEL_API_KEY" => Some("secret".to_string()),
            _ => None,
        });
        assert_eq!(config.agent.cluster_name, "override");
        assert_eq!(config.auth.tokens.get("admin").map(String::as_str), Some("secret"));
        config.validate_agent().unwrap();
        config.validate_dashboard().unwrap();
    }
}
