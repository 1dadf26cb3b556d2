//! Configuration management for Hivelimit.
//!
//! Configuration is read from an optional YAML file and layered under
//! environment variables of the form `HIVELIMIT__SECTION__FIELD`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::RootKey;
use crate::error::{HivelimitError, Result};
use crate::mesh::ClusterConfig;
use crate::ratelimit::{Consistency, FastSettings, LimiterSettings, UnavailablePolicy};

/// Main configuration for the Hivelimit service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HivelimitConfig {
    pub server: ServerConfig,
    pub rate_limiting: RateLimitingConfig,
    pub fast: FastConfig,
    pub cluster: ClusterSection,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP API address
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// When false every request is admitted without counting
    pub enabled: bool,

    /// Strategy for requests that do not choose one
    pub default_consistency: Consistency,

    pub unavailable_policy: UnavailablePolicy,

    /// Attempts per store operation before giving up
    pub retry_attempts: u32,

    /// Base retry delay in milliseconds
    pub retry_backoff_ms: u64,

    /// How long a counter outlives its window before it is purged
    pub counter_grace_period_ms: u64,

    pub sweep_interval_secs: u64,

    /// Override lookup cache TTL in milliseconds; zero disables the cache
    pub override_cache_ttl_ms: u64,

    pub override_cache_capacity: u64,

    /// Path to the override records file
    pub overrides_path: Option<String>,

    /// Override records reload interval in seconds
    pub overrides_reload_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_consistency: Consistency::Fast,
            unavailable_policy: UnavailablePolicy::FailOpen,
            retry_attempts: 3,
            retry_backoff_ms: 10,
            counter_grace_period_ms: 60_000,
            sweep_interval_secs: 30,
            override_cache_ttl_ms: 5_000,
            override_cache_capacity: 10_000,
            overrides_path: None,
            overrides_reload_interval_secs: 60,
        }
    }
}

impl RateLimitingConfig {
    pub fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            default_consistency: self.default_consistency,
            unavailable_policy: self.unavailable_policy,
            retry_attempts: self.retry_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn override_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.override_cache_ttl_ms)
    }

    pub fn overrides_reload_interval(&self) -> Duration {
        Duration::from_secs(self.overrides_reload_interval_secs)
    }
}

/// Fast strategy propagation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FastConfig {
    pub flush_interval_ms: u64,
    pub max_batch_size: usize,
    pub shutdown_flush_timeout_ms: u64,
}

impl Default for FastConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 250,
            max_batch_size: 512,
            shutdown_flush_timeout_ms: 2_000,
        }
    }
}

impl FastConfig {
    pub fn settings(&self, grace_ms: u64) -> FastSettings {
        FastSettings {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            max_batch_size: self.max_batch_size,
            shutdown_timeout: Duration::from_millis(self.shutdown_flush_timeout_ms),
            grace_ms,
        }
    }
}

/// Peer mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub enabled: bool,

    /// Defaults to a random UUID
    pub node_id: Option<String>,

    /// Gossip listen address
    pub listen_addr: Option<SocketAddr>,

    /// Gossip address advertised to peers; defaults to `listen_addr`
    pub advertise_addr: Option<SocketAddr>,

    /// HTTP address peers use to forward counter commands; defaults to
    /// `server.http_addr`
    pub http_advertise_addr: Option<SocketAddr>,

    pub seed_nodes: Vec<String>,

    pub cluster_id: String,

    pub gossip_interval_ms: u64,

    pub dead_node_grace_period_secs: u64,

    /// Timeout for forwarding a counter command to its owner
    pub forward_timeout_ms: u64,

    /// Shared secret for the internal counter endpoint
    pub secret: Option<String>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            listen_addr: None,
            advertise_addr: None,
            http_advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: "hivelimit".to_string(),
            gossip_interval_ms: 100,
            dead_node_grace_period_secs: 3_600,
            forward_timeout_ms: 500,
            secret: None,
        }
    }
}

impl ClusterSection {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    /// Gossip address peers will dial.
    fn effective_advertise_addr(&self) -> Option<SocketAddr> {
        self.advertise_addr.or(self.listen_addr)
    }

    /// HTTP address peers will forward to when the server binds `http_addr`.
    fn effective_http_advertise_addr(&self, http_addr: SocketAddr) -> SocketAddr {
        self.http_advertise_addr.unwrap_or(http_addr)
    }

    /// Build the mesh configuration for a server bound to `http_addr`.
    pub fn to_cluster_config(&self, http_addr: SocketAddr) -> Result<ClusterConfig> {
        let listen_addr = self.listen_addr.ok_or_else(|| {
            HivelimitError::Config(
                "cluster.listen_addr is required when the cluster is enabled".to_string(),
            )
        })?;

        let defaults = ClusterConfig::default();
        Ok(ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(listen_addr),
            http_advertise_addr: Some(self.effective_http_advertise_addr(http_addr)),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
        })
    }
}

/// API credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub root_keys: Vec<RootKey>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl HivelimitConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("HIVELIMIT")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("cluster.seed_nodes")
                .try_parsing(true),
        );

        let config: HivelimitConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: HivelimitConfig =
            serde_yaml::from_str(yaml).map_err(|e| HivelimitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        let cluster = &self.cluster;
        let unroutable = |addr: Option<SocketAddr>| {
            cluster.enabled && addr.is_some_and(|addr| addr.ip().is_unspecified())
        };
        let checks = [
            (rl.sweep_interval_secs == 0, "rate_limiting.sweep_interval_secs must be positive"),
            (
                rl.overrides_reload_interval_secs == 0,
                "rate_limiting.overrides_reload_interval_secs must be positive",
            ),
            (self.fast.flush_interval_ms == 0, "fast.flush_interval_ms must be positive"),
            (self.fast.max_batch_size == 0, "fast.max_batch_size must be positive"),
            (
                self.cluster.enabled && self.cluster.gossip_interval_ms == 0,
                "cluster.gossip_interval_ms must be positive",
            ),
            (
                self.cluster.enabled && self.cluster.listen_addr.is_none(),
                "cluster.listen_addr is required when the cluster is enabled",
            ),
            (
                unroutable(cluster.effective_advertise_addr()),
                "cluster.advertise_addr must be routable when listen_addr is unspecified",
            ),
            (
                unroutable(Some(cluster.effective_http_advertise_addr(self.server.http_addr))),
                "cluster.http_advertise_addr must be routable when server.http_addr is unspecified",
            ),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(HivelimitError::Config(message.to_string())),
            None => Ok(()),
        }
    }
}
