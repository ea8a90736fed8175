//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`courier.toml`, `/etc/courier/courier.toml`,
//!   `~/.config/courier/courier.toml`, or an explicit `--config` path)
//! - Environment variables (`COURIER__PORT`, `COURIER__BROKER__ACK_TIMEOUT_MS`, ...)

use anyhow::{Context, Result};
use courier_core::BrokerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Default configuration file locations, first match wins.
const CONFIG_PATHS: [&str; 3] = [
    "courier.toml",
    "/etc/courier/courier.toml",
    "~/.config/courier/courier.toml",
];

/// Environment variable prefix; nested keys are separated by `__`.
const ENV_PREFIX: &str = "COURIER";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Delivery engine settings.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Admin HTTP endpoints.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Queues declared at startup.
    #[serde(default)]
    pub queues: Vec<QueueDefinition>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Per-connection read buffer size in bytes.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Disable Nagle's algorithm.
    #[serde(default = "default_true")]
    pub nodelay: bool,
}

/// Admin HTTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Serve `/health` and `/stats`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Admin port.
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// A queue declared from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    /// Queue name.
    pub name: String,
    /// Route pattern.
    pub route: String,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7070
}

fn default_true() -> bool {
    true
}

fn default_read_buffer_size() -> usize {
    8 * 1024 // 8 KB
}

fn default_max_connections() -> usize {
    100_000
}

fn default_admin_port() -> u16 {
    8081
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            broker: BrokerConfig::default(),
            transport: TransportConfig::default(),
            admin: AdminConfig::default(),
            metrics: MetricsConfig::default(),
            queues: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            max_connections: default_max_connections(),
            nodelay: true,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_admin_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first default path that exists, layered
    /// with `COURIER__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let path = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        Self::load_layered(path.as_deref())
    }

    /// Load a specific file layered with environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be parsed.
    pub fn load_from(path: &str) -> Result<Self> {
        let expanded = shellexpand::full(path)
            .with_context(|| format!("Failed to expand config path: {path}"))?;
        if !Path::new(expanded.as_ref()).exists() {
            anyhow::bail!("Config file not found: {expanded}");
        }
        Self::load_layered(Some(expanded.as_ref()))
    }

    fn load_layered(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::new(path, ::config::FileFormat::Toml).required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|layered| layered.try_deserialize())
            .with_context(|| match path {
                Some(path) => format!("Failed to load config file: {path}"),
                None => "Failed to load config from environment".to_string(),
            })
    }

    /// Load configuration from a specific file, without environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind the broker to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.addr_with_port(self.port)
    }

    /// Get the socket address for the admin endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn admin_addr(&self) -> Result<SocketAddr> {
        self.addr_with_port(self.admin.port)
    }

    fn addr_with_port(&self, port: u16) -> Result<SocketAddr> {
        format!("{}:{}", self.host, port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, port))
    }
}
