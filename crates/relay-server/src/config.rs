//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - TOML file (`--config`, else the first default path that exists)
//! - Environment variables (`LIVE_RELAY__PORT`, `LIVE_RELAY__RELAY__POLICY`, ...)
//! - Command line arguments

use anyhow::{ensure, Context, Result};
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File, FileFormat};
use live_relay_core::{BroadcastPolicy, MergeStrategy, SessionConfig};
use live_relay_transport::WireFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of configuration environment variables.
const ENV_PREFIX: &str = "LIVE_RELAY";

/// Separator between the prefix and nested keys.
const ENV_SEPARATOR: &str = "__";

/// Paths searched when no config file is given.
const DEFAULT_PATHS: [&str; 3] = [
    "live-relay.toml",
    "/etc/live-relay/live-relay.toml",
    "~/.config/live-relay/live-relay.toml",
];

/// Paths a topic can not be mounted at.
const RESERVED_TOPICS: [&str; 2] = ["health", "ws"];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on. `0` picks a free port.
    #[serde(default)]
    pub port: u16,

    /// Engine configuration.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Who receives the result of an update.
    #[serde(default)]
    pub policy: BroadcastPolicy,

    /// How payloads are merged into content.
    #[serde(default)]
    pub merge: MergeStrategy,

    /// Outbound messages buffered per connection.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Time allowed for one write to a client, in milliseconds.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Wire format spoken on every endpoint.
    #[serde(default)]
    pub format: WireFormat,

    /// Topics mounted at `/<topic>`.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Accept any topic at `/ws/<topic>`.
    #[serde(default = "default_true")]
    pub dynamic_topics: bool,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    256
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_topics() -> Vec<String> {
    vec!["markdown".to_string(), "code".to_string()]
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            relay: RelayConfig::default(),
            transport: TransportConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            policy: BroadcastPolicy::default(),
            merge: MergeStrategy::default(),
            queue_capacity: default_queue_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::default(),
            topics: default_topics(),
            dynamic_topics: true,
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl RelayConfig {
    /// Session tuning derived from this configuration.
    #[must_use]
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            queue_capacity: self.queue_capacity,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the first default path that
    /// exists, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read or parsed, or the
    /// result is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let path = path.map(Path::to_path_buf).or_else(find_config_file);
        if let Some(path) = &path {
            tracing::debug!(path = %path.display(), "Loading config file");
            builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Toml));
        }

        Self::build(builder, None)
            .with_context(|| match &path {
                Some(path) => format!("Invalid configuration in {}", path.display()),
                None => "Invalid configuration".to_string(),
            })
    }

    /// Finish loading: apply environment overrides, deserialize, validate.
    ///
    /// `env` replaces the process environment when given.
    fn build(
        builder: ConfigBuilder<DefaultState>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("transport.topics")
            .source(env);

        let config: Config = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would break the server at runtime.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.relay.queue_capacity > 0, "relay.queue_capacity must be positive");
        ensure!(self.relay.send_timeout_ms > 0, "relay.send_timeout_ms must be positive");
        ensure!(
            self.transport.max_message_size > 0,
            "transport.max_message_size must be positive"
        );

        for topic in &self.transport.topics {
            ensure!(!topic.is_empty(), "transport.topics contains an empty topic");
            ensure!(
                !topic.contains(['/', ':', '*']),
                "topic {topic:?} can not be used as a path"
            );
            ensure!(
                !RESERVED_TOPICS.contains(&topic.as_str()),
                "topic {topic:?} is reserved"
            );
        }
        Ok(())
    }
}

fn find_config_file() -> Option<PathBuf> {
    DEFAULT_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}
