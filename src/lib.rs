//! Coach Broker
//!
//! A real-time messaging hub for the coaching app:
//! - UI clients send chat requests, a worker streams replies back
//! - Chats are queued while no worker is connected and flushed in order
//! - Clients reconnect with exponential backoff and correlate streamed
//!   replies by request id

pub mod api;
pub mod client;
pub mod hub;
pub mod protocol;

use anyhow::{Context, Result};
use client::BackoffPolicy;
use hub::{Hub, HubConfig, HubHandle};
use protocol::DEFAULT_STREAM_WINDOW;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: ServerYamlConfig,
    pub hub: HubYamlConfig,
    pub queue: QueueYamlConfig,
    pub client: ClientYamlConfig,
}

/// Server configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerYamlConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerYamlConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8765,
        }
    }
}

/// Hub configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubYamlConfig {
    pub ping_interval_secs: u64,
    pub stream_window: usize,
}

impl Default for HubYamlConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            stream_window: DEFAULT_STREAM_WINDOW,
        }
    }
}

/// Offline queue section. No `max_depth` means unbounded.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct QueueYamlConfig {
    pub max_depth: Option<usize>,
}

/// Client section (used by the `chat` and `worker` subcommands)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientYamlConfig {
    pub hub_url: String,
    pub base_delay_ms: u64,
    pub cap_exponent: u32,
    pub max_attempts: u32,
    pub request_timeout_secs: u64,
}

impl Default for ClientYamlConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:8765/ws".into(),
            base_delay_ms: 2000,
            cap_exponent: 4,
            max_attempts: 10,
            request_timeout_secs: 120,
        }
    }
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub ping_interval: Duration,
    pub stream_window: usize,
    /// Offline queue limit, `None` = unbounded
    pub queue_max_depth: Option<usize>,
    pub hub_url: String,
    pub backoff: BackoffPolicy,
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_yaml(YamlConfig::default())
    }
}

impl Config {
    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD. If the file doesn't
    /// exist, falls back to pure env var / defaults.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let mut yaml = Self::load_yaml(yaml_path);

        if let Ok(host) = std::env::var("BROKER_HOST") {
            yaml.server.host = host;
        }
        if let Some(port) = env_parse("BROKER_PORT")? {
            yaml.server.port = port;
        }
        if let Some(secs) = env_parse("BROKER_PING_INTERVAL_SECS")? {
            yaml.hub.ping_interval_secs = secs;
        }
        if let Some(depth) = env_parse("BROKER_QUEUE_MAX_DEPTH")? {
            yaml.queue.max_depth = Some(depth);
        }
        if let Ok(url) = std::env::var("BROKER_HUB_URL") {
            yaml.client.hub_url = url;
        }
        if let Some(attempts) = env_parse("BROKER_MAX_RECONNECT_ATTEMPTS")? {
            yaml.client.max_attempts = attempts;
        }
        if let Some(secs) = env_parse("BROKER_REQUEST_TIMEOUT_SECS")? {
            yaml.client.request_timeout_secs = secs;
        }

        Ok(Self::from_yaml(yaml))
    }

    fn from_yaml(yaml: YamlConfig) -> Self {
        Self {
            server_host: yaml.server.host,
            server_port: yaml.server.port,
            // zero would make the ping interval panic
            ping_interval: Duration::from_secs(yaml.hub.ping_interval_secs.max(1)),
            stream_window: yaml.hub.stream_window,
            queue_max_depth: yaml.queue.max_depth,
            hub_url: yaml.client.hub_url,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(yaml.client.base_delay_ms),
                cap_exponent: yaml.client.cap_exponent,
                max_attempts: yaml.client.max_attempts,
            },
            request_timeout: Duration::from_secs(yaml.client.request_timeout_secs),
        }
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_max_depth: self.queue_max_depth,
            stream_window: self.stream_window,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

/// Parse an optional env var, failing loudly on garbage instead of
/// silently falling back
fn env_parse<T>(var: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {var}: {raw:?}")),
        Err(_) => Ok(None),
    }
}

// ============================================================================
// Server
// ============================================================================

/// A running hub server
pub struct BrokerServer {
    pub addr: SocketAddr,
    pub hub: HubHandle,
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl BrokerServer {
    /// WebSocket URL clients should connect to
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Stop accepting connections, stop the hub and wait for the server task
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.hub.stop();
        self.task
            .await
            .context("server task panicked")?
            .context("server error")
    }
}

/// Start the hub and serve it on an already bound listener
pub async fn start_server_on(listener: TcpListener, config: &Config) -> Result<BrokerServer> {
    let addr = listener.local_addr()?;
    let hub = Hub::start(config.hub_config());
    let state = Arc::new(api::ServerState {
        hub: hub.clone(),
        ping_interval: config.ping_interval,
    });
    let app = api::create_router(state);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
    });

    tracing::info!(%addr, "Hub listening (routes: /ws, /health)");
    Ok(BrokerServer {
        addr,
        hub,
        shutdown,
        task,
    })
}

/// Bind the configured address and serve until Ctrl-C
pub async fn start_server(config: Config) -> Result<()> {
    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let server = start_server_on(listener, &config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    server.shutdown().await
}

// ============================================================================
// Tests
// ============================================================================
