//! Broker configuration, loaded from TOML.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

fn default_backlog() -> u32 {
    128
}

fn default_qos0_queue_depth() -> usize {
    1024
}

fn default_qos12_queue_depth() -> usize {
    1024
}

/// Top-level configuration for the Strato broker.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// One listener stack. TLS wraps the socket when `tls` is present;
/// `websocket` layers an upgrade on top of whichever byte stream is below.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub bind: String,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default)]
    pub websocket: bool,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_chain: PathBuf,
    pub private_key: PathBuf,
    /// Trust anchors for optional client authentication. When set, client
    /// certificates are requested and the presented chain is exposed via
    /// connection info.
    #[serde(default)]
    pub client_ca: Option<PathBuf>,
    #[serde(default)]
    pub alpn: Vec<String>,
}

/// Per-session outbound queue bounds. QoS 0 overflow drops silently per
/// the MQTT contract; QoS 1/2 overflow tears the session's connection down.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_qos0_queue_depth")]
    pub qos0_queue_depth: usize,
    #[serde(default = "default_qos12_queue_depth")]
    pub qos12_queue_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            qos0_queue_depth: default_qos0_queue_depth(),
            qos12_queue_depth: default_qos12_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// `tracing` filter directive, e.g. `info` or `strato=debug`.
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&data)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            bail!("configuration declares no listeners");
        }
        for listener in &self.listeners {
            listener
                .bind
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("invalid listener bind address {}", listener.bind))?;
            if listener.backlog == 0 {
                bail!("listener {} has a zero accept backlog", listener.bind);
            }
        }
        if self.limits.qos12_queue_depth == 0 {
            bail!("qos12_queue_depth must be positive");
        }
        Ok(())
    }
}
