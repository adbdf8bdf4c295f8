//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use socketgate_core::{GatewayError, GatewayResult};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub presence: RpcSection,
    #[serde(default)]
    pub broker: RpcSection,
    #[serde(default)]
    pub stats: StatsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ws_port: default_ws_port(),
            control_port: default_control_port(),
        }
    }
}

/// `[registry]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_delivery_capacity")]
    pub delivery_capacity: usize,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            delivery_capacity: default_delivery_capacity(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_cookie")]
    pub cookie: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            cookie: default_cookie(),
        }
    }
}

/// `[presence]` and `[broker]` sections of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcSection {
    /// Base URL; each service has its own default.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// `[stats]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsSection {
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_ws_port() -> u16 {
    10300
}
fn default_control_port() -> u16 {
    10301
}
fn default_delivery_capacity() -> usize {
    16
}
fn default_cookie() -> String {
    "auth".to_string()
}
fn default_presence_url() -> String {
    "http://localhost:10000".to_string()
}
fn default_broker_url() -> String {
    "http://localhost:10100".to_string()
}
fn default_timeout_ms() -> u64 {
    2000
}
fn default_report_interval() -> u64 {
    60
}

/// Resolved server configuration (CLI overrides applied, values checked).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ws_addr: SocketAddr,
    pub control_addr: SocketAddr,
    pub delivery_capacity: usize,
    pub auth_cookie: String,
    pub presence_url: String,
    pub presence_timeout: Duration,
    pub broker_url: String,
    pub broker_timeout: Duration,
    /// `None` disables the periodic stats report.
    pub report_interval: Option<Duration>,
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub ws_port: Option<u16>,
    pub control_port: Option<u16>,
    pub presence_url: Option<String>,
    pub broker_url: Option<String>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> GatewayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> GatewayResult<Self> {
        let bind = cli.bind.unwrap_or(file.server.bind);
        let ip: IpAddr = bind
            .parse()
            .map_err(|e| GatewayError::Config(format!("invalid bind address {bind:?}: {e}")))?;
        let ws_port = cli.ws_port.unwrap_or(file.server.ws_port);
        let control_port = cli.control_port.unwrap_or(file.server.control_port);

        let report_interval = match file.stats.report_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            ws_addr: SocketAddr::new(ip, ws_port),
            control_addr: SocketAddr::new(ip, control_port),
            delivery_capacity: file.registry.delivery_capacity.max(1),
            auth_cookie: file.auth.cookie,
            presence_url: cli
                .presence_url
                .or(file.presence.url)
                .unwrap_or_else(default_presence_url),
            presence_timeout: Duration::from_millis(file.presence.timeout_ms),
            broker_url: cli
                .broker_url
                .or(file.broker.url)
                .unwrap_or_else(default_broker_url),
            broker_timeout: Duration::from_millis(file.broker.timeout_ms),
            report_interval,
        })
    }
}

fn parse(content: &str) -> GatewayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| GatewayError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
