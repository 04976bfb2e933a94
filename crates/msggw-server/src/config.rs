//! Server configuration: TOML file + CLI overrides.

use crate::transport::TcpFraming;
use msggw_core::token::generate_secret;
use msggw_core::{GatewayError, GatewayResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub keepalive: KeepaliveSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    /// `0` disables the TCP listener.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default)]
    pub write_buffer_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: i64,
    #[serde(default = "default_max_conn_num")]
    pub max_conn_num: usize,
    #[serde(default)]
    pub tcp_framing: TcpFraming,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            ws_port: default_ws_port(),
            tcp_port: default_tcp_port(),
            handshake_timeout_secs: default_handshake_timeout(),
            write_buffer_size: 0,
            max_message_size: default_max_message_size(),
            max_conn_num: default_max_conn_num(),
            tcp_framing: TcpFraming::default(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC secret shared with the token issuer.
    #[serde(default)]
    pub secret: String,
    /// Token statuses preloaded into the in-memory store.
    #[serde(default)]
    pub tokens: Vec<TokenSeed>,
}

/// One `[[auth.tokens]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenSeed {
    pub user_id: String,
    pub platform_id: i32,
    pub token: String,
    #[serde(default)]
    pub status: i32,
}

/// `[keepalive]` section, used by the default client agent.
#[derive(Debug, Clone, Deserialize)]
pub struct KeepaliveSection {
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,
    #[serde(default = "default_ping_period")]
    pub ping_period_secs: u64,
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,
}

impl Default for KeepaliveSection {
    fn default() -> Self {
        Self {
            pong_wait_secs: default_pong_wait(),
            ping_period_secs: default_ping_period(),
            write_wait_secs: default_write_wait(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_ws_port() -> u16 {
    10001
}
fn default_tcp_port() -> u16 {
    10002
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_max_message_size() -> i64 {
    51200
}
fn default_max_conn_num() -> usize {
    100_000
}
fn default_pong_wait() -> u64 {
    30
}
fn default_ping_period() -> u64 {
    27
}
fn default_write_wait() -> u64 {
    10
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub ws_port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub max_conn_num: Option<usize>,
}

/// Resolved server configuration (secret decoded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub ws_port: u16,
    pub tcp_port: u16,
    pub handshake_timeout: Duration,
    pub write_buffer_size: usize,
    pub max_message_size: i64,
    pub max_conn_num: usize,
    pub tcp_framing: TcpFraming,
    pub secret: Vec<u8>,
    pub token_seeds: Vec<TokenSeed>,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> GatewayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::from_file(file_config, cli)
    }

    /// Resolve a parsed config file.
    pub fn from_file(file: ConfigFile, cli: &CliOverrides) -> GatewayResult<Self> {
        let ConfigFile {
            server,
            auth,
            keepalive,
        } = file;

        if keepalive.ping_period_secs >= keepalive.pong_wait_secs {
            return Err(GatewayError::Config(format!(
                "ping_period_secs ({}) must be less than pong_wait_secs ({})",
                keepalive.ping_period_secs, keepalive.pong_wait_secs
            )));
        }

        let secret = if auth.secret.is_empty() {
            warn!("no auth secret configured, generated a random one; tokens from other processes will not verify");
            generate_secret()?
        } else {
            hex::decode(auth.secret.trim())
                .map_err(|e| GatewayError::Config(format!("auth.secret is not hex: {e}")))?
        };

        Ok(Self {
            bind_addr: server.bind_addr,
            ws_port: cli.ws_port.unwrap_or(server.ws_port),
            tcp_port: cli.tcp_port.unwrap_or(server.tcp_port),
            handshake_timeout: Duration::from_secs(server.handshake_timeout_secs),
            write_buffer_size: server.write_buffer_size,
            max_message_size: server.max_message_size,
            max_conn_num: cli.max_conn_num.unwrap_or(server.max_conn_num),
            tcp_framing: server.tcp_framing,
            secret,
            token_seeds: auth.tokens,
            pong_wait: Duration::from_secs(keepalive.pong_wait_secs),
            ping_period: Duration::from_secs(keepalive.ping_period_secs),
            write_wait: Duration::from_secs(keepalive.write_wait_secs),
        })
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.ws_port)
    }

    /// `None` when the TCP listener is disabled.
    pub fn tcp_addr(&self) -> Option<String> {
        (self.tcp_port != 0).then(|| format!("{}:{}", self.bind_addr, self.tcp_port))
    }
}

fn parse_config(content: &str) -> GatewayResult<ConfigFile> {
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
