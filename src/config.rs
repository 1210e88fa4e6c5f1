use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

/// Environment variable naming an optional YAML config file.
pub const CONFIG_FILE_ENV: &str = "SWITCHYARD_CONFIG";

/// Run-surface configuration for a server.
///
/// Values come from the YAML file named by `SWITCHYARD_CONFIG` (if any),
/// then from individual environment variables, which win.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `host:port` to listen on (`LISTEN`)
    pub listen_addr: String,
    /// Accept backlog (`BACKLOG`)
    pub backlog: u32,
    /// Worker processes sharing the socket (`WORKERS`)
    pub workers: usize,
    /// Request timeout in seconds (`REQUEST_TIMEOUT`)
    pub request_timeout: u64,
    /// Ceiling on the bytes of one request (`REQUEST_MAX_SIZE`)
    pub request_max_size: usize,
    /// Allow keep-alive connections (`KEEP_ALIVE`)
    pub keep_alive: bool,
    /// Log one line per response (`ACCESS_LOG`)
    pub access_log: bool,
    /// Verbose logging and detailed fallback errors (`DEBUG`)
    pub debug: bool,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8000".to_string(),
            backlog: 100,
            workers: 1,
            request_timeout: 60,
            request_max_size: 100_000_000,
            keep_alive: true,
            access_log: true,
            debug: false,
            tls: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable lookup instead of the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_FILE_ENV) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Some(addr) = lookup("LISTEN") {
            config.listen_addr = addr;
        }
        if let Some(v) = lookup("WORKERS") {
            config.workers = parse_number("WORKERS", &v)?;
        }
        if let Some(v) = lookup("BACKLOG") {
            config.backlog = parse_number("BACKLOG", &v)?;
        }
        if let Some(v) = lookup("REQUEST_TIMEOUT") {
            config.request_timeout = parse_number("REQUEST_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("REQUEST_MAX_SIZE") {
            config.request_max_size = parse_number("REQUEST_MAX_SIZE", &v)?;
        }
        if let Some(v) = lookup("KEEP_ALIVE") {
            config.keep_alive = parse_flag("KEEP_ALIVE", &v)?;
        }
        if let Some(v) = lookup("ACCESS_LOG") {
            config.access_log = parse_flag("ACCESS_LOG", &v)?;
        }
        if let Some(v) = lookup("DEBUG") {
            config.debug = parse_flag("DEBUG", &v)?;
        }

        if config.workers == 0 {
            return Err(anyhow!("WORKERS must be at least 1"));
        }
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        serde_yaml::from_str(&text).with_context(|| format!("invalid config file {path}"))
    }

    /// Resolves `listen_addr`, accepting host names as well as literal addresses.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .to_socket_addrs()
            .with_context(|| format!("invalid listen address {}", self.listen_addr))?
            .next()
            .ok_or_else(|| anyhow!("listen address {} resolved to nothing", self.listen_addr))
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a number, got {value:?}"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{key} must be true or false, got {value:?}")),
    }
}
