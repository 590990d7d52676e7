//! Camera connection configuration.
//!
//! Settings come from compiled-in defaults, then an optional key = value
//! config file, then command-line flags (applied by `main`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::error::{CamError, Result};

// Defaults
const HOST:             &str = "192.168.0.103";
const PORT:             u16  = 8080;
const TIMEOUT_SECS:     u64  = 10;
const POLL_INTERVAL_MS: u64  = 0;

/// Where and as whom to reach the camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host:     String,
    pub port:     u16,
    /// Empty means no HTTP basic auth.
    pub username: String,
    pub password: String,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host:     host.into(),
            port,
            username: String::new(),
            password: String::new(),
        }
    }

    /// `http://host:port/`, the base every endpoint path is joined onto.
    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&format!("http://{}:{}/", self.host, self.port))?;
        Ok(url)
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(HOST, PORT)
    }
}

/// Full client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    /// Per-request timeout. Does not apply to the video stream.
    pub timeout: Duration,
    /// Delay between sensor polls. Zero polls back to back.
    pub poll_interval: Duration,
    /// File the preview loop writes the latest annotated frame to.
    pub preview_file: PathBuf,
    pub log_syslog: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection:    ConnectionConfig::default(),
            timeout:       Duration::from_secs(TIMEOUT_SECS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            preview_file:  PathBuf::from("/tmp/ipcam/preview.jpg"),
            log_syslog:    false,
        }
    }
}

/// Parse `path` as a key = value configuration file.
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| CamError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_config(&content)
}

fn parse_config(content: &str) -> Result<ClientConfig> {
    let mut cfg = ClientConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, val)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let val = val.trim().to_string();
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "host" | "ip"      => cfg.connection.host     = val,
            "port"             => cfg.connection.port     = parse_num(&key, &val)?,
            "username"         => cfg.connection.username = val,
            "password"         => cfg.connection.password = val,
            "timeout_secs"     => cfg.timeout             = Duration::from_secs(parse_num(&key, &val)?),
            "poll_interval_ms" => cfg.poll_interval       = Duration::from_millis(parse_num(&key, &val)?),
            "preview_file"     => cfg.preview_file        = PathBuf::from(&val),
            "log_syslog"       => cfg.log_syslog          = val == "true" || val == "1" || val == "yes",
            _ => {} // ignore unknown keys
        }
    }

    Ok(cfg)
}

fn parse_num<T: std::str::FromStr>(key: &str, val: &str) -> Result<T> {
    val.parse()
        .map_err(|_| CamError::Config(format!("{key}: not a number: {val}")))
}

/// Validate that required fields are populated.
pub fn validate_config(cfg: &ClientConfig) -> Result<()> {
    if cfg.connection.host.trim().is_empty() {
        return Err(CamError::Config("host is required".into()));
    }
    if cfg.connection.port == 0 {
        return Err(CamError::Config("port must be non-zero".into()));
    }
    if cfg.timeout.is_zero() {
        return Err(CamError::Config("timeout_secs must be non-zero".into()));
    }
    cfg.connection
        .base_url()
        .map_err(|e| CamError::Config(format!("host {}: {e}", cfg.connection.host)))?;
    Ok(())
}
