//! Configuration types and loading for tproxy-relay
//!
//! Configuration is loaded from JSON files, validated at startup, and can be
//! overridden through environment variables.
//!
//! # Example
//!
//! ```no_run
//! use tproxy_relay::config::load_config;
//!
//! let config = load_config("/etc/tproxy-relay/config.json").unwrap();
//! println!("Listening on {}", config.listen.address);
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Listen configuration
    #[serde(default)]
    pub listen: ListenConfig,

    /// Redirection rule provisioning
    #[serde(default)]
    pub redirect: RedirectConfig,

    /// Per-connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        for cidr in &self.redirect.bypass_cidrs {
            validate_cidr(cidr)?;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            redirect: RedirectConfig::default(),
            connection: ConnectionConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Listen configuration for the redirected-traffic inbound
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Listen address. Port 0 binds an ephemeral port; the actually-bound
    /// port is what gets written into the redirection rules.
    pub address: SocketAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:0".parse().unwrap(),
        }
    }
}

/// Redirection mode: which firewall hooks send traffic to the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMode {
    /// Redirect only this host's own outgoing traffic (OUTPUT hook)
    Local,
    /// Also redirect forwarded traffic from other hosts (PREROUTING hook)
    Router,
}

/// Redirection rule provisioning configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedirectConfig {
    /// Whether to install redirection rules at startup
    #[serde(default)]
    pub enabled: bool,

    /// Redirection mode
    #[serde(default = "default_redirect_mode")]
    pub mode: RedirectMode,

    /// Extra CIDRs to exclude from redirection, in addition to the built-in
    /// reserved ranges
    #[serde(default)]
    pub bypass_cidrs: Vec<String>,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: RedirectMode::Local,
            bypass_cidrs: Vec::new(),
        }
    }
}

/// Per-connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Timeout for outbound connects, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl ConnectionConfig {
    /// Connect timeout as a `Duration`
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include the log target in output
    #[serde(default)]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

const fn default_connect_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

const fn default_redirect_mode() -> RedirectMode {
    RedirectMode::Local
}

/// Minimal CIDR shape check: `a.b.c.d/len` with len 0-32.
///
/// The kernel-side tooling is the authority on semantics; this only catches
/// typos before they turn into confusing ipset/pfctl failures.
fn validate_cidr(cidr: &str) -> Result<(), ConfigError> {
    let invalid = || {
        ConfigError::ValidationError(format!("invalid bypass CIDR: {cidr}"))
    };

    let (addr, len) = cidr.split_once('/').ok_or_else(invalid)?;
    addr.parse::<std::net::Ipv4Addr>().map_err(|_| invalid())?;
    let len: u8 = len.parse().map_err(|_| invalid())?;
    if len > 32 {
        return Err(invalid());
    }
    Ok(())
}

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: listen={}, redirect={}",
        config.listen.address,
        if config.redirect.enabled { "enabled" } else { "disabled" }
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TPROXY_RELAY_LISTEN_ADDR`: Override listen address
/// - `TPROXY_RELAY_LOG_LEVEL`: Override log level
/// - `TPROXY_RELAY_CONNECT_TIMEOUT_SECS`: Override outbound connect timeout
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(addr) = std::env::var("TPROXY_RELAY_LISTEN_ADDR") {
        config.listen.address = addr.parse().map_err(|_| ConfigError::EnvError {
            name: "TPROXY_RELAY_LISTEN_ADDR".into(),
            reason: format!("Invalid socket address: {addr}"),
        })?;
        debug!("Listen address overridden to {}", config.listen.address);
    }

    if let Ok(level) = std::env::var("TPROXY_RELAY_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Ok(secs) = std::env::var("TPROXY_RELAY_CONNECT_TIMEOUT_SECS") {
        config.connection.connect_timeout_secs =
            secs.parse().map_err(|_| ConfigError::EnvError {
                name: "TPROXY_RELAY_CONNECT_TIMEOUT_SECS".into(),
                reason: format!("Invalid timeout: {secs}"),
            })?;
    }

    config.validate()?;

    Ok(config)
}

/// Write a default configuration file
///
/// # Errors
///
/// Returns `ConfigError` if serialization or writing fails.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;
    std::fs::write(path.as_ref(), json)?;
    Ok(())
}
