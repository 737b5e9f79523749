//! Error types for tproxy-relay
//!
//! This module defines the error hierarchy for the transparent proxy relay.
//! Errors are categorized by subsystem; per-connection errors never escape
//! their connection's task.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::tunnel::Direction;

/// Top-level error type for tproxy-relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Original-destination resolution errors
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// Outbound dial errors
    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    /// Tunnel relay errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Redirection rule provisioning errors
    #[error("Redirect error: {0}")]
    Redirect(#[from] RedirectError),

    /// Accept-level failure on the listening socket (fatal to the loop)
    #[error("Accept error: {0}")]
    Accept(io::Error),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Original-destination resolution errors
///
/// These map one-to-one onto the failure modes of the platform lookup
/// strategies: a kernel socket-option query on Linux, a packet-filter
/// NAT-lookup ioctl on Darwin.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No resolution strategy exists for this target platform
    #[error("original destination lookup is not supported on this platform")]
    UnsupportedPlatform,

    /// The connection's addresses are neither IPv4 nor IPv6 (or disagree)
    #[error("address family error: {0}")]
    AddressFamily(String),

    /// The connection's local (bind) address could not be resolved
    #[error("bind address error: {0}")]
    BindAddress(String),

    /// OS-level error from the kernel/packet-filter query
    #[error("original destination lookup failed: {0}")]
    Lookup(String),
}

impl ResolveError {
    /// All resolve errors drop the one connection; the resolver keeps
    /// serving future connections.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// Outbound dial errors
#[derive(Debug, Error)]
pub enum DialError {
    /// Connection attempt failed
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    /// Connection attempt timed out
    #[error("connection to {addr} timed out after {timeout_secs}s")]
    Timeout { addr: SocketAddr, timeout_secs: u64 },

    /// Failed to set a socket option on the outbound socket
    #[error("failed to set outbound socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },
}

impl DialError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Timeout { .. } => true,
            Self::SocketOption { .. } => false,
        }
    }

    /// Create a connect error
    pub fn connect(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Connect {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Tunnel relay errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// I/O failure on one relayed direction
    #[error("relay failed ({direction}): {source}")]
    Relay {
        direction: Direction,
        source: io::Error,
    },

    /// The tunnel was cancelled by an external shutdown signal.
    ///
    /// Both endpoints are closed before this is returned; callers treat it
    /// as orderly shutdown, not a failure.
    #[error("tunnel cancelled by shutdown")]
    Cancelled,
}

impl TunnelError {
    /// Check whether this is the orderly-shutdown outcome
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Redirection rule provisioning errors
#[derive(Debug, Error)]
pub enum RedirectError {
    /// Failed to spawn an external rule-management command
    #[error("failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },

    /// An external rule-management command exited with failure
    #[error("{program} failed: {detail}")]
    Command { program: String, detail: String },

    /// No rule provisioning backend exists for this platform
    #[error("redirection rule provisioning is not supported on this platform")]
    Unsupported,
}

impl RedirectError {
    /// Create a command failure error
    pub fn command(program: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            detail: detail.into(),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// Type alias for Result with `RelayError`
pub type Result<T> = std::result::Result<T, RelayError>;
