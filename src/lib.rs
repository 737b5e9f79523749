//! # tproxy-relay
//!
//! A transparent TCP proxy. OS-level NAT rules steer connections into its
//! listener; for each one it recovers the destination the client actually
//! dialed, opens its own connection there, and relays bytes both ways
//! until either side finishes.
//!
//! ## Architecture
//!
//! - [`resolver`]: recovers the original destination of a redirected
//!   connection (kernel socket option on Linux, pf NAT lookup on macOS)
//! - [`dialer`]: opens the outbound leg, marked so redirection rules leave
//!   the proxy's own traffic alone
//! - [`tunnel`]: bidirectional relay, two copy tasks racing to completion
//! - [`proxy`]: the accept loop tying the three together per connection
//! - [`redirect`]: optional provisioning of the OS redirection rules
//!   themselves (iptables/ipset or pfctl)
//! - [`config`]: JSON configuration with environment overrides
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tproxy_relay::dialer::Dialer;
//! use tproxy_relay::proxy::ProxyServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = ProxyServer::bind(
//!         "127.0.0.1:7893".parse()?,
//!         Dialer::new(Duration::from_secs(10)),
//!     )
//!     .await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod dialer;
pub mod error;
pub mod proxy;
pub mod redirect;
pub mod resolver;
pub mod tunnel;

pub use config::{Config, RedirectMode};
pub use dialer::Dialer;
pub use error::{RelayError, Result};
pub use proxy::ProxyServer;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
