//! Original-destination resolution
//!
//! When OS-level NAT rules redirect a connection into the proxy, the
//! accepted socket's local address is the proxy's own bind address; the
//! address the client actually dialed has to be recovered from kernel or
//! packet-filter state. This module provides [`resolve`], which does that
//! recovery with a strategy fixed at compile time per target OS:
//!
//! - **Linux** ([`sockopt`]): the netfilter NAT layer keeps the
//!   pre-redirection destination on the socket itself; a `getsockopt` with
//!   `SO_ORIGINAL_DST` (or `IP6T_SO_ORIGINAL_DST`) returns it as a raw
//!   sockaddr structure.
//! - **macOS** ([`natlook`]): pf keeps the state table private to the
//!   kernel; a `DIOCNATLOOK` ioctl against `/dev/pf` looks up the
//!   connection's pre-translation entry by its post-redirection 4-tuple.
//! - **Anything else**: resolution fails with
//!   [`ResolveError::UnsupportedPlatform`].
//!
//! There is no runtime fallback between strategies; the target OS is fixed
//! per binary.
//!
//! # Requirements
//!
//! On Linux, the connection must have been redirected through an iptables
//! `REDIRECT`/`DNAT` rule; otherwise the kernel has no conntrack entry to
//! report and the query fails. On macOS, reading `/dev/pf` requires root.

pub(crate) mod natlook;
pub(crate) mod sockopt;

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::error::ResolveError;

/// Recover the destination the client originally dialed, before the
/// redirection rules rewrote it to this proxy's listen address.
///
/// # Errors
///
/// - [`ResolveError::AddressFamily`] if the connection's local address
///   family cannot be determined
/// - [`ResolveError::Lookup`] for OS-level errors from the query itself
#[cfg(target_os = "linux")]
pub fn resolve(stream: &TcpStream) -> Result<SocketAddr, ResolveError> {
    sockopt::resolve(stream)
}

/// Recover the destination the client originally dialed, before the
/// redirection rules rewrote it to this proxy's listen address.
///
/// # Errors
///
/// - [`ResolveError::AddressFamily`] for mixed or unknown address families
/// - [`ResolveError::BindAddress`] if the local address cannot be read
/// - [`ResolveError::Lookup`] for `/dev/pf` open or ioctl failures
#[cfg(target_os = "macos")]
pub fn resolve(stream: &TcpStream) -> Result<SocketAddr, ResolveError> {
    natlook::resolve(stream)
}

/// Original-destination recovery is not implemented for this target OS.
///
/// # Errors
///
/// Always returns [`ResolveError::UnsupportedPlatform`].
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn resolve(_stream: &TcpStream) -> Result<SocketAddr, ResolveError> {
    Err(ResolveError::UnsupportedPlatform)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A connection that was never redirected has no NAT state behind it.
    /// The resolver must fail cleanly (or, where conntrack supplies a
    /// trivial mapping, report the connection's own local address) and must
    /// never panic.
    #[tokio::test]
    async fn test_resolve_without_redirection_does_not_panic() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        match resolve(&server) {
            Ok(dst) => assert_eq!(dst, server.local_addr().unwrap()),
            // The socket-option strategy only ever reports lookup or
            // address-family failures
            #[cfg(target_os = "linux")]
            Err(e) => assert!(
                matches!(
                    e,
                    ResolveError::Lookup(_) | ResolveError::AddressFamily(_)
                ),
                "unexpected error kind: {e}"
            ),
            #[cfg(not(target_os = "linux"))]
            Err(_) => {}
        }
    }
}
