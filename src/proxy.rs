//! Accept loop and per-connection pipeline
//!
//! [`ProxyServer`] owns the listening socket the redirection rules point
//! at. Each accepted connection is dispatched to its own task, which walks
//! the resolve -> dial -> tunnel pipeline; a failure at any stage drops
//! that one connection and never the server.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::dialer::Dialer;
use crate::error::{RelayError, Result, TunnelError};
use crate::resolver;
use crate::tunnel;

/// Counters shared across all connection tasks.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Connections accepted from the redirected inbound
    accepted: AtomicU64,
    /// Connections that completed the full pipeline and closed cleanly
    completed: AtomicU64,
    /// Connections dropped because original-destination resolution failed
    resolve_failures: AtomicU64,
    /// Connections dropped because the outbound dial failed
    dial_failures: AtomicU64,
    /// Tunnels that ended with a relay error
    tunnel_failures: AtomicU64,
    /// Tunnels torn down by a shutdown signal
    cancelled: AtomicU64,
    /// Total bytes relayed, both directions
    bytes_relayed: AtomicU64,
}

impl ProxyStats {
    /// Immutable snapshot of the current counters
    #[must_use]
    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            tunnel_failures: self.tunnel_failures.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ProxyStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStatsSnapshot {
    pub accepted: u64,
    pub completed: u64,
    pub resolve_failures: u64,
    pub dial_failures: u64,
    pub tunnel_failures: u64,
    pub cancelled: u64,
    pub bytes_relayed: u64,
}

/// The transparent proxy server.
pub struct ProxyServer {
    listener: TcpListener,
    dialer: Dialer,
    stats: Arc<ProxyStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    /// Bind the listening socket.
    ///
    /// Port 0 binds an ephemeral port; read it back with
    /// [`local_addr`](Self::local_addr) before writing redirection rules.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Io` if the bind fails.
    pub async fn bind(addr: SocketAddr, dialer: Dialer) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        info!("Listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            dialer,
            stats: Arc::new(ProxyStats::default()),
            shutdown_tx,
        })
    }

    /// The actually-bound listen address.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Io` if the socket cannot report its address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared counters for this server
    #[must_use]
    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// A sender that cancels the accept loop and every live tunnel.
    ///
    /// Hold on to this (or a clone) before calling [`run`](Self::run);
    /// dropping every sender also triggers shutdown.
    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the accept loop until shutdown or a fatal accept error.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Accept` when the listening socket fails in a
    /// non-transient way. Transient accept errors are logged and skipped.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            let (client, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!("Transient accept error: {}", e);
                        continue;
                    }
                    Err(e) => {
                        error!("Accept loop failed: {}", e);
                        return Err(RelayError::Accept(e));
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutdown requested, stopping accept loop");
                    return Ok(());
                }
            };

            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            debug!("Accepted redirected connection from {}", peer);

            let dialer = self.dialer.clone();
            let stats = Arc::clone(&self.stats);
            let tunnel_shutdown = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                handle_connection(client, peer, dialer, stats, tunnel_shutdown).await;
            });
        }
    }
}

/// Accept errors that indicate per-connection trouble rather than a broken
/// listening socket.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Walk one connection through resolve -> dial -> tunnel.
///
/// Every failure path logs with enough context to identify the stage, bumps
/// the matching counter, and returns; the connection is closed by drop.
async fn handle_connection(
    client: TcpStream,
    peer: SocketAddr,
    dialer: Dialer,
    stats: Arc<ProxyStats>,
    shutdown: broadcast::Receiver<()>,
) {
    let dest = match resolver::resolve(&client) {
        Ok(dest) => dest,
        Err(e) => {
            warn!("Dropping connection from {}: {}", peer, e);
            stats.resolve_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    debug!("Connection from {} originally dialed {}", peer, dest);

    let upstream = match dialer.dial(dest).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Dropping connection from {} to {}: {}", peer, dest, e);
            stats.dial_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    match tunnel::run(client, upstream, shutdown).await {
        Ok(tunnel_stats) => {
            stats.completed.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes_relayed
                .fetch_add(tunnel_stats.total(), Ordering::Relaxed);
            debug!(
                "Tunnel {} -> {} closed: {} up, {} down",
                peer, dest, tunnel_stats.client_to_upstream, tunnel_stats.upstream_to_client
            );
        }
        Err(TunnelError::Cancelled) => {
            stats.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!("Tunnel {} -> {} cancelled by shutdown", peer, dest);
        }
        Err(e) => {
            stats.tunnel_failures.fetch_add(1, Ordering::Relaxed);
            warn!("Tunnel {} -> {} failed: {}", peer, dest, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn test_server() -> ProxyServer {
        ProxyServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Dialer::new(Duration::from_secs(1)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = test_server().await;
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let server = test_server().await;
        let shutdown = server.shutdown_sender();

        let handle = tokio::spawn(async move { server.run().await });

        // Give the loop a moment to start waiting on accept
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run() did not stop after shutdown")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unredirected_connection_is_counted() {
        let server = test_server().await;
        let addr = server.local_addr().unwrap();
        let stats = server.stats();
        let shutdown = server.shutdown_sender();

        let handle = tokio::spawn(async move { server.run().await });

        // A plain connection with no NAT state behind it; depending on the
        // host it is either dropped at resolve or tunneled back to itself,
        // so only the accept counter has a guaranteed floor
        let conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = stats.snapshot();
        assert!(snapshot.accepted >= 1);

        shutdown.send(()).unwrap();
        drop(conn);
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    #[test]
    fn test_transient_accept_errors() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
        ] {
            assert!(is_transient_accept_error(&io::Error::new(kind, "x")));
        }
        assert!(!is_transient_accept_error(&io::Error::new(
            io::ErrorKind::OutOfMemory,
            "x"
        )));
    }

    #[test]
    fn test_stats_snapshot_starts_zeroed() {
        let stats = ProxyStats::default();
        assert_eq!(stats.snapshot(), ProxyStatsSnapshot::default());
    }
}
