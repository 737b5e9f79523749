//! Bidirectional tunnel between a redirected client and its upstream
//!
//! Each accepted connection becomes one tunnel: two concurrent copy tasks,
//! one per direction, racing to completion. The first direction to finish
//! (EOF or error) decides the tunnel's outcome; the other direction is torn
//! down immediately rather than drained, matching the behavior of the
//! endpoints themselves when one side goes away.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::error::TunnelError;

/// Which way bytes were flowing when something happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the redirected client toward the original destination
    ClientToUpstream,
    /// From the original destination back to the client
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToUpstream => write!(f, "client->upstream"),
            Self::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Byte counts observed by a completed (or torn-down) tunnel.
///
/// The count for a direction that was aborted mid-copy is best-effort: it
/// reflects whatever that direction had reported before teardown, which may
/// be zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Bytes relayed from the client to the upstream
    pub client_to_upstream: u64,
    /// Bytes relayed from the upstream back to the client
    pub upstream_to_client: u64,
}

impl TunnelStats {
    /// Total bytes relayed in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// Copy one direction until EOF or error, then propagate the EOF as a
/// best-effort write-side shutdown so the far end sees it.
async fn copy_direction<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    let _ = writer.shutdown().await;
    Ok(copied)
}

/// Relay bytes between `client` and `upstream` until one side finishes.
///
/// The tunnel ends when the first direction completes:
///
/// - clean EOF on either direction ends the tunnel successfully, with the
///   other direction torn down;
/// - an I/O error on either direction ends it with
///   [`TunnelError::Relay`] naming that direction;
/// - a message on `shutdown` (or the sender going away) ends it with
///   [`TunnelError::Cancelled`].
///
/// In every case both endpoints are dropped, and therefore closed, exactly
/// once before this returns.
///
/// # Errors
///
/// [`TunnelError::Relay`] for I/O failures, [`TunnelError::Cancelled`] for
/// externally requested shutdown.
pub async fn run<A, B>(
    client: A,
    upstream: B,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<TunnelStats, TunnelError>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    // Capacity 2 so neither task can block on reporting its result
    let (result_tx, mut result_rx) = mpsc::channel::<(Direction, std::io::Result<u64>)>(2);

    let tx = result_tx.clone();
    let forward = tokio::spawn(async move {
        let result = copy_direction(client_read, upstream_write).await;
        let _ = tx.send((Direction::ClientToUpstream, result)).await;
    });

    let backward = tokio::spawn(async move {
        let result = copy_direction(upstream_read, client_write).await;
        let _ = result_tx
            .send((Direction::UpstreamToClient, result))
            .await;
    });

    let first = tokio::select! {
        r = result_rx.recv() => r,
        // Closed or Lagged both mean the process is going down
        _ = shutdown.recv() => None,
    };

    // Tear down whichever task is still running; dropping its halves closes
    // that endpoint
    forward.abort();
    backward.abort();
    let _ = forward.await;
    let _ = backward.await;

    let Some((direction, result)) = first else {
        debug!("Tunnel cancelled by shutdown signal");
        return Err(TunnelError::Cancelled);
    };

    let mut stats = TunnelStats::default();
    let record = |stats: &mut TunnelStats, direction: Direction, n: u64| match direction {
        Direction::ClientToUpstream => stats.client_to_upstream = n,
        Direction::UpstreamToClient => stats.upstream_to_client = n,
    };

    // The other direction may have finished in the teardown window; pick up
    // its count if so
    let other = result_rx.try_recv().ok();

    match result {
        Ok(n) => {
            record(&mut stats, direction, n);
            if let Some((d, Ok(m))) = other {
                record(&mut stats, d, m);
            }
            trace!(
                "Tunnel closed: {} up, {} down",
                stats.client_to_upstream,
                stats.upstream_to_client
            );
            Ok(stats)
        }
        Err(source) => Err(TunnelError::Relay { direction, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn shutdown_pair() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
        broadcast::channel(1)
    }

    #[tokio::test]
    async fn test_relays_client_to_upstream() {
        let (client_near, mut client_far) = duplex(1024);
        let (upstream_near, mut upstream_far) = duplex(1024);
        let (_tx, rx) = shutdown_pair();

        let tunnel = tokio::spawn(run(client_near, upstream_near, rx));

        client_far.write_all(b"hello upstream").await.unwrap();
        client_far.shutdown().await.unwrap();

        let mut received = Vec::new();
        upstream_far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello upstream");

        drop(upstream_far);
        let stats = tunnel.await.unwrap().unwrap();
        assert_eq!(stats.client_to_upstream, 14);
    }

    #[tokio::test]
    async fn test_relays_upstream_to_client() {
        let (client_near, mut client_far) = duplex(1024);
        let (upstream_near, mut upstream_far) = duplex(1024);
        let (_tx, rx) = shutdown_pair();

        let tunnel = tokio::spawn(run(client_near, upstream_near, rx));

        upstream_far.write_all(b"response bytes").await.unwrap();
        upstream_far.shutdown().await.unwrap();

        let mut received = Vec::new();
        client_far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"response bytes");

        drop(client_far);
        let stats = tunnel.await.unwrap().unwrap();
        assert_eq!(stats.upstream_to_client, 14);
    }

    #[tokio::test]
    async fn test_large_transfer_integrity() {
        let (client_near, mut client_far) = duplex(4096);
        let (upstream_near, mut upstream_far) = duplex(4096);
        let (_tx, rx) = shutdown_pair();

        let tunnel = tokio::spawn(run(client_near, upstream_near, rx));

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client_far.write_all(&payload).await.unwrap();
            client_far.shutdown().await.unwrap();
            client_far
        });

        let mut received = Vec::new();
        upstream_far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected);

        let client_far = writer.await.unwrap();
        drop(client_far);
        drop(upstream_far);
        let stats = tunnel.await.unwrap().unwrap();
        assert_eq!(stats.client_to_upstream, 256 * 1024);
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (client_near, mut client_far) = duplex(1024);
        let (upstream_near, upstream_far) = duplex(1024);
        let (_tx, rx) = shutdown_pair();

        let tunnel = tokio::spawn(run(client_near, upstream_near, rx));

        // Simple echo on the upstream end
        let echo = tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(upstream_far);
            let mut buf = vec![0u8; 512];
            loop {
                let n = r.read(&mut buf).await.unwrap();
                if n == 0 {
                    w.shutdown().await.unwrap();
                    break;
                }
                w.write_all(&buf[..n]).await.unwrap();
            }
        });

        client_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client_far.shutdown().await.unwrap();
        echo.await.unwrap();
        drop(client_far);
        let result = tunnel.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_idle_tunnel() {
        let (client_near, _client_far) = duplex(1024);
        let (upstream_near, _upstream_far) = duplex(1024);
        let (tx, rx) = shutdown_pair();

        let tunnel = tokio::spawn(run(client_near, upstream_near, rx));

        // Neither side is sending; only the signal can end this
        tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), tunnel)
            .await
            .expect("tunnel did not react to shutdown")
            .unwrap();

        assert!(matches!(result, Err(TunnelError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_cancels() {
        let (client_near, _client_far) = duplex(1024);
        let (upstream_near, _upstream_far) = duplex(1024);
        let (tx, rx) = shutdown_pair();
        drop(tx);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run(client_near, upstream_near, rx),
        )
        .await
        .expect("tunnel did not react to closed shutdown channel");

        assert!(matches!(result, Err(TunnelError::Cancelled)));
    }

    #[tokio::test]
    async fn test_peer_drop_ends_tunnel() {
        let (client_near, client_far) = duplex(1024);
        let (upstream_near, _upstream_far) = duplex(1024);
        let (_tx, rx) = shutdown_pair();

        let tunnel = tokio::spawn(run(client_near, upstream_near, rx));

        // Dropping the client end produces EOF on the client->upstream
        // direction
        drop(client_far);

        let result = tokio::time::timeout(Duration::from_secs(5), tunnel)
            .await
            .expect("tunnel did not end after peer drop")
            .unwrap();

        // Either a clean zero-byte EOF, or an error if the write side saw
        // the drop first
        match result {
            Ok(stats) => assert_eq!(stats.client_to_upstream, 0),
            Err(TunnelError::Relay { .. }) => {}
            Err(e) => panic!("unexpected outcome: {e}"),
        }
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::ClientToUpstream.to_string(), "client->upstream");
        assert_eq!(Direction::UpstreamToClient.to_string(), "upstream->client");
    }

    #[test]
    fn test_stats_total() {
        let stats = TunnelStats {
            client_to_upstream: 10,
            upstream_to_client: 32,
        };
        assert_eq!(stats.total(), 42);
    }
}
