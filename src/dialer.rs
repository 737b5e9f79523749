//! Outbound dialer with loop-avoidance marking
//!
//! Opens the upstream leg of a tunnel: a fresh TCP connection to the
//! resolved original destination. The socket is marked before `connect` so
//! the redirection rules can tell the proxy's own egress apart from client
//! traffic and leave it alone; otherwise every outbound dial would be
//! redirected straight back into the listener.
//!
//! On Linux the mark is the `IP_TRANSPARENT` socket option; on platforms
//! without such a flag the marking is a no-op and loop avoidance relies
//! entirely on the provisioned bypass rules.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::DialError;

/// Dials outbound connections to resolved destinations.
#[derive(Debug, Clone)]
pub struct Dialer {
    /// Timeout applied to each connect attempt
    connect_timeout: Duration,
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Dialer {
    /// Create a dialer with the given connect timeout.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Open a marked outbound connection to `dest`.
    ///
    /// The caller owns the returned stream and is responsible for closing
    /// the originating redirected connection if this fails.
    ///
    /// # Errors
    ///
    /// Returns `DialError::Connect` if the connection is refused or the
    /// socket cannot be set up, `DialError::Timeout` if the destination
    /// does not answer within the configured timeout.
    pub async fn dial(&self, dest: SocketAddr) -> Result<TcpStream, DialError> {
        let socket = self.create_socket(dest)?;

        // Initiate non-blocking connect; EINPROGRESS is the expected
        // in-flight result
        match socket.connect(&dest.into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(DialError::connect(dest, e.to_string())),
        }

        // Convert immediately so the fd is owned by the stream and closed
        // on every error path below
        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)
            .map_err(|e| DialError::connect(dest, e.to_string()))?;

        let connect_result = timeout(self.connect_timeout, async {
            // Writable means the connect finished, one way or the other
            stream
                .writable()
                .await
                .map_err(|e| DialError::connect(dest, e.to_string()))?;

            // The verdict is in SO_ERROR
            match stream.take_error() {
                Ok(None) => Ok(()),
                Ok(Some(e)) => Err(DialError::connect(dest, e.to_string())),
                Err(e) => Err(DialError::connect(dest, e.to_string())),
            }
        })
        .await;

        match connect_result {
            Ok(Ok(())) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                debug!("Outbound connection to {} established", dest);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DialError::Timeout {
                addr: dest,
                timeout_secs: self.connect_timeout.as_secs(),
            }),
        }
    }

    /// Create a non-blocking socket of the destination's family with the
    /// loop-avoidance mark applied.
    fn create_socket(&self, dest: SocketAddr) -> Result<Socket, DialError> {
        let domain = match dest {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| DialError::connect(dest, e.to_string()))?;

        mark_for_loop_avoidance(&socket)?;

        socket
            .set_nonblocking(true)
            .map_err(|e| DialError::socket_option("O_NONBLOCK", e.to_string()))?;

        Ok(socket)
    }
}

/// Mark an outbound socket so redirection rules skip it (Linux).
///
/// Setting `IP_TRANSPARENT` needs `CAP_NET_ADMIN`; without it the dial
/// still proceeds, since the provisioned bypass set excludes proxy egress
/// on its own, and we only log the degraded state.
#[cfg(target_os = "linux")]
fn mark_for_loop_avoidance(socket: &Socket) -> Result<(), DialError> {
    use std::io;
    use std::mem;
    use std::os::unix::io::AsRawFd;

    const IP_TRANSPARENT: libc::c_int = 19;

    let fd = socket.as_raw_fd();
    let one: libc::c_int = 1;

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_IP,
            IP_TRANSPARENT,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!("IP_TRANSPARENT needs CAP_NET_ADMIN; relying on bypass rules for loop avoidance");
            return Ok(());
        }
        return Err(DialError::socket_option("IP_TRANSPARENT", err.to_string()));
    }

    Ok(())
}

/// No kernel-level marking exists here; loop avoidance is handled by the
/// redirection rules themselves (bypass table / route-to exclusions).
#[cfg(not(target_os = "linux"))]
fn mark_for_loop_avoidance(_socket: &Socket) -> Result<(), DialError> {
    Ok(())
}
