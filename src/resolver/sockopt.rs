//! Kernel socket-option lookup (Linux)
//!
//! The netfilter NAT layer records the pre-redirection destination of a
//! `REDIRECT`ed/`DNAT`ed TCP connection and exposes it through a getsockopt
//! on the accepted socket: `SO_ORIGINAL_DST` at `SOL_IP` for IPv4,
//! `IP6T_SO_ORIGINAL_DST` at `SOL_IPV6` for IPv6. The answer is a raw
//! `sockaddr_in`/`sockaddr_in6`; decoding is kept in a pure function so the
//! structure layout is unit-testable on every platform.

// The pure decode path compiles everywhere for its tests
#![cfg_attr(not(target_os = "linux"), allow(dead_code))]

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::ResolveError;

/// Linux kernel constant: `SO_ORIGINAL_DST` (`SOL_IP` level).
///
/// Returns the original destination of a NAT-redirected IPv4 connection.
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// Linux kernel constant: `IP6T_SO_ORIGINAL_DST` (`SOL_IPV6` level).
///
/// Same option number as the IPv4 variant, different level.
pub const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

/// `sizeof(struct sockaddr_in)`
const SOCKADDR_IN_LEN: usize = 16;

/// `sizeof(struct sockaddr_in6)`
const SOCKADDR_IN6_LEN: usize = 28;

/// Decode a raw sockaddr structure returned by the original-destination
/// getsockopt.
///
/// Layout (both families): 2-byte family/padding field, then the port as a
/// big-endian u16 at offset 2. The address starts at offset 4 (4 bytes,
/// IPv4) or offset 8 (16 bytes, IPv6, after the 4-byte flowinfo field).
/// The structure length alone identifies the family.
pub(crate) fn decode_original_dst(buf: &[u8]) -> Result<SocketAddr, ResolveError> {
    let addr = match buf.len() {
        SOCKADDR_IN_LEN => {
            let port = u16::from_be_bytes([buf[2], buf[3]]);
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        }
        SOCKADDR_IN6_LEN => {
            let port = u16::from_be_bytes([buf[2], buf[3]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[8..24]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        }
        n => {
            return Err(ResolveError::Lookup(format!(
                "unexpected address structure length: {n}"
            )))
        }
    };

    if addr.port() == 0 {
        return Err(ResolveError::Lookup(
            "original destination has port 0".into(),
        ));
    }

    Ok(addr)
}

/// Query the accepted connection's socket for its original destination.
///
/// The option and answer size are chosen by the connection's local address
/// family, since the structure layouts differ.
#[cfg(target_os = "linux")]
pub(crate) fn resolve(stream: &tokio::net::TcpStream) -> Result<SocketAddr, ResolveError> {
    use std::io;
    use std::os::unix::io::AsRawFd;

    let local = stream.local_addr().map_err(|e| {
        ResolveError::AddressFamily(format!("failed to determine local address family: {e}"))
    })?;

    let (level, optname, expected_len) = match local {
        SocketAddr::V4(_) => (libc::SOL_IP, SO_ORIGINAL_DST, SOCKADDR_IN_LEN),
        SocketAddr::V6(_) => (libc::SOL_IPV6, IP6T_SO_ORIGINAL_DST, SOCKADDR_IN6_LEN),
    };

    let fd = stream.as_raw_fd();
    let mut buf = [0u8; SOCKADDR_IN6_LEN];
    let mut optlen = expected_len as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            level,
            optname,
            buf.as_mut_ptr().cast::<libc::c_void>(),
            &mut optlen,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Err(ResolveError::Lookup(
                "no NAT state for connection - was it actually redirected?".into(),
            ));
        }
        return Err(ResolveError::Lookup(format!(
            "getsockopt original destination failed: {err}"
        )));
    }

    decode_original_dst(&buf[..optlen as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a raw sockaddr_in as the kernel would return it.
    fn sockaddr_in(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut buf = vec![0u8; SOCKADDR_IN_LEN];
        buf[0] = 2; // AF_INET, little-endian sa_family_t
        buf[2..4].copy_from_slice(&port.to_be_bytes());
        buf[4..8].copy_from_slice(&ip);
        buf
    }

    /// Build a raw sockaddr_in6 as the kernel would return it.
    fn sockaddr_in6(ip: [u8; 16], port: u16) -> Vec<u8> {
        let mut buf = vec![0u8; SOCKADDR_IN6_LEN];
        buf[0] = 10; // AF_INET6 on Linux
        buf[2..4].copy_from_slice(&port.to_be_bytes());
        buf[8..24].copy_from_slice(&ip);
        buf
    }

    #[test]
    fn test_decode_ipv4() {
        let buf = sockaddr_in([8, 8, 8, 8], 53);
        let addr = decode_original_dst(&buf).unwrap();
        assert_eq!(addr.to_string(), "8.8.8.8:53");
    }

    #[test]
    fn test_decode_ipv4_high_port() {
        let buf = sockaddr_in([192, 0, 2, 1], 65535);
        let addr = decode_original_dst(&buf).unwrap();
        assert_eq!(addr, "192.0.2.1:65535".parse().unwrap());
    }

    #[test]
    fn test_decode_ipv6() {
        let mut ip = [0u8; 16];
        ip[0] = 0x20;
        ip[1] = 0x01;
        ip[2] = 0x0d;
        ip[3] = 0xb8;
        ip[15] = 0x01;
        let buf = sockaddr_in6(ip, 443);
        let addr = decode_original_dst(&buf).unwrap();
        assert_eq!(addr, "[2001:db8::1]:443".parse().unwrap());
    }

    #[test]
    fn test_decode_ipv6_loopback() {
        let ip = std::net::Ipv6Addr::LOCALHOST.octets();
        let buf = sockaddr_in6(ip, 8080);
        let addr = decode_original_dst(&buf).unwrap();
        assert_eq!(addr, "[::1]:8080".parse().unwrap());
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        for len in [0, 1, 8, 15, 17, 27, 29, 64] {
            let buf = vec![0u8; len];
            assert!(
                matches!(decode_original_dst(&buf), Err(ResolveError::Lookup(_))),
                "length {len} should be rejected"
            );
        }
    }

    #[test]
    fn test_decode_rejects_zero_port() {
        let buf = sockaddr_in([8, 8, 8, 8], 0);
        assert!(matches!(
            decode_original_dst(&buf),
            Err(ResolveError::Lookup(_))
        ));
    }

    #[test]
    fn test_port_is_big_endian() {
        // 0x1F90 = 8080; byte order matters
        let buf = sockaddr_in([1, 2, 3, 4], 0x1F90);
        let addr = decode_original_dst(&buf).unwrap();
        assert_eq!(addr.port(), 8080);
    }
}
