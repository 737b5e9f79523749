//! Packet-filter NAT lookup (macOS)
//!
//! pf does not annotate redirected sockets; instead its state table can be
//! queried through the `/dev/pf` control device with a `DIOCNATLOOK` ioctl.
//! The lookup key is the connection as pf saw it *after* redirection:
//! source = the client's endpoint, destination = the proxy's own bind
//! address. On success pf fills in the `rd*` (redirected destination)
//! fields with the address the client originally dialed.
//!
//! The device handle is process-wide: opened lazily on first use, guarded
//! by a mutex because `DIOCNATLOOK` is not safe to issue concurrently on
//! one descriptor, and intentionally never closed; the kernel reclaims it
//! at process exit, and its release timing is unobservable.
//!
//! Request/answer construction is pure and unit-tested on every platform;
//! only the ioctl itself is macOS-gated.

// The pure request/answer path compiles everywhere for its tests
#![cfg_attr(not(target_os = "macos"), allow(dead_code))]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::ResolveError;

/// pf direction constant: lookup keyed on outbound traffic
/// (xnu `bsd/net/pfvar.h`, `PF_OUT`).
pub(crate) const PF_OUT: u8 = 2;

/// `IPPROTO_TCP`
const PF_PROTO_TCP: u8 = 6;

/// xnu `AF_INET`
const PF_AF_INET: u8 = 2;

/// xnu `AF_INET6` (differs from the Linux value)
const PF_AF_INET6: u8 = 30;

/// `DIOCNATLOOK` ioctl request: `_IOWR('D', 23, struct pfioc_natlook)`.
pub(crate) const DIOCNATLOOK: libc::c_ulong = 0xC054_4417;

/// Mirror of xnu's `struct pfioc_natlook`.
///
/// Address fields are fixed 16-byte buffers regardless of family; only the
/// leading 4 bytes are significant for IPv4. Port fields are big-endian
/// u16 values in the leading 2 bytes of 4-byte slots.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct PfiocNatlook {
    saddr: [u8; 16],
    daddr: [u8; 16],
    rsaddr: [u8; 16],
    rdaddr: [u8; 16],
    sxport: [u8; 4],
    dxport: [u8; 4],
    rsxport: [u8; 4],
    rdxport: [u8; 4],
    af: u8,
    proto: u8,
    proto_variant: u8,
    direction: u8,
}

impl Default for PfiocNatlook {
    fn default() -> Self {
        Self {
            saddr: [0; 16],
            daddr: [0; 16],
            rsaddr: [0; 16],
            rdaddr: [0; 16],
            sxport: [0; 4],
            dxport: [0; 4],
            rsxport: [0; 4],
            rdxport: [0; 4],
            af: 0,
            proto: 0,
            proto_variant: 0,
            direction: 0,
        }
    }
}

/// Build the NAT-lookup request for a redirected TCP connection.
///
/// `peer` is the client's apparent remote endpoint; `local` is the
/// connection's apparent local endpoint (the proxy's bind address). That
/// pair is the pre-redirection lookup key, not the answer.
pub(crate) fn lookup_request(
    peer: SocketAddr,
    local: SocketAddr,
) -> Result<PfiocNatlook, ResolveError> {
    let mut pnl = PfiocNatlook {
        direction: PF_OUT,
        proto: PF_PROTO_TCP,
        ..PfiocNatlook::default()
    };

    match (peer.ip(), local.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            pnl.saddr[..4].copy_from_slice(&src.octets());
            pnl.daddr[..4].copy_from_slice(&dst.octets());
            pnl.af = PF_AF_INET;
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            pnl.saddr.copy_from_slice(&src.octets());
            pnl.daddr.copy_from_slice(&dst.octets());
            pnl.af = PF_AF_INET6;
        }
        _ => {
            return Err(ResolveError::AddressFamily(format!(
                "mismatched address families: {peer} -> {local}"
            )))
        }
    }

    pnl.sxport[..2].copy_from_slice(&peer.port().to_be_bytes());
    pnl.dxport[..2].copy_from_slice(&local.port().to_be_bytes());

    Ok(pnl)
}

/// Extract the redirected-destination answer from a completed lookup.
///
/// pf echoes the family back; it selects how much of the fixed 16-byte
/// `rdaddr` buffer is meaningful.
pub(crate) fn redirected_destination(pnl: &PfiocNatlook) -> Result<SocketAddr, ResolveError> {
    let port = u16::from_be_bytes([pnl.rdxport[0], pnl.rdxport[1]]);
    if port == 0 {
        return Err(ResolveError::Lookup(
            "packet filter reported port 0 for redirected destination".into(),
        ));
    }

    match pnl.af {
        PF_AF_INET => {
            let ip = Ipv4Addr::new(pnl.rdaddr[0], pnl.rdaddr[1], pnl.rdaddr[2], pnl.rdaddr[3]);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        PF_AF_INET6 => {
            let ip = Ipv6Addr::from(pnl.rdaddr);
            Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))
        }
        other => Err(ResolveError::AddressFamily(format!(
            "packet filter reply has unknown address family {other}"
        ))),
    }
}

#[cfg(target_os = "macos")]
mod device {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::io::AsRawFd;

    use parking_lot::Mutex;

    use super::{PfiocNatlook, DIOCNATLOOK};
    use crate::error::ResolveError;

    /// Process-wide `/dev/pf` handle. Never closed; leaked until exit.
    static PF_DEVICE: Mutex<Option<File>> = Mutex::new(None);

    /// Submit a NAT lookup against the shared device handle.
    ///
    /// The lock covers exactly the open-if-needed-and-query sequence and is
    /// never held across unrelated connection work.
    pub(super) fn submit(pnl: &mut PfiocNatlook) -> Result<(), ResolveError> {
        let mut guard = PF_DEVICE.lock();

        if guard.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/pf")
                .map_err(|e| ResolveError::Lookup(format!("failed to open /dev/pf: {e}")))?;
            *guard = Some(file);
        }
        let file = guard
            .as_ref()
            .ok_or_else(|| ResolveError::Lookup("pf device unavailable".into()))?;

        let ret = unsafe {
            libc::ioctl(file.as_raw_fd(), DIOCNATLOOK, pnl as *mut PfiocNatlook)
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            return Err(ResolveError::Lookup(format!("DIOCNATLOOK failed: {err}")));
        }

        Ok(())
    }
}

/// Query pf for the accepted connection's original destination.
#[cfg(target_os = "macos")]
pub(crate) fn resolve(stream: &tokio::net::TcpStream) -> Result<SocketAddr, ResolveError> {
    let peer = stream.peer_addr().map_err(|e| {
        ResolveError::AddressFamily(format!("failed to get client address: {e}"))
    })?;
    let local = stream.local_addr().map_err(|e| {
        ResolveError::BindAddress(format!("failed to get bind address: {e}"))
    })?;

    let mut pnl = lookup_request(peer, local)?;
    device::submit(&mut pnl)?;
    redirected_destination(&pnl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layout_matches_kernel() {
        // 4 x 16-byte addresses + 4 x 4-byte ports + 4 x u8 = 84 bytes
        assert_eq!(std::mem::size_of::<PfiocNatlook>(), 84);
    }

    #[test]
    fn test_diocnatlook_encoding() {
        // _IOWR('D', 23, len): read|write, struct length, group 'D', number 23
        let expected: libc::c_ulong = 0xC000_0000
            | ((std::mem::size_of::<PfiocNatlook>() as libc::c_ulong) << 16)
            | ((b'D' as libc::c_ulong) << 8)
            | 23;
        assert_eq!(DIOCNATLOOK, expected);
        assert_eq!(DIOCNATLOOK, 3_226_747_927);
    }

    #[test]
    fn test_lookup_request_ipv4() {
        let peer: SocketAddr = "192.168.1.50:49152".parse().unwrap();
        let local: SocketAddr = "127.0.0.1:7893".parse().unwrap();

        let pnl = lookup_request(peer, local).unwrap();

        assert_eq!(pnl.direction, PF_OUT);
        assert_eq!(pnl.proto, 6);
        assert_eq!(pnl.af, PF_AF_INET);
        assert_eq!(&pnl.saddr[..4], &[192, 168, 1, 50]);
        assert_eq!(&pnl.saddr[4..], &[0u8; 12]);
        assert_eq!(&pnl.daddr[..4], &[127, 0, 0, 1]);
        // ports: big-endian u16 in the leading 2 bytes of a 4-byte slot
        assert_eq!(&pnl.sxport, &[0xC0, 0x00, 0, 0]);
        assert_eq!(&pnl.dxport, &[0x1E, 0xD5, 0, 0]);
    }

    #[test]
    fn test_lookup_request_ipv6() {
        let peer: SocketAddr = "[2001:db8::2]:5000".parse().unwrap();
        let local: SocketAddr = "[::1]:7893".parse().unwrap();

        let pnl = lookup_request(peer, local).unwrap();

        assert_eq!(pnl.af, PF_AF_INET6);
        assert_eq!(pnl.saddr[0], 0x20);
        assert_eq!(pnl.saddr[15], 0x02);
        assert_eq!(pnl.daddr[15], 0x01);
    }

    #[test]
    fn test_lookup_request_rejects_mixed_families() {
        let peer: SocketAddr = "192.168.1.50:49152".parse().unwrap();
        let local: SocketAddr = "[::1]:7893".parse().unwrap();

        assert!(matches!(
            lookup_request(peer, local),
            Err(ResolveError::AddressFamily(_))
        ));
    }

    #[test]
    fn test_redirected_destination_ipv4() {
        let mut pnl = PfiocNatlook {
            af: PF_AF_INET,
            ..PfiocNatlook::default()
        };
        pnl.rdaddr[..4].copy_from_slice(&[8, 8, 8, 8]);
        pnl.rdxport[..2].copy_from_slice(&53u16.to_be_bytes());

        let addr = redirected_destination(&pnl).unwrap();
        assert_eq!(addr.to_string(), "8.8.8.8:53");
    }

    #[test]
    fn test_redirected_destination_ipv6() {
        let mut pnl = PfiocNatlook {
            af: PF_AF_INET6,
            ..PfiocNatlook::default()
        };
        pnl.rdaddr.copy_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        pnl.rdxport[..2].copy_from_slice(&443u16.to_be_bytes());

        let addr = redirected_destination(&pnl).unwrap();
        assert_eq!(addr, "[2001:db8::1]:443".parse().unwrap());
    }

    #[test]
    fn test_redirected_destination_rejects_zero_port() {
        let mut pnl = PfiocNatlook {
            af: PF_AF_INET,
            ..PfiocNatlook::default()
        };
        pnl.rdaddr[..4].copy_from_slice(&[8, 8, 8, 8]);

        assert!(matches!(
            redirected_destination(&pnl),
            Err(ResolveError::Lookup(_))
        ));
    }

    #[test]
    fn test_redirected_destination_rejects_unknown_family() {
        let mut pnl = PfiocNatlook::default();
        pnl.af = 99;
        pnl.rdxport[..2].copy_from_slice(&80u16.to_be_bytes());

        assert!(matches!(
            redirected_destination(&pnl),
            Err(ResolveError::AddressFamily(_))
        ));
    }

    #[test]
    fn test_round_trip_through_kernel_echo() {
        // Simulate pf answering in-place: the request fields stay, rd*
        // fields get filled, af is echoed back.
        let peer: SocketAddr = "10.0.0.5:40000".parse().unwrap();
        let local: SocketAddr = "127.0.0.1:7893".parse().unwrap();
        let mut pnl = lookup_request(peer, local).unwrap();

        pnl.rdaddr[..4].copy_from_slice(&[93, 184, 216, 34]);
        pnl.rdxport[..2].copy_from_slice(&80u16.to_be_bytes());

        let addr = redirected_destination(&pnl).unwrap();
        assert_eq!(addr, "93.184.216.34:80".parse().unwrap());
    }
}
