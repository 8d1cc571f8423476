//! Outbound sockets for the SOCKS relay
//!
//! Sockets on the VPN egress are pinned to the tunnel interface
//! (`SO_BINDTODEVICE` on Linux, `IP_BOUND_IF` on macOS); system egress
//! sockets follow the host routing table.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{lookup_host, TcpSocket, TcpStream, UdpSocket};
use tokio::time::timeout;

use super::policy::Egress;
use super::protocol::{Address, ReplyCode};
use crate::error::{DataplaneError, Result};
use crate::logger::log;

/// Default dial timeout for CONNECT
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolve a wire address to a socket address.
///
/// Domains prefer the first IPv4 result and fall back to the first result
/// of any family.
pub async fn resolve(addr: &Address) -> Result<SocketAddr> {
    let (domain, port) = match addr {
        Address::Domain(d, p) => (d.as_str(), *p),
        _ => {
            return addr
                .socket_addr()
                .ok_or_else(|| DataplaneError::Resolve(addr.to_string()))
        }
    };
    let addrs: Vec<SocketAddr> = lookup_host((domain, port))
        .await
        .map_err(|e| DataplaneError::Resolve(format!("{}: {}", domain, e)))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| DataplaneError::Resolve(format!("no addresses found for {}", domain)))
}

/// Map a dial error to the SOCKS reply code sent back to the client
pub fn reply_for_io_error(err: &io::Error) -> ReplyCode {
    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        match code {
            libc::ECONNREFUSED => return ReplyCode::ConnectionRefused,
            libc::ENETUNREACH => return ReplyCode::NetworkUnreachable,
            libc::EHOSTUNREACH | libc::ETIMEDOUT => return ReplyCode::HostUnreachable,
            _ => {}
        }
    }
    match err.kind() {
        io::ErrorKind::TimedOut => ReplyCode::HostUnreachable,
        io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
        _ => ReplyCode::GeneralFailure,
    }
}

/// Pin a socket to the named interface
#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_to_interface(socket: SockRef<'_>, interface: &str, _ipv6: bool) -> io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(target_os = "macos")]
fn bind_to_interface(socket: SockRef<'_>, interface: &str, ipv6: bool) -> io::Result<()> {
    use std::ffi::CString;
    use std::num::NonZeroU32;

    let name = CString::new(interface)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"))?;
    // SAFETY: name is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    let index = NonZeroU32::new(index).ok_or_else(io::Error::last_os_error)?;
    if ipv6 {
        socket.bind_device_by_index_v6(Some(index))
    } else {
        socket.bind_device_by_index_v4(Some(index))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
fn bind_to_interface(_socket: SockRef<'_>, interface: &str, _ipv6: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("binding to interface {} is not supported on this platform", interface),
    ))
}

/// Creates outbound TCP and UDP sockets for an egress choice
#[derive(Debug, Clone)]
pub struct Dialer {
    /// Tunnel interface for [`Egress::Vpn`]; `None` in SOCKS-only mode
    vpn_interface: Option<String>,
    dial_timeout: Duration,
}

impl Dialer {
    pub fn new(vpn_interface: Option<String>, dial_timeout: Duration) -> Self {
        Self {
            vpn_interface,
            dial_timeout,
        }
    }

    pub fn vpn_interface(&self) -> Option<&str> {
        self.vpn_interface.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    fn interface_for(&self, egress: Egress) -> Option<&str> {
        match egress {
            Egress::Vpn => self.vpn_interface.as_deref(),
            Egress::System => None,
        }
    }

    /// Open a TCP connection to `target` over the chosen egress.
    ///
    /// A timeout is reported as [`io::ErrorKind::TimedOut`].
    pub async fn connect(&self, target: SocketAddr, egress: Egress) -> io::Result<TcpStream> {
        let socket = match target {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(iface) = self.interface_for(egress) {
            bind_to_interface(SockRef::from(&socket), iface, target.is_ipv6())?;
        }

        let stream = timeout(self.dial_timeout, socket.connect(target))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", target, self.dial_timeout),
                )
            })??;

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!(target = %target, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(stream)
    }

    /// Bind an unconnected UDP socket for the chosen egress.
    ///
    /// The socket is dual-stack (`[::]:0` with `IPV6_V6ONLY` cleared) so a
    /// single socket reaches both families. Hosts without IPv6 get an IPv4
    /// socket instead.
    pub fn bind_udp(&self, egress: Egress) -> io::Result<UdpSocket> {
        match self.bind_udp_in(Domain::IPV6, egress) {
            Ok(socket) => Ok(socket),
            Err(e) => {
                log::debug!(egress = %egress, error = %e, "Dual-stack UDP socket unavailable, using IPv4");
                self.bind_udp_in(Domain::IPV4, egress)
            }
        }
    }

    fn bind_udp_in(&self, domain: Domain, egress: Egress) -> io::Result<UdpSocket> {
        let ipv6 = domain == Domain::IPV6;
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        let local = if ipv6 {
            socket.set_only_v6(false)?;
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        };
        if let Some(iface) = self.interface_for(egress) {
            bind_to_interface(SockRef::from(&socket), iface, ipv6)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&local.into())?;
        UdpSocket::from_std(socket.into())
    }
}
