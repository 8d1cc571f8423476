//! Local address ranges and the host interface address snapshot.
//!
//! The local-only check compares a packet's source against the addresses
//! this host owns; the inbound allow-list can be seeded from the well-known
//! local ranges.

use std::io;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use super::matcher::CidrSet;

/// Ranges treated as "local" when `--allow_inbound_local` is set
pub const LOCAL_RANGES: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(127, 0, 0, 0), 8),    // loopback
    (Ipv4Addr::new(169, 254, 0, 0), 16), // link-local
    (Ipv4Addr::new(10, 0, 0, 0), 8),     // RFC1918
    (Ipv4Addr::new(172, 16, 0, 0), 12),  // RFC1918
    (Ipv4Addr::new(192, 168, 0, 0), 16), // RFC1918
    (Ipv4Addr::new(100, 64, 0, 0), 10),  // CGNAT
];

/// Build a [`CidrSet`] holding every entry of [`LOCAL_RANGES`]
pub fn local_ranges() -> CidrSet {
    let nets = LOCAL_RANGES
        .iter()
        .filter_map(|(addr, prefix)| Ipv4Net::new(*addr, *prefix).ok())
        .collect();
    CidrSet::new(nets)
}

/// IPv4 addresses assigned to this host's interfaces at one point in time
#[derive(Debug, Clone, Default)]
pub struct HostAddresses {
    addrs: Vec<Ipv4Addr>,
}

impl HostAddresses {
    pub fn new(addrs: Vec<Ipv4Addr>) -> Self {
        Self { addrs }
    }

    /// Snapshot the current interface addresses
    pub fn snapshot() -> io::Result<Self> {
        Ok(Self {
            addrs: interface_ipv4_addrs()?,
        })
    }

    /// Add an address not yet visible to the snapshot (e.g. the TUN address)
    pub fn insert(&mut self, addr: Ipv4Addr) {
        if !self.addrs.contains(&addr) {
            self.addrs.push(addr);
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.addrs.contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

#[cfg(unix)]
fn interface_ipv4_addrs() -> io::Result<Vec<Ipv4Addr>> {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs writes a list head into ifap; freed below.
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut addrs = Vec::new();
    let mut cur = ifap;
    while !cur.is_null() {
        // SAFETY: cur is a live node of the list returned by getifaddrs.
        let ifa = unsafe { &*cur };
        if !ifa.ifa_addr.is_null() {
            // SAFETY: ifa_addr is non-null and points at a sockaddr.
            let family = i32::from(unsafe { (*ifa.ifa_addr).sa_family });
            if family == libc::AF_INET {
                // SAFETY: AF_INET entries carry a sockaddr_in.
                let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
                addrs.push(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
            }
        }
        cur = ifa.ifa_next;
    }

    // SAFETY: ifap came from a successful getifaddrs call.
    unsafe { libc::freeifaddrs(ifap) };
    Ok(addrs)
}

#[cfg(not(unix))]
fn interface_ipv4_addrs() -> io::Result<Vec<Ipv4Addr>> {
    Ok(Vec::new())
}
