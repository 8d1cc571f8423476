//! Fixed-offset IPv4/TCP header access.
//!
//! Only a handful of fields are read, so packets are never fully decoded:
//!
//! ```text
//! IPv4: byte 0 = version(4) | IHL(4), byte 9 = protocol,
//!       bytes 12..16 = source, bytes 16..20 = destination
//! TCP (at IHL*4): bytes 0..2 = src port, 2..4 = dst port, byte 13 = flags
//! ```
//!
//! Anything that is not IPv4 or is too short to carry the fields is reported
//! as [`PacketKind::Other`] and passes the filters untouched.

use std::net::Ipv4Addr;

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const IP_PROTO_TCP: u8 = 6;

const OFFSET_PROTOCOL: usize = 9;
const OFFSET_SRC: usize = 12;
const OFFSET_DST: usize = 16;
const TCP_OFFSET_FLAGS: usize = 13;

pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_ACK: u8 = 0x10;

/// What the filters can see of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// IPv4 carrying a TCP header of at least 20 bytes
    Tcp(TcpView),
    /// IPv4 with any other protocol, or TCP with a truncated header
    Ipv4 { src: Ipv4Addr, dst: Ipv4Addr },
    /// Not IPv4 or shorter than an IPv4 header
    Other,
}

/// The TCP fields used by the inbound filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpView {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
}

impl TcpView {
    pub fn syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    pub fn ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }
}

/// Source address of an IPv4 packet, if the header is present
pub fn ipv4_source(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_MIN_HEADER_LEN || packet[0] >> 4 != 4 {
        return None;
    }
    Some(addr_at(packet, OFFSET_SRC))
}

fn addr_at(packet: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        packet[offset],
        packet[offset + 1],
        packet[offset + 2],
        packet[offset + 3],
    )
}

/// Classify a raw IP packet
pub fn classify(packet: &[u8]) -> PacketKind {
    if packet.len() < IPV4_MIN_HEADER_LEN || packet[0] >> 4 != 4 {
        return PacketKind::Other;
    }
    let src = addr_at(packet, OFFSET_SRC);
    let dst = addr_at(packet, OFFSET_DST);

    let ihl = usize::from(packet[0] & 0x0f) * 4;
    if ihl < IPV4_MIN_HEADER_LEN
        || packet[OFFSET_PROTOCOL] != IP_PROTO_TCP
        || packet.len() < ihl + TCP_MIN_HEADER_LEN
    {
        return PacketKind::Ipv4 { src, dst };
    }

    let tcp = &packet[ihl..];
    PacketKind::Tcp(TcpView {
        src,
        dst,
        src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
        dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
        flags: tcp[TCP_OFFSET_FLAGS],
    })
}

/// Build a minimal IPv4/TCP packet for tests
#[cfg(test)]
pub(crate) fn build_tcp_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    flags: u8,
) -> Vec<u8> {
    let mut pkt = vec![0u8; IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN];
    pkt[0] = 0x45;
    let total = pkt.len() as u16;
    pkt[2..4].copy_from_slice(&total.to_be_bytes());
    pkt[8] = 64;
    pkt[OFFSET_PROTOCOL] = IP_PROTO_TCP;
    pkt[OFFSET_SRC..OFFSET_SRC + 4].copy_from_slice(&src.octets());
    pkt[OFFSET_DST..OFFSET_DST + 4].copy_from_slice(&dst.octets());
    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[20 + 12] = 0x50;
    pkt[20 + TCP_OFFSET_FLAGS] = flags;
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 5);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 255, 0, 2);

    #[test]
    fn test_classify_tcp_syn() {
        let pkt = build_tcp_packet(SRC, DST, 40000, 22, TCP_FLAG_SYN);
        match classify(&pkt) {
            PacketKind::Tcp(tcp) => {
                assert_eq!(tcp.src, SRC);
                assert_eq!(tcp.dst, DST);
                assert_eq!(tcp.src_port, 40000);
                assert_eq!(tcp.dst_port, 22);
                assert!(tcp.syn());
                assert!(!tcp.ack());
            }
            other => panic!("expected TCP, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_honors_ihl_options() {
        // IHL = 6 (24 bytes): TCP header starts 4 bytes later
        let base = build_tcp_packet(SRC, DST, 1, 2, TCP_FLAG_ACK);
        let mut pkt = base[..20].to_vec();
        pkt[0] = 0x46;
        pkt.extend_from_slice(&[0, 0, 0, 0]);
        pkt.extend_from_slice(&base[20..]);
        match classify(&pkt) {
            PacketKind::Tcp(tcp) => {
                assert_eq!(tcp.flags, TCP_FLAG_ACK);
                assert_eq!(tcp.dst_port, 2);
            }
            other => panic!("expected TCP, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_truncated_tcp_is_plain_ipv4() {
        let pkt = build_tcp_packet(SRC, DST, 1, 2, TCP_FLAG_SYN);
        assert_eq!(classify(&pkt[..30]), PacketKind::Ipv4 { src: SRC, dst: DST });
    }

    #[test]
    fn test_classify_udp_is_plain_ipv4() {
        let mut pkt = build_tcp_packet(SRC, DST, 1, 2, 0);
        pkt[9] = 17;
        assert_eq!(classify(&pkt), PacketKind::Ipv4 { src: SRC, dst: DST });
    }

    #[test]
    fn test_classify_non_ipv4() {
        let mut pkt = vec![0u8; 60];
        pkt[0] = 0x60;
        assert_eq!(classify(&pkt), PacketKind::Other);
        assert_eq!(classify(&[0x45, 0, 0]), PacketKind::Other);
        assert_eq!(classify(&[]), PacketKind::Other);
    }

    #[test]
    fn test_classify_bad_ihl_is_plain_ipv4() {
        let mut pkt = build_tcp_packet(SRC, DST, 1, 2, TCP_FLAG_SYN);
        pkt[0] = 0x44;
        assert_eq!(classify(&pkt), PacketKind::Ipv4 { src: SRC, dst: DST });
    }

    #[test]
    fn test_ipv4_source() {
        let pkt = build_tcp_packet(SRC, DST, 1, 2, 0);
        assert_eq!(ipv4_source(&pkt), Some(SRC));
        assert_eq!(ipv4_source(&pkt[..10]), None);
    }
}
