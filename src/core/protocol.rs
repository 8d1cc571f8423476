//! SOCKS5 wire format (RFC 1928), no-auth only
//!
//! Handshake:
//! - Greeting: VER(1)=5 + NMETHODS(1) + METHODS(NMETHODS)
//! - Method selection: VER(1)=5 + METHOD(1)=0 (no auth)
//! - Request: VER(1)=5 + CMD(1) + RSV(1) + ATYP(1) + DST.ADDR + DST.PORT(2)
//! - Reply: VER(1)=5 + REP(1) + RSV(1) + ATYP(1) + BND.ADDR + BND.PORT(2)
//!
//! UDP datagrams carry RSV(2)=0 + FRAG(1)=0 + ATYP + DST.ADDR + DST.PORT + DATA.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{DataplaneError, Result};

pub const SOCKS_VERSION: u8 = 5;
pub const METHOD_NO_AUTH: u8 = 0x00;

/// Address type constants
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// Length of the RSV + FRAG prefix of a UDP datagram
pub const UDP_PREFIX_LEN: usize = 3;

/// Whether `atyp` is one of the three address types understood here
pub fn atyp_supported(atyp: u8) -> bool {
    matches!(atyp, ATYP_IPV4 | ATYP_DOMAIN | ATYP_IPV6)
}

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCmd {
    /// TCP connect
    Connect = 1,
    /// TCP bind (not supported)
    Bind = 2,
    /// UDP associate
    UdpAssociate = 3,
}

impl TryFrom<u8> for SocksCmd {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(SocksCmd::Connect),
            2 => Ok(SocksCmd::Bind),
            3 => Ok(SocksCmd::UdpAssociate),
            other => Err(other),
        }
    }
}

/// Reply codes emitted by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::GeneralFailure => "general failure",
            ReplyCode::NetworkUnreachable => "network unreachable",
            ReplyCode::HostUnreachable => "host unreachable",
            ReplyCode::ConnectionRefused => "connection refused",
            ReplyCode::CommandNotSupported => "command not supported",
            ReplyCode::AddressTypeNotSupported => "address type not supported",
        };
        write!(f, "{:#04x} ({})", self.as_u8(), name)
    }
}

/// Destination address as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    IPv4([u8; 4], u16),
    /// IPv6 address
    IPv6([u8; 16], u16),
    /// Domain name
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::IPv4(v4.ip().octets(), v4.port()),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => Address::IPv4(v4.octets(), v6.port()),
                None => Address::IPv6(v6.ip().octets(), v6.port()),
            },
        }
    }
}

/// Address decode result
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// Successfully decoded
    Ok(T, usize),
    /// Need more data
    NeedMoreData,
    /// Invalid data
    Invalid(&'static str),
}

impl Address {
    /// Decode address from buffer, starting at the ATYP byte
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        if buf.is_empty() {
            return DecodeResult::NeedMoreData;
        }

        match buf[0] {
            ATYP_IPV4 => {
                // 1 (type) + 4 (ip) + 2 (port) = 7 bytes
                if buf.len() < 7 {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                DecodeResult::Ok(Address::IPv4(ip, port), 7)
            }
            ATYP_IPV6 => {
                // 1 (type) + 16 (ip) + 2 (port) = 19 bytes
                if buf.len() < 19 {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                DecodeResult::Ok(Address::IPv6(ip, port), 19)
            }
            ATYP_DOMAIN => {
                // 1 (type) + 1 (len) + len (domain) + 2 (port)
                if buf.len() < 2 {
                    return DecodeResult::NeedMoreData;
                }
                let domain_len = buf[1] as usize;
                if domain_len == 0 {
                    return DecodeResult::Invalid("empty domain");
                }
                let total_len = 1 + 1 + domain_len + 2;
                if buf.len() < total_len {
                    return DecodeResult::NeedMoreData;
                }
                let domain = match std::str::from_utf8(&buf[2..2 + domain_len]) {
                    Ok(s) => s.to_string(),
                    Err(_) => return DecodeResult::Invalid("invalid domain encoding"),
                };
                let port = u16::from_be_bytes([buf[2 + domain_len], buf[3 + domain_len]]);
                DecodeResult::Ok(Address::Domain(domain, port), total_len)
            }
            _ => DecodeResult::Invalid("invalid address type"),
        }
    }

    /// Read ATYP + address + port from a stream.
    ///
    /// An unknown ATYP is reported as [`DataplaneError::Protocol`] so the
    /// caller can answer with 0x08; an empty or non-UTF-8 domain is a
    /// [`DataplaneError::Resolve`] (0x04).
    pub async fn read_from<R>(stream: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = stream.read_u8().await?;
        Self::read_with_type(stream, atyp).await
    }

    /// Read address + port when the ATYP byte has already been consumed
    pub async fn read_with_type<R>(stream: &mut R, atyp: u8) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        match atyp {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await?;
                let port = stream.read_u16().await?;
                Ok(Address::IPv4(ip, port))
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                stream.read_exact(&mut ip).await?;
                let port = stream.read_u16().await?;
                Ok(Address::IPv6(ip, port))
            }
            ATYP_DOMAIN => {
                let len = stream.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                stream.read_exact(&mut name).await?;
                let port = stream.read_u16().await?;
                // The request is fully consumed; an unusable name cannot resolve
                if len == 0 {
                    return Err(DataplaneError::Resolve("empty domain".to_string()));
                }
                let domain = String::from_utf8(name)
                    .map_err(|_| DataplaneError::Resolve("invalid domain encoding".to_string()))?;
                Ok(Address::Domain(domain, port))
            }
            other => Err(DataplaneError::Protocol(format!(
                "unsupported address type {:#04x}",
                other
            ))),
        }
    }

    /// Encode address to buffer
    /// Returns the number of bytes written
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start_len = buf.len();
        match self {
            Address::IPv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::IPv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(domain, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        buf.len() - start_len
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) => *port,
            Address::IPv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// The requested domain name, if the client sent one
    pub fn domain(&self) -> Option<&str> {
        match self {
            Address::Domain(domain, _) => Some(domain),
            _ => None,
        }
    }

    /// The literal socket address, if this is not a domain
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), *port)),
            Address::IPv6(ip, port) => Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), *port)),
            Address::Domain(..) => None,
        }
    }
}

/// Method selection reply accepting "no authentication"
pub fn encode_method_reply() -> [u8; 2] {
    [SOCKS_VERSION, METHOD_NO_AUTH]
}

/// Build a request reply.
///
/// `bind` is reported as BND.ADDR/BND.PORT; `None` yields the all-zero IPv4
/// address used for CONNECT and failure replies.
pub fn encode_reply(code: ReplyCode, bind: Option<SocketAddr>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    buf.push(SOCKS_VERSION);
    buf.push(code.as_u8());
    buf.push(0x00);
    match bind {
        Some(addr) => {
            Address::from(addr).encode(&mut buf);
        }
        None => buf.extend_from_slice(&[ATYP_IPV4, 0, 0, 0, 0, 0, 0]),
    }
    buf
}

/// A client datagram received on a UDP association
#[derive(Debug)]
pub struct UdpRequest<'a> {
    pub addr: Address,
    pub payload: &'a [u8],
}

impl<'a> UdpRequest<'a> {
    /// Decode one datagram. A non-zero RSV/FRAG prefix is invalid: fragments
    /// are not reassembled.
    pub fn decode(buf: &'a [u8]) -> DecodeResult<Self> {
        if buf.len() < UDP_PREFIX_LEN {
            return DecodeResult::NeedMoreData;
        }
        if buf[..UDP_PREFIX_LEN] != [0, 0, 0] {
            return DecodeResult::Invalid("non-zero reserved or fragment field");
        }
        match Address::decode(&buf[UDP_PREFIX_LEN..]) {
            DecodeResult::Ok(addr, len) => {
                let header_len = UDP_PREFIX_LEN + len;
                DecodeResult::Ok(
                    UdpRequest {
                        addr,
                        payload: &buf[header_len..],
                    },
                    header_len,
                )
            }
            DecodeResult::NeedMoreData => DecodeResult::NeedMoreData,
            DecodeResult::Invalid(msg) => DecodeResult::Invalid(msg),
        }
    }
}

/// Wrap a reply from `from` into a SOCKS5 UDP datagram
pub fn encode_udp_response(from: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(UDP_PREFIX_LEN + 19 + payload.len());
    buf.extend_from_slice(&[0, 0, 0]);
    Address::from(from).encode(&mut buf);
    buf.extend_from_slice(payload);
    buf
}
