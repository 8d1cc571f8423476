//! SOCKS5 UDP ASSOCIATE
//!
//! One association per control connection: a loopback socket facing the
//! client, plus up to two outbound sockets (VPN-bound and system). The
//! association lives exactly as long as the control connection.

use crate::core::protocol::{encode_udp_response, UdpRequest};
use crate::core::{resolve, DecodeResult, Egress, Policy, ReplyCode, Server};
use crate::handler::send_reply;
use crate::logger::log;

use anyhow::Result;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Largest datagram accepted from either side
const UDP_BUF_SIZE: usize = 65535;

/// A dual-stack socket takes IPv4 destinations in their v4-mapped form
fn wire_target(dual_stack: bool, target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(v4) if dual_stack => {
            SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
        }
        other => other,
    }
}

/// One outbound UDP socket of an association
struct Outbound {
    socket: UdpSocket,
    dual_stack: bool,
}

impl Outbound {
    fn new(socket: UdpSocket) -> io::Result<Self> {
        let dual_stack = socket.local_addr()?.is_ipv6();
        Ok(Self { socket, dual_stack })
    }

    async fn forward(&self, payload: &[u8], target: SocketAddr, egress: Egress, debug: bool) {
        if debug {
            log::debug!(target = %target, egress = %egress, len = payload.len(), "UDP datagram");
        }
        if let Err(e) = self
            .socket
            .send_to(payload, wire_target(self.dual_stack, target))
            .await
        {
            log::debug!(target = %target, error = %e, "UDP send failed");
        }
    }
}

/// Pick the outbound socket for one datagram.
///
/// VPN egress falls back to the system socket when no VPN-bound socket
/// could be opened; system egress never uses the VPN socket.
fn select_outbound<T>(egress: Egress, vpn: Option<T>, system: Option<T>) -> Option<T> {
    match egress {
        Egress::Vpn => vpn.or(system),
        Egress::System => system,
    }
}

/// Handle UDP ASSOCIATE on an already-negotiated control connection
pub async fn handle_udp_associate(
    server: &Server,
    mut control: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let client_sock = match UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await {
        Ok(sock) => Arc::new(sock),
        Err(e) => {
            log::debug!(peer = %peer, error = %e, "Failed to bind UDP client socket");
            send_reply(&mut control, ReplyCode::GeneralFailure, None).await?;
            return Ok(());
        }
    };

    let vpn_sock = match server.dialer.vpn_interface() {
        Some(iface) => match server.dialer.bind_udp(Egress::Vpn).and_then(Outbound::new) {
            Ok(sock) => Some(Arc::new(sock)),
            Err(e) => {
                log::debug!(peer = %peer, bind_if = iface, error = %e, "VPN-bound UDP socket unavailable");
                None
            }
        },
        None => None,
    };
    let sys_sock = match server.dialer.bind_udp(Egress::System).and_then(Outbound::new) {
        Ok(sock) => Some(Arc::new(sock)),
        Err(e) => {
            log::debug!(peer = %peer, error = %e, "System UDP socket unavailable");
            None
        }
    };
    if vpn_sock.is_none() && sys_sock.is_none() {
        send_reply(&mut control, ReplyCode::GeneralFailure, None).await?;
        return Ok(());
    }

    let bind_addr = client_sock.local_addr()?;
    send_reply(&mut control, ReplyCode::Succeeded, Some(bind_addr)).await?;
    if server.debug {
        log::debug!(
            peer = %peer,
            udp_bind = %bind_addr,
            bind_if = server.dialer.vpn_interface().unwrap_or(""),
            "UDP ASSOCIATE"
        );
    }

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let (client_tx, client_rx) = watch::channel::<Option<SocketAddr>>(None);

    let mut tasks = Vec::with_capacity(3);
    tasks.push(tokio::spawn(client_reader(
        Arc::clone(&client_sock),
        vpn_sock.clone(),
        sys_sock.clone(),
        Arc::clone(&server.policy),
        server.debug,
        client_tx,
        cancel.clone(),
    )));
    for (sock, label) in [(vpn_sock, Egress::Vpn), (sys_sock, Egress::System)] {
        if let Some(sock) = sock {
            tasks.push(tokio::spawn(response_forwarder(
                sock,
                Arc::clone(&client_sock),
                client_rx.clone(),
                label,
                cancel.clone(),
            )));
        }
    }

    // The control connection carries no data; EOF or error ends the association
    let mut tmp = [0u8; 512];
    loop {
        match control.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    log::debug!(peer = %peer, "UDP association closed");
    Ok(())
}

/// Read client datagrams and forward their payloads.
///
/// Literal destinations are sent inline. Domains are resolved on a spawned
/// task so a slow lookup does not hold up the rest of the association.
async fn client_reader(
    client_sock: Arc<UdpSocket>,
    vpn_sock: Option<Arc<Outbound>>,
    sys_sock: Option<Arc<Outbound>>,
    policy: Arc<Policy>,
    debug: bool,
    client_tx: watch::Sender<Option<SocketAddr>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = client_sock.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    log::debug!(error = %e, "UDP client socket read failed");
                    break;
                }
            },
        };
        client_tx.send_replace(Some(from));

        let request = match UdpRequest::decode(&buf[..n]) {
            DecodeResult::Ok(req, _) => req,
            DecodeResult::NeedMoreData => {
                log::dropped("udp-client", "truncated header", n);
                continue;
            }
            DecodeResult::Invalid(reason) => {
                log::dropped("udp-client", reason, n);
                continue;
            }
        };

        let UdpRequest { addr, payload } = request;
        let egress = policy.egress_for(addr.domain());
        let sock = match select_outbound(egress, vpn_sock.as_ref(), sys_sock.as_ref()) {
            Some(sock) => Arc::clone(sock),
            None => {
                log::dropped("udp-client", "no outbound socket for egress", n);
                continue;
            }
        };

        if let Some(target) = addr.socket_addr() {
            sock.forward(payload, target, egress, debug).await;
            continue;
        }

        let payload = payload.to_vec();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = resolve(&addr) => match res {
                    Ok(target) => sock.forward(&payload, target, egress, debug).await,
                    Err(e) => log::debug!(target = %addr, error = %e, "UDP resolve failed"),
                },
            }
        });
    }
}

/// Wrap replies from one outbound socket and return them to the client
async fn response_forwarder(
    outbound: Arc<Outbound>,
    client_sock: Arc<UdpSocket>,
    client_rx: watch::Receiver<Option<SocketAddr>>,
    egress: Egress,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = outbound.socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    log::debug!(egress = %egress, error = %e, "UDP outbound socket read failed");
                    break;
                }
            },
        };

        let client = *client_rx.borrow();
        let client = match client {
            Some(addr) => addr,
            None => {
                log::dropped("udp-response", "no client address yet", n);
                continue;
            }
        };

        let frame = encode_udp_response(from, &buf[..n]);
        if let Err(e) = client_sock.send_to(&frame, client).await {
            log::debug!(client = %client, error = %e, "UDP response write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_target_maps_ipv4_on_dual_stack() {
        let v4: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        assert_eq!(
            wire_target(true, v4),
            "[::ffff:192.0.2.1]:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(wire_target(true, v6), v6);
        assert_eq!(wire_target(false, v4), v4);
    }

    #[test]
    fn test_select_outbound_vpn_prefers_vpn_socket() {
        assert_eq!(select_outbound(Egress::Vpn, Some("vpn"), Some("sys")), Some("vpn"));
    }

    #[test]
    fn test_select_outbound_vpn_falls_back_to_system() {
        assert_eq!(select_outbound(Egress::Vpn, None, Some("sys")), Some("sys"));
    }

    #[test]
    fn test_select_outbound_system_never_uses_vpn() {
        assert_eq!(select_outbound(Egress::System, Some("vpn"), Some("sys")), Some("sys"));
        assert_eq!(select_outbound(Egress::System, Some("vpn"), None), None);
    }
}
