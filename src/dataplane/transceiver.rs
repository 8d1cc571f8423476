//! Boundary to the outbound transport
//!
//! The dataplane sends packets through [`Transceiver::send`] and receives
//! them as [`InboundPacket`] messages on an mpsc channel. Per-source order is
//! whatever the transceiver pushes; the inbound pump never reorders.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{DataplaneError, Result};
use crate::logger::log;

/// Capacity of the inbound packet channel
pub const INBOUND_CHANNEL_SIZE: usize = 1024;

/// Where an outbound packet should go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferPath {
    /// Let the transport pick
    #[default]
    Any,
}

/// One packet delivered by the transport
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub source: SocketAddr,
    pub packet: Bytes,
}

/// Outbound half of the transport boundary
#[async_trait]
pub trait Transceiver: Send + Sync {
    async fn send(&self, path: TransferPath, packet: Bytes) -> Result<()>;
}

/// Carries one IP packet per UDP datagram to a relay endpoint
#[derive(Debug, Clone)]
pub struct UdpTransceiver {
    socket: Arc<UdpSocket>,
    endpoint: SocketAddr,
}

impl UdpTransceiver {
    /// Bind `bind` and send to `endpoint` by default
    pub async fn bind(bind: SocketAddr, endpoint: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind).await.map_err(|e| {
            DataplaneError::Transport(format!("failed to bind transport socket {}: {}", bind, e))
        })?;
        log::info!(
            local = %socket.local_addr()?,
            endpoint = %endpoint,
            "Datagram transport ready"
        );
        Ok(Self {
            socket: Arc::new(socket),
            endpoint,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawn the receive loop feeding `tx`.
    ///
    /// Datagrams from anyone but the endpoint are discarded. The loop ends on
    /// cancellation or once the channel's receiver is gone.
    pub fn spawn_receiver(
        &self,
        tx: mpsc::Sender<InboundPacket>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let endpoint = self.endpoint;
        tokio::spawn(async move {
            let mut buf = vec![0u8; super::device::MAX_PACKET_SIZE];
            loop {
                let (n, source) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = socket.recv_from(&mut buf) => match res {
                        Ok(v) => v,
                        Err(e) => {
                            // ICMP unreachable surfaces here on some platforms
                            log::debug!(error = %e, "Transport receive error");
                            continue;
                        }
                    },
                };
                if source != endpoint {
                    log::dropped("transport", "unexpected source", n);
                    continue;
                }
                let packet = InboundPacket {
                    source,
                    packet: Bytes::copy_from_slice(&buf[..n]),
                };
                if tx.send(packet).await.is_err() {
                    break;
                }
            }
        })
    }
}

#[async_trait]
impl Transceiver for UdpTransceiver {
    async fn send(&self, path: TransferPath, packet: Bytes) -> Result<()> {
        let dest = match path {
            TransferPath::Any => self.endpoint,
        };
        self.socket
            .send_to(&packet, dest)
            .await
            .map_err(|e| DataplaneError::Transport(format!("send to {}: {}", dest, e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_udp_transceiver_round_trip() {
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();

        let transceiver = UdpTransceiver::bind("127.0.0.1:0".parse().unwrap(), relay_addr)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = transceiver.spawn_receiver(tx, cancel.clone());

        transceiver
            .send(TransferPath::Any, Bytes::from_static(b"outbound"))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = relay.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"outbound");
        assert_eq!(from, transceiver.local_addr().unwrap());

        relay.send_to(b"inbound", from).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.source, relay_addr);
        assert_eq!(&msg.packet[..], b"inbound");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_transceiver_ignores_strangers() {
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transceiver = UdpTransceiver::bind(
            "127.0.0.1:0".parse().unwrap(),
            relay.local_addr().unwrap(),
        )
        .await
        .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let _handle = transceiver.spawn_receiver(tx, cancel.clone());
        let local = transceiver.local_addr().unwrap();

        stranger.send_to(b"spoofed", local).await.unwrap();
        relay.send_to(b"genuine", local).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&msg.packet[..], b"genuine");
        cancel.cancel();
    }

    #[test]
    fn test_transfer_path_default_is_any() {
        assert_eq!(TransferPath::default(), TransferPath::Any);
    }
}
