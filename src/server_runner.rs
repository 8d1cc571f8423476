//! SOCKS5 listener startup and accept loop

use crate::core::Server;
use crate::handler::process_connection;
use crate::logger::log;

use anyhow::{anyhow, Result};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// TCP keepalive interval for accepted client connections
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Listen backlog
const TCP_BACKLOG: i32 = 1024;

/// Handle to a running SOCKS5 relay
#[derive(Debug)]
pub struct SocksHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_loop: JoinHandle<()>,
}

impl SocksHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listener and wait for the accept loop to exit.
    ///
    /// Connections already being relayed keep running until their peers
    /// close them.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.accept_loop.await {
            log::warn!(error = %e, "SOCKS accept loop ended abnormally");
        }
        log::info!(address = %self.local_addr, "SOCKS5 relay stopped");
    }
}

/// Bind a TCP listener with SO_REUSEADDR for fast restarts
fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| anyhow!("failed to bind SOCKS listener on {}: {}", addr, e))?;
    socket.listen(TCP_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Start the SOCKS5 relay on `listen_addr`.
///
/// Bind failures are returned; everything after that runs on a background
/// task until [`SocksHandle::stop`] is called.
pub async fn start_socks(listen_addr: SocketAddr, server: Arc<Server>) -> Result<SocksHandle> {
    let listener = bind_listener(listen_addr)?;
    let local_addr = listener.local_addr()?;
    let cancel = CancellationToken::new();

    log::info!(
        address = %local_addr,
        bind_if = server.dialer.vpn_interface().unwrap_or("none"),
        allow_domains = server.policy.allow_domain_count(),
        exclude_domains = server.policy.deny_domain_count(),
        "SOCKS5 relay started"
    );

    let accept_loop = tokio::spawn(run_accept_loop(listener, server, cancel.clone()));

    Ok(SocksHandle {
        local_addr,
        cancel,
        accept_loop,
    })
}

async fn run_accept_loop(listener: TcpListener, server: Arc<Server>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((stream, peer)) => {
                let peer_str = peer.to_string();
                log::connection(&peer_str, "new");

                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    let _ = stream.set_nodelay(true);
                    let keepalive = TcpKeepalive::new()
                        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
                        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
                    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

                    if let Err(e) = process_connection(&server, stream, peer).await {
                        log::debug!(peer = %peer_str, error = %e, "Connection error");
                    }
                    log::connection(&peer_str, "closed");
                });
            }
            Err(e) => {
                // Transient (EMFILE, ECONNABORTED, ...): keep accepting
                log::error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    // listener dropped here, closing the socket
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let handle = start_socks(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(Server::builder().build()),
        )
        .await
        .unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        TcpStream::connect(handle.local_addr()).await.unwrap();
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_listener() {
        let handle = start_socks(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(Server::builder().build()),
        )
        .await
        .unwrap();
        let addr = handle.local_addr();
        handle.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let result = start_socks(addr, Arc::new(Server::builder().build())).await;
        assert!(result.is_err());
    }
}
