//! Connection handling logic
//!
//! This module contains the SOCKS5 handshake, request dispatch and the
//! CONNECT relay. UDP ASSOCIATE is handed over to [`crate::udp`].

use crate::core::protocol::{
    atyp_supported, encode_method_reply, encode_reply, SOCKS_VERSION,
};
use crate::core::{
    copy_bidirectional_counted, reply_for_io_error, resolve, Address, ReplyCode, Server, SocksCmd,
};
use crate::error::DataplaneError;
use crate::logger::log;
use crate::udp::handle_udp_associate;

use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// A decoded SOCKS5 request
#[derive(Debug)]
pub struct SocksRequest {
    pub cmd: SocksCmd,
    pub addr: Address,
}

/// Write a reply and flush it before the caller drops the stream
pub async fn send_reply<S>(stream: &mut S, code: ReplyCode, bind: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(code, bind)).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the method greeting and answer "no authentication".
///
/// Any version other than 5, or an empty method list, closes the
/// connection without a reply.
pub async fn negotiate_method<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let [ver, nmethods] = header;
    if ver != SOCKS_VERSION {
        return Err(anyhow!("unsupported SOCKS version {}", ver));
    }
    if nmethods == 0 {
        return Err(anyhow!("empty method list"));
    }
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&encode_method_reply()).await?;
    Ok(())
}

/// Read the request header and destination.
///
/// Returns `Ok(None)` when the request was answered with an error reply
/// (bad version, unsupported command or address type, unusable domain).
pub async fn read_request<S>(stream: &mut S) -> Result<Option<SocksRequest>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [ver, cmd, _rsv, atyp] = header;

    if ver != SOCKS_VERSION {
        send_reply(stream, ReplyCode::GeneralFailure, None).await?;
        return Ok(None);
    }

    let cmd = match SocksCmd::try_from(cmd) {
        Ok(cmd @ (SocksCmd::Connect | SocksCmd::UdpAssociate)) => cmd,
        Ok(SocksCmd::Bind) | Err(_) => {
            // Drain the destination so the reply is not lost to a reset
            if atyp_supported(atyp) {
                let _ = Address::read_with_type(stream, atyp).await;
            }
            send_reply(stream, ReplyCode::CommandNotSupported, None).await?;
            return Ok(None);
        }
    };

    let addr = match Address::read_with_type(stream, atyp).await {
        Ok(addr) => addr,
        Err(DataplaneError::Protocol(msg)) => {
            log::debug!(error = %msg, "Rejecting request address");
            send_reply(stream, ReplyCode::AddressTypeNotSupported, None).await?;
            return Ok(None);
        }
        Err(DataplaneError::Resolve(msg)) => {
            log::debug!(error = %msg, "Unusable domain in request");
            send_reply(stream, ReplyCode::HostUnreachable, None).await?;
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Some(SocksRequest { cmd, addr }))
}

/// Process a single accepted SOCKS connection
pub async fn process_connection(server: &Server, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    negotiate_method(&mut stream).await?;

    let request = match read_request(&mut stream).await? {
        Some(req) => req,
        None => {
            let _ = stream.shutdown().await;
            return Ok(());
        }
    };

    match request.cmd {
        SocksCmd::Connect => handle_connect(server, stream, request.addr, peer).await,
        SocksCmd::UdpAssociate => handle_udp_associate(server, stream, peer).await,
        SocksCmd::Bind => Ok(()),
    }
}

/// Handle TCP CONNECT command
async fn handle_connect(
    server: &Server,
    mut client: TcpStream,
    target: Address,
    peer: SocketAddr,
) -> Result<()> {
    let remote_addr = match resolve(&target).await {
        Ok(addr) => addr,
        Err(e) => {
            log::debug!(peer = %peer, target = %target, error = %e, "Resolve failed");
            send_reply(&mut client, ReplyCode::HostUnreachable, None).await?;
            let _ = client.shutdown().await;
            return Ok(());
        }
    };

    let egress = server.policy.egress_for(target.domain());
    if server.debug {
        log::debug!(
            peer = %peer,
            target = %target,
            ip = %remote_addr.ip(),
            bind_if = server.dialer.vpn_interface().unwrap_or(""),
            egress = %egress,
            "CONNECT"
        );
    }

    let remote = match server.dialer.connect(remote_addr, egress).await {
        Ok(stream) => stream,
        Err(e) => {
            let code = reply_for_io_error(&e);
            log::debug!(peer = %peer, target = %remote_addr, error = %e, reply = %code, "Dial failed");
            send_reply(&mut client, code, None).await?;
            let _ = client.shutdown().await;
            return Ok(());
        }
    };

    send_reply(&mut client, ReplyCode::Succeeded, None).await?;

    let result = copy_bidirectional_counted(client, remote).await;
    log::debug!(
        peer = %peer,
        target = %target,
        up = result.a_to_b,
        down = result.b_to_a,
        completed = result.completed,
        "Relay finished"
    );
    Ok(())
}
