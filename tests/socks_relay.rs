use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use vpn_steer::core::Server;
use vpn_steer::server_runner::{start_socks, SocksHandle};

const STEP: Duration = Duration::from_secs(5);

async fn relay() -> SocksHandle {
    let server = Server::builder().dial_timeout(Duration::from_secs(5)).build();
    start_socks("127.0.0.1:0".parse().unwrap(), Arc::new(server))
        .await
        .unwrap()
}

/// Connect and complete the no-auth greeting
async fn greet(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [5, 0]);
    stream
}

fn ipv4_request(cmd: u8, target: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = target else {
        panic!("IPv4 target expected");
    };
    let mut req = vec![5, cmd, 0, 1];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    req
}

async fn read_reply(stream: &mut TcpStream) -> [u8; 10] {
    let mut reply = [0u8; 10];
    timeout(STEP, stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    reply
}

#[tokio::test]
async fn test_connect_relays_data() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut s, _) = echo.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = s.read(&mut buf).await.unwrap();
        s.write_all(&buf[..n]).await.unwrap();
    });

    let socks = relay().await;
    let mut client = greet(socks.local_addr()).await;
    client.write_all(&ipv4_request(1, echo_addr)).await.unwrap();
    let reply = read_reply(&mut client).await;
    assert_eq!(reply[..2], [5, 0x00]);

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(STEP, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ping");
    socks.stop().await;
}

#[tokio::test]
async fn test_connect_refused_port_replies_connection_refused() {
    let closed = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };

    let socks = relay().await;
    let mut client = greet(socks.local_addr()).await;
    client.write_all(&ipv4_request(1, closed)).await.unwrap();
    let reply = read_reply(&mut client).await;
    assert_eq!(reply, [5, 0x05, 0, 1, 0, 0, 0, 0, 0, 0]);
    socks.stop().await;
}

#[tokio::test]
async fn test_connect_unresolvable_domain_replies_host_unreachable() {
    let socks = relay().await;
    let mut client = greet(socks.local_addr()).await;

    let host = b"does-not-exist.invalid";
    let mut req = vec![5, 1, 0, 3, host.len() as u8];
    req.extend_from_slice(host);
    req.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&req).await.unwrap();

    let reply = read_reply(&mut client).await;
    assert_eq!(reply[1], 0x04);
    socks.stop().await;
}

#[tokio::test]
async fn test_bad_greeting_version_closes_silently() {
    let socks = relay().await;
    let mut client = TcpStream::connect(socks.local_addr()).await.unwrap();
    client.write_all(&[4, 1]).await.unwrap();

    let mut buf = Vec::new();
    match timeout(STEP, client.read_to_end(&mut buf)).await.unwrap() {
        Ok(_) => assert!(buf.is_empty()),
        // A reset is also a silent close
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }
    socks.stop().await;
}

#[tokio::test]
async fn test_bind_command_not_supported() {
    let socks = relay().await;
    let mut client = greet(socks.local_addr()).await;
    client
        .write_all(&ipv4_request(2, "127.0.0.1:80".parse().unwrap()))
        .await
        .unwrap();
    let reply = read_reply(&mut client).await;
    assert_eq!(reply[1], 0x07);
    socks.stop().await;
}

#[tokio::test]
async fn test_udp_associate_round_trip() {
    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((n, from)) = echo.recv_from(&mut buf).await else {
                break;
            };
            let _ = echo.send_to(&buf[..n], from).await;
        }
    });

    let socks = relay().await;
    let mut control = greet(socks.local_addr()).await;
    control
        .write_all(&ipv4_request(3, "0.0.0.0:0".parse().unwrap()))
        .await
        .unwrap();
    let reply = read_reply(&mut control).await;
    assert_eq!(reply[..4], [5, 0x00, 0, 1]);
    let relay_addr = SocketAddr::from((
        [reply[4], reply[5], reply[6], reply[7]],
        u16::from_be_bytes([reply[8], reply[9]]),
    ));
    assert_ne!(relay_addr.port(), 0);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut frame = vec![0, 0, 0];
    frame.extend_from_slice(&ipv4_request(0, echo_addr)[3..]);
    frame.extend_from_slice(b"hello udp");
    client.send_to(&frame, relay_addr).await.unwrap();

    let mut buf = [0u8; 1500];
    let (n, from) = timeout(STEP, client.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(from, relay_addr);
    // Header names the responder, payload is intact
    assert_eq!(&buf[..n], &frame[..]);

    drop(control);
    socks.stop().await;
}

/// Open a UDP association and return the control stream and relay address
async fn associate(socks: &SocksHandle) -> (TcpStream, SocketAddr) {
    let mut control = greet(socks.local_addr()).await;
    control
        .write_all(&ipv4_request(3, "0.0.0.0:0".parse().unwrap()))
        .await
        .unwrap();
    let reply = read_reply(&mut control).await;
    assert_eq!(reply[..4], [5, 0x00, 0, 1]);
    let relay_addr = SocketAddr::from((
        [reply[4], reply[5], reply[6], reply[7]],
        u16::from_be_bytes([reply[8], reply[9]]),
    ));
    (control, relay_addr)
}

fn spawn_udp_echo(echo: UdpSocket) {
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((n, from)) = echo.recv_from(&mut buf).await else {
                break;
            };
            let _ = echo.send_to(&buf[..n], from).await;
        }
    });
}

#[tokio::test]
async fn test_udp_associate_ipv6_round_trip() {
    let Ok(echo) = UdpSocket::bind("[::1]:0").await else {
        // No IPv6 loopback on this host
        return;
    };
    let echo_addr = echo.local_addr().unwrap();
    spawn_udp_echo(echo);

    let socks = relay().await;
    let (control, relay_addr) = associate(&socks).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut frame = vec![0, 0, 0, 4];
    frame.extend_from_slice(&std::net::Ipv6Addr::LOCALHOST.octets());
    frame.extend_from_slice(&echo_addr.port().to_be_bytes());
    frame.extend_from_slice(b"hi6");
    client.send_to(&frame, relay_addr).await.unwrap();

    let mut buf = [0u8; 1500];
    let (n, _) = timeout(STEP, client.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], &frame[..]);

    drop(control);
    socks.stop().await;
}

#[tokio::test]
async fn test_udp_associate_domain_destination() {
    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    spawn_udp_echo(echo);

    let socks = relay().await;
    let (control, relay_addr) = associate(&socks).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let host = b"localhost";
    let mut frame = vec![0, 0, 0, 3, host.len() as u8];
    frame.extend_from_slice(host);
    frame.extend_from_slice(&echo_addr.port().to_be_bytes());
    frame.extend_from_slice(b"by name");
    client.send_to(&frame, relay_addr).await.unwrap();

    let mut buf = [0u8; 1500];
    let (n, _) = timeout(STEP, client.recv_from(&mut buf)).await.unwrap().unwrap();
    // The reply names the responder by address
    let mut expected = vec![0, 0, 0];
    expected.extend_from_slice(&ipv4_request(0, echo_addr)[3..]);
    expected.extend_from_slice(b"by name");
    assert_eq!(&buf[..n], &expected[..]);

    drop(control);
    socks.stop().await;
}

#[tokio::test]
async fn test_udp_fragmented_datagram_is_dropped() {
    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();

    let socks = relay().await;
    let mut control = greet(socks.local_addr()).await;
    control
        .write_all(&ipv4_request(3, "0.0.0.0:0".parse().unwrap()))
        .await
        .unwrap();
    let reply = read_reply(&mut control).await;
    let relay_addr = SocketAddr::from((
        [reply[4], reply[5], reply[6], reply[7]],
        u16::from_be_bytes([reply[8], reply[9]]),
    ));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut frame = vec![0, 0, 1];
    frame.extend_from_slice(&ipv4_request(0, echo_addr)[3..]);
    frame.extend_from_slice(b"fragment");
    client.send_to(&frame, relay_addr).await.unwrap();

    let mut buf = [0u8; 64];
    assert!(timeout(Duration::from_millis(300), echo.recv_from(&mut buf))
        .await
        .is_err());
    socks.stop().await;
}

#[tokio::test]
async fn test_stop_refuses_new_connections() {
    let socks = relay().await;
    let addr = socks.local_addr();
    socks.stop().await;
    assert!(TcpStream::connect(addr).await.is_err());
}
