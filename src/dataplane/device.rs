//! Virtual interface access
//!
//! The pumps only need "read one datagram" and "write one datagram", so the
//! TUN device is reached through two small traits. Tests drive the pumps with
//! in-memory implementations.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::{DataplaneError, Result};
use crate::logger::log;

/// Largest packet read from the interface in one call
pub const MAX_PACKET_SIZE: usize = 65536;

/// Read side of a whole-datagram interface
#[async_trait]
pub trait PacketSource: Send {
    /// Read one IP datagram into `buf`; `Ok(0)` means the device closed
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write side of a whole-datagram interface
#[async_trait]
pub trait PacketSink: Send {
    /// Write one IP datagram
    async fn send(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// [`PacketSource`] over any async reader that yields one datagram per read
#[derive(Debug)]
pub struct TunReader<R>(R);

/// [`PacketSink`] over any async writer that accepts one datagram per write
#[derive(Debug)]
pub struct TunWriter<W>(W);

impl<R> TunReader<R> {
    pub fn new(inner: R) -> Self {
        Self(inner)
    }
}

impl<W> TunWriter<W> {
    pub fn new(inner: W) -> Self {
        Self(inner)
    }
}

#[async_trait]
impl<R> PacketSource for TunReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }
}

#[async_trait]
impl<W> PacketSink for TunWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        self.0.write_all(packet).await
    }
}

pub type TunSource = TunReader<ReadHalf<tun::AsyncDevice>>;
pub type TunSink = TunWriter<WriteHalf<tun::AsyncDevice>>;

/// Open the named TUN device and split it into read and write halves.
///
/// Addressing, MTU and link state are left to the network configurator.
pub fn open_tun(name: &str, mtu: u16) -> Result<(TunSource, TunSink)> {
    let mut config = tun::Configuration::default();
    config.name(name).mtu(i32::from(mtu));

    #[cfg(target_os = "linux")]
    config.platform(|config| {
        config.packet_information(false);
    });

    let device = tun::create_as_async(&config)
        .map_err(|e| DataplaneError::Interface(format!("failed to open {}: {}", name, e)))?;
    log::info!(name = name, mtu = mtu, "TUN device opened");

    let (reader, writer) = tokio::io::split(device);
    Ok((TunReader::new(reader), TunWriter::new(writer)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_and_writer_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = TunWriter::new(a);
        let mut reader = TunReader::new(b);

        writer.send(&[0x45, 0, 0, 20]).await.unwrap();
        let mut buf = [0u8; 64];
        let n = reader.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x45, 0, 0, 20]);
    }

    #[tokio::test]
    async fn test_reader_reports_close_as_zero() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut reader = TunReader::new(b);
        let mut buf = [0u8; 16];
        assert_eq!(reader.recv(&mut buf).await.unwrap(), 0);
    }
}
