//! Packet dataplane
//!
//! Two pumps run concurrently between the virtual interface and the
//! transport:
//! - outbound: interface -> [`OutboundFilter`] -> [`Transceiver::send`]
//! - inbound: [`InboundPacket`] channel -> [`InboundFilter`] -> interface
//!
//! Counters are bumped only for packets that were actually sent or written.

mod device;
mod filter;
mod transceiver;

pub use device::{open_tun, PacketSink, PacketSource, TunReader, TunSink, TunSource, TunWriter, MAX_PACKET_SIZE};
pub use filter::{InboundFilter, OutboundFilter, Verdict};
pub use transceiver::{
    InboundPacket, Transceiver, TransferPath, UdpTransceiver, INBOUND_CHANNEL_SIZE,
};

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{Counters, Policy};
use crate::error::{DataplaneError, Result};
use crate::logger::log;

/// The dataplane loop and its shared state
pub struct Dataplane {
    transceiver: Arc<dyn Transceiver>,
    outbound_filter: OutboundFilter,
    inbound_filter: InboundFilter,
    counters: Arc<Counters>,
    debug: bool,
}

impl Dataplane {
    pub fn new(
        transceiver: Arc<dyn Transceiver>,
        policy: Arc<Policy>,
        counters: Arc<Counters>,
        debug: bool,
    ) -> Self {
        Self {
            transceiver,
            outbound_filter: OutboundFilter::new(Arc::clone(&policy)),
            inbound_filter: InboundFilter::new(policy),
            counters,
            debug,
        }
    }

    /// Run both pumps until `cancel` fires or either side closes.
    ///
    /// Returns an error only when the interface read fails.
    pub async fn run<S, K>(
        &self,
        source: S,
        sink: K,
        inbound_rx: mpsc::Receiver<InboundPacket>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: PacketSource + 'static,
        K: PacketSink + 'static,
    {
        log::info!(
            outbound_filter = self.outbound_filter.enabled(),
            block_new_inbound = self.inbound_filter.enabled(),
            "Dataplane running"
        );

        // Either pump exiting stops the other
        let stop = cancel.child_token();

        let outbound = tokio::spawn(outbound_pump(
            source,
            Arc::clone(&self.transceiver),
            self.outbound_filter.clone(),
            Arc::clone(&self.counters),
            self.debug,
            stop.clone(),
        ));
        let inbound = tokio::spawn(inbound_pump(
            sink,
            inbound_rx,
            self.inbound_filter.clone(),
            Arc::clone(&self.counters),
            self.debug,
            stop,
        ));

        let (out_res, in_res) = tokio::join!(outbound, inbound);
        if let Err(e) = in_res {
            log::warn!(error = %e, "Inbound pump panicked");
        }
        let result = match out_res {
            Ok(res) => res,
            Err(e) => Err(DataplaneError::Other(format!("outbound pump panicked: {}", e))),
        };
        log::info!("Dataplane stopped");
        result
    }
}

async fn outbound_pump<S: PacketSource>(
    mut source: S,
    transceiver: Arc<dyn Transceiver>,
    filter: OutboundFilter,
    counters: Arc<Counters>,
    debug: bool,
    stop: CancellationToken,
) -> Result<()> {
    let _guard = stop.clone().drop_guard();
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let n = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            res = source.recv(&mut buf) => match res {
                Ok(0) => {
                    log::info!("Interface closed");
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => continue,
                Err(e) => {
                    return Err(DataplaneError::Interface(format!("read failed: {}", e)));
                }
            },
        };

        if let Verdict::Drop(reason) = filter.check(&buf[..n]) {
            log::dropped("outbound", reason, n);
            continue;
        }

        let packet = Bytes::copy_from_slice(&buf[..n]);
        match transceiver.send(TransferPath::Any, packet).await {
            Ok(()) => {
                counters.record_out(n);
                if debug {
                    log::debug!(len = n, "-> transport");
                }
            }
            Err(e) => log::debug!(len = n, error = %e, "Transport send failed"),
        }
    }
}

async fn inbound_pump<K: PacketSink>(
    mut sink: K,
    mut inbound_rx: mpsc::Receiver<InboundPacket>,
    filter: InboundFilter,
    counters: Arc<Counters>,
    debug: bool,
    stop: CancellationToken,
) {
    let _guard = stop.clone().drop_guard();
    loop {
        let msg = tokio::select! {
            _ = stop.cancelled() => break,
            msg = inbound_rx.recv() => match msg {
                Some(msg) => msg,
                None => {
                    log::info!("Transport channel closed");
                    break;
                }
            },
        };

        let len = msg.packet.len();
        if debug {
            log::debug!(len = len, source = %msg.source, "<- transport");
        }
        if let Verdict::Drop(reason) = filter.check(&msg.packet) {
            log::dropped("inbound", reason, len);
            continue;
        }

        match sink.send(&msg.packet).await {
            Ok(()) => counters.record_in(len),
            Err(e) => log::debug!(len = len, error = %e, "Interface write failed"),
        }
    }
}
