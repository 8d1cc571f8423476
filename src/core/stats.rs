//! Dataplane packet/byte counters and the periodic reporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::logger::log;

/// Monotonic packet and byte counters for both directions
#[derive(Debug, Default)]
pub struct Counters {
    /// Packets written to the interface (transport -> interface)
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    /// Packets handed to the transport (interface -> transport)
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
}

/// Point-in-time copy of [`Counters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one inbound packet of `len` bytes
    #[inline]
    pub fn record_in(&self, len: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Record one outbound packet of `len` bytes
    #[inline]
    pub fn record_out(&self, len: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Format bytes into a human-readable string (KB, MB, GB)
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Spawn a task logging a counter snapshot every `every` until cancelled.
///
/// Returns `None` when the interval is zero.
pub fn spawn_reporter(
    counters: Arc<Counters>,
    every: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let s = counters.snapshot();
                    log::info!(
                        packets_in = s.packets_in,
                        bytes_in = %format_bytes(s.bytes_in),
                        packets_out = s.packets_out,
                        bytes_out = %format_bytes(s.bytes_out),
                        "[stats] in={} pkts / {} bytes, out={} pkts / {} bytes",
                        s.packets_in, s.bytes_in, s.packets_out, s.bytes_out
                    );
                }
                _ = cancel.cancelled() => break,
            }
        }
    }))
}
