//! Userspace packet filters applied by the pumps
//!
//! Both filters read only fixed header offsets (see [`crate::core::packet`]).
//! Anything that is not IPv4, or too short, is forwarded untouched.

use std::sync::Arc;

use crate::core::packet::{classify, ipv4_source, PacketKind};
use crate::core::Policy;

/// Filter outcome for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    Drop(&'static str),
}

impl Verdict {
    pub fn is_forward(&self) -> bool {
        matches!(self, Verdict::Forward)
    }
}

/// Source-address filter for packets leaving through the tunnel
#[derive(Debug, Clone)]
pub struct OutboundFilter {
    policy: Arc<Policy>,
    enabled: bool,
}

impl OutboundFilter {
    pub fn new(policy: Arc<Policy>) -> Self {
        let enabled = policy.filters_outbound();
        Self { policy, enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn check(&self, packet: &[u8]) -> Verdict {
        if !self.enabled {
            return Verdict::Forward;
        }
        match ipv4_source(packet) {
            Some(src) => {
                let verdict = self.policy.check_source(src);
                if verdict.is_forward() {
                    Verdict::Forward
                } else {
                    Verdict::Drop(verdict.reason())
                }
            }
            None => Verdict::Forward,
        }
    }
}

/// Block-new-inbound filter for packets arriving from the transport
#[derive(Debug, Clone)]
pub struct InboundFilter {
    policy: Arc<Policy>,
}

impl InboundFilter {
    pub fn new(policy: Arc<Policy>) -> Self {
        Self { policy }
    }

    pub fn enabled(&self) -> bool {
        self.policy.block_new_inbound()
    }

    /// Drop inbound SYN (no ACK) unless the source is allow-listed, and drop
    /// every other TCP segment without ACK
    pub fn check(&self, packet: &[u8]) -> Verdict {
        if !self.policy.block_new_inbound() {
            return Verdict::Forward;
        }
        let tcp = match classify(packet) {
            PacketKind::Tcp(tcp) => tcp,
            PacketKind::Ipv4 { .. } | PacketKind::Other => return Verdict::Forward,
        };
        if tcp.syn() && !tcp.ack() {
            if self.policy.inbound_allowed(tcp.src) {
                Verdict::Forward
            } else {
                Verdict::Drop("new inbound connection not in allow list")
            }
        } else if !tcp.ack() {
            Verdict::Drop("inbound TCP segment without ACK")
        } else {
            Verdict::Forward
        }
    }
}
