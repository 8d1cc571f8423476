//! Core steering module
//!
//! This module contains the logic shared by the SOCKS relay and the
//! packet dataplane:
//! - Domain and CIDR matching
//! - The steering policy
//! - SOCKS5 wire format and outbound dialing
//! - Packet header classification
//! - Traffic counters

pub mod dial;
pub mod ip_filter;
pub mod matcher;
pub mod packet;
pub mod policy;
pub mod protocol;
mod relay;
mod server;
pub mod stats;

pub use dial::{reply_for_io_error, resolve, Dialer};
pub use ip_filter::HostAddresses;
pub use matcher::{domain_matches, parse_cidr_host, CidrSet, DomainList};
pub use policy::{Egress, Policy, PolicyBuilder, SourceVerdict};
pub use protocol::{Address, DecodeResult, ReplyCode, SocksCmd};
pub use relay::{copy_bidirectional_counted, CopyResult};
pub use server::{Server, ServerBuilder};
pub use stats::{CounterSnapshot, Counters};
