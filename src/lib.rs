//! Traffic steering for a VPN client
//!
//! Architecture:
//! - `core/`: policy, matching, SOCKS5 codec, dialing, packet parsing, counters
//! - `dataplane/`: TUN <-> transport packet pumps and their filters
//! - `netconfig/`: per-platform host network configuration
//! - `handler` / `udp`: SOCKS5 CONNECT and UDP ASSOCIATE processing
//! - `server_runner`: SOCKS5 listener and accept loop
//! - `runner`: startup and ordered shutdown

pub mod config;
pub mod core;
pub mod dataplane;
pub mod error;
pub mod handler;
pub mod logger;
pub mod netconfig;
pub mod runner;
pub mod server_runner;
pub mod udp;
