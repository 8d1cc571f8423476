//! Shared state for the SOCKS5 relay
//!
//! The Server struct is cloned into every connection task behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use super::dial::{Dialer, DEFAULT_DIAL_TIMEOUT};
use super::policy::Policy;

/// SOCKS5 relay context
#[derive(Debug)]
pub struct Server {
    /// Steering policy consulted per connection and per datagram
    pub policy: Arc<Policy>,
    /// Outbound socket factory
    pub dialer: Dialer,
    /// Emit per-connection debug lines
    pub debug: bool,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

/// Builder for constructing a Server
#[derive(Debug)]
pub struct ServerBuilder {
    policy: Option<Arc<Policy>>,
    vpn_interface: Option<String>,
    dial_timeout: Duration,
    debug: bool,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            policy: None,
            vpn_interface: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            debug: false,
        }
    }

    /// Set the steering policy
    pub fn policy(mut self, policy: Arc<Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Interface VPN-egress sockets are bound to
    pub fn vpn_interface(mut self, name: Option<String>) -> Self {
        self.vpn_interface = name;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Build the server; a missing policy means "everything through the VPN"
    pub fn build(self) -> Server {
        Server {
            policy: self.policy.unwrap_or_default(),
            dialer: Dialer::new(self.vpn_interface, self.dial_timeout),
            debug: self.debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::Egress;

    #[test]
    fn test_builder_defaults() {
        let server = Server::builder().build();
        assert_eq!(server.dialer.dial_timeout(), DEFAULT_DIAL_TIMEOUT);
        assert!(server.dialer.vpn_interface().is_none());
        assert!(!server.debug);
        assert_eq!(server.policy.egress_for(Some("example.com")), Egress::Vpn);
    }

    #[test]
    fn test_builder_overrides() {
        let server = Server::builder()
            .vpn_interface(Some("urnet0".to_string()))
            .dial_timeout(Duration::from_secs(3))
            .debug(true)
            .build();
        assert_eq!(server.dialer.vpn_interface(), Some("urnet0"));
        assert_eq!(server.dialer.dial_timeout(), Duration::from_secs(3));
        assert!(server.debug);
    }
}
