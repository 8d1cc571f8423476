//! Traffic-steering policy shared by the SOCKS relay and the dataplane.
//!
//! A [`Policy`] is built once at startup and never mutated afterwards, so it
//! is shared as `Arc<Policy>` without locking.

use std::fmt;
use std::net::Ipv4Addr;

use super::ip_filter::HostAddresses;
use super::matcher::{CidrSet, DomainList};

/// Outbound path chosen for a connection or datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Egress {
    /// Bound to the VPN interface
    Vpn,
    /// Host default routing
    System,
}

impl fmt::Display for Egress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Egress::Vpn => write!(f, "vpn"),
            Egress::System => write!(f, "system"),
        }
    }
}

/// Result of the source-address check on an outbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceVerdict {
    Forward,
    /// Source matched the deny-list
    Denied,
    /// Allow-list is non-empty and the source matched none of it
    NotAllowed,
    /// Local-only is on and the source is not one of this host's addresses
    NotLocal,
}

impl SourceVerdict {
    pub fn is_forward(&self) -> bool {
        matches!(self, SourceVerdict::Forward)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            SourceVerdict::Forward => "forward",
            SourceVerdict::Denied => "source in deny list",
            SourceVerdict::NotAllowed => "source not in allow list",
            SourceVerdict::NotLocal => "source is not a local address",
        }
    }
}

/// Immutable per-session steering policy
#[derive(Debug, Clone, Default)]
pub struct Policy {
    allow_domains: DomainList,
    deny_domains: DomainList,
    allow_forward_src: CidrSet,
    deny_forward_src: CidrSet,
    local_only: bool,
    host_addrs: HostAddresses,
    block_new_inbound: bool,
    allow_inbound_src: CidrSet,
    no_fw_rules: bool,
}

impl Policy {
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::default()
    }

    /// Decide the egress path for a destination.
    ///
    /// `domain` is the requested name when the client sent one; IP-literal
    /// destinations pass `None`. Deny is evaluated after allow.
    pub fn egress_for(&self, domain: Option<&str>) -> Egress {
        let mut egress = Egress::Vpn;
        if !self.allow_domains.is_empty() {
            match domain {
                Some(d) if self.allow_domains.matches(d) => {}
                _ => egress = Egress::System,
            }
        }
        if let Some(d) = domain {
            if self.deny_domains.matches(d) {
                egress = Egress::System;
            }
        }
        egress
    }

    /// Whether any outbound source rule is configured
    pub fn filters_outbound(&self) -> bool {
        self.local_only || !self.allow_forward_src.is_empty() || !self.deny_forward_src.is_empty()
    }

    /// Check the source address of a packet leaving through the tunnel.
    ///
    /// Deny is checked before allow, so a source present in both is dropped.
    pub fn check_source(&self, src: Ipv4Addr) -> SourceVerdict {
        if self.deny_forward_src.contains(src) {
            return SourceVerdict::Denied;
        }
        if !self.allow_forward_src.is_empty() && !self.allow_forward_src.contains(src) {
            return SourceVerdict::NotAllowed;
        }
        if self.local_only && !self.host_addrs.contains(src) {
            return SourceVerdict::NotLocal;
        }
        SourceVerdict::Forward
    }

    pub fn block_new_inbound(&self) -> bool {
        self.block_new_inbound
    }

    /// Whether a new inbound connection from `src` may be opened
    pub fn inbound_allowed(&self, src: Ipv4Addr) -> bool {
        self.allow_inbound_src.contains(src)
    }

    pub fn inbound_allow_count(&self) -> usize {
        self.allow_inbound_src.len()
    }

    pub fn local_only(&self) -> bool {
        self.local_only
    }

    pub fn no_fw_rules(&self) -> bool {
        self.no_fw_rules
    }

    pub fn allow_forward_src(&self) -> &CidrSet {
        &self.allow_forward_src
    }

    pub fn deny_forward_src(&self) -> &CidrSet {
        &self.deny_forward_src
    }

    pub fn allow_domain_count(&self) -> usize {
        self.allow_domains.len()
    }

    pub fn deny_domain_count(&self) -> usize {
        self.deny_domains.len()
    }
}

/// Builder for [`Policy`]
#[derive(Debug, Default)]
pub struct PolicyBuilder {
    policy: Policy,
}

impl PolicyBuilder {
    pub fn allow_domains(mut self, list: DomainList) -> Self {
        self.policy.allow_domains = list;
        self
    }

    pub fn deny_domains(mut self, list: DomainList) -> Self {
        self.policy.deny_domains = list;
        self
    }

    pub fn allow_forward_src(mut self, set: CidrSet) -> Self {
        self.policy.allow_forward_src = set;
        self
    }

    pub fn deny_forward_src(mut self, set: CidrSet) -> Self {
        self.policy.deny_forward_src = set;
        self
    }

    pub fn local_only(mut self, enabled: bool) -> Self {
        self.policy.local_only = enabled;
        self
    }

    pub fn host_addresses(mut self, addrs: HostAddresses) -> Self {
        self.policy.host_addrs = addrs;
        self
    }

    pub fn block_new_inbound(mut self, enabled: bool) -> Self {
        self.policy.block_new_inbound = enabled;
        self
    }

    pub fn allow_inbound_src(mut self, set: CidrSet) -> Self {
        self.policy.allow_inbound_src = set;
        self
    }

    pub fn no_fw_rules(mut self, enabled: bool) -> Self {
        self.policy.no_fw_rules = enabled;
        self
    }

    pub fn build(self) -> Policy {
        self.policy
    }
}
