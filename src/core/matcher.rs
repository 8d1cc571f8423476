//! Domain suffix and CIDR predicates used by routing decisions.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;

use crate::error::{DataplaneError, Result};

/// Lowercase, trim, and strip one trailing dot
fn normalize(name: &str) -> String {
    let name = name.trim();
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}

/// Check whether `host` equals `pattern` or ends with `"." + pattern`.
///
/// Both sides are compared case-insensitively and without a trailing dot.
pub fn domain_matches(host: &str, pattern: &str) -> bool {
    let host = normalize(host);
    let pattern = normalize(pattern);
    suffix_match(&host, &pattern)
}

fn suffix_match(host: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if host == pattern {
        return true;
    }
    host.len() > pattern.len()
        && host.ends_with(pattern)
        && host.as_bytes()[host.len() - pattern.len() - 1] == b'.'
}

/// A list of domain suffixes, normalized once at construction
#[derive(Debug, Clone, Default)]
pub struct DomainList {
    suffixes: Vec<String>,
}

impl DomainList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let suffixes = patterns
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        Self { suffixes }
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    /// True if `host` matches any suffix in the list
    pub fn matches(&self, host: &str) -> bool {
        let host = normalize(host);
        self.suffixes.iter().any(|p| suffix_match(&host, p))
    }
}

/// Parse an IPv4 CIDR or a bare IPv4 host (treated as /32).
///
/// IPv6 input is rejected: the dataplane filters only enforce IPv4.
pub fn parse_cidr_host(s: &str) -> Result<Ipv4Net> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DataplaneError::Config("empty CIDR".to_string()));
    }
    if s.contains('/') {
        let net: Ipv4Net = s.parse()?;
        return Ok(net);
    }
    match s.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Ok(Ipv4Net::from(ip)),
        Ok(IpAddr::V6(_)) => Err(DataplaneError::Config(format!(
            "IPv6 host not supported in CIDR list: {}",
            s
        ))),
        Err(_) => Err(DataplaneError::Config(format!("invalid host or CIDR: {}", s))),
    }
}

/// An unordered set of IPv4 networks
#[derive(Debug, Clone, Default)]
pub struct CidrSet {
    nets: Vec<Ipv4Net>,
}

impl CidrSet {
    pub fn new(nets: Vec<Ipv4Net>) -> Self {
        Self { nets }
    }

    /// Parse every entry with [`parse_cidr_host`]
    pub fn parse<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let nets = entries
            .into_iter()
            .map(|e| parse_cidr_host(e.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { nets })
    }

    pub fn push(&mut self, net: Ipv4Net) {
        self.nets.push(net);
    }

    pub fn extend(&mut self, other: &CidrSet) {
        self.nets.extend(other.nets.iter().copied());
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.nets.iter().any(|n| n.contains(&ip))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ipv4Net> {
        self.nets.iter()
    }
}
