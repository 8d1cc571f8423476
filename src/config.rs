//! Configuration module for the steering client
//!
//! This module handles CLI argument parsing with environment variable support
//! and turns the raw flags into the typed values the runner needs.

use anyhow::{anyhow, Result};
use clap::Parser;
use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::ip_filter::local_ranges;
use crate::core::{CidrSet, DomainList, HostAddresses, Policy};
use crate::logger::log;

/// Parse duration string (e.g., "5s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '5s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Split a comma-separated list, trimming entries and dropping empty ones
pub fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn csv(opt: &Option<String>) -> Vec<String> {
    opt.as_deref().map(split_csv).unwrap_or_default()
}

/// TUN name used when the given one is unusable
pub const DEFAULT_TUN_NAME: &str = "urnet0";

/// `--tun` values that mean "no TUN, SOCKS relay only"
const TUN_DISABLED: &[&str] = &["none", "non", "no", "off", "false", "disable", "disabled", "0"];

/// Whether the packet dataplane runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunMode {
    Disabled,
    Enabled(String),
}

impl TunMode {
    /// Interpret a raw `--tun` value
    pub fn resolve(raw: Option<&str>) -> Self {
        let name = match raw.map(str::trim) {
            None | Some("") => return TunMode::Disabled,
            Some(name) => name,
        };
        if TUN_DISABLED.contains(&name.to_lowercase().as_str()) {
            return TunMode::Disabled;
        }
        if name.starts_with('-') {
            log::warn!(
                value = name,
                fallback = DEFAULT_TUN_NAME,
                "--tun value looks like a flag; using the default name"
            );
            return TunMode::Enabled(DEFAULT_TUN_NAME.to_string());
        }
        TunMode::Enabled(name.to_string())
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            TunMode::Disabled => None,
            TunMode::Enabled(name) => Some(name.as_str()),
        }
    }
}

/// CLI arguments for the steering client
///
/// Supports environment variables with VPN_STEER_ prefix
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "VPN client traffic steering: SOCKS5 relay and TUN packet dataplane"
)]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// TUN interface name; omit or use "none" for SOCKS-only mode
    #[arg(long, env = "VPN_STEER_TUN")]
    pub tun: Option<String>,

    /// TUN address in CIDR form
    #[arg(long = "ip_cidr", env = "VPN_STEER_IP_CIDR", default_value = "10.255.0.2/24")]
    pub ip_cidr: String,

    /// TUN MTU
    #[arg(long, env = "VPN_STEER_MTU", default_value_t = 1420)]
    pub mtu: u16,

    /// Route all IPv4 traffic through the TUN
    #[arg(long = "default_route", env = "VPN_STEER_DEFAULT_ROUTE")]
    pub default_route: bool,

    /// Extra CIDRs routed through the TUN (comma-separated)
    #[arg(long, env = "VPN_STEER_ROUTE")]
    pub route: Option<String>,

    /// CIDRs kept on the original gateway (comma-separated)
    #[arg(long = "exclude_route", env = "VPN_STEER_EXCLUDE_ROUTE")]
    pub exclude_route: Option<String>,

    /// DNS servers reached through the TUN (comma-separated)
    #[arg(long, env = "VPN_STEER_DNS")]
    pub dns: Option<String>,

    /// macOS network service whose DNS servers are replaced (e.g. "Wi-Fi")
    #[arg(long = "dns_service", env = "VPN_STEER_DNS_SERVICE")]
    pub dns_service: Option<String>,

    // ==================== SOCKS5 ====================
    /// SOCKS5 listen address (e.g. 127.0.0.1:1080)
    #[arg(long, visible_alias = "socks_listen", env = "VPN_STEER_SOCKS", help_heading = "SOCKS5")]
    pub socks: Option<String>,

    /// Domains relayed through the VPN; everything else uses system routing
    #[arg(long, env = "VPN_STEER_DOMAIN", help_heading = "SOCKS5")]
    pub domain: Option<String>,

    /// Domains always relayed through system routing
    #[arg(long = "exclude_domain", env = "VPN_STEER_EXCLUDE_DOMAIN", help_heading = "SOCKS5")]
    pub exclude_domain: Option<String>,

    /// Outbound dial timeout (e.g., "30s")
    #[arg(long = "dial_timeout", env = "VPN_STEER_DIAL_TIMEOUT", default_value = "30s", value_parser = parse_duration, help_heading = "SOCKS5")]
    pub dial_timeout: Duration,

    // ==================== Filtering ====================
    /// Only forward packets originating from this host
    #[arg(long = "local_only", env = "VPN_STEER_LOCAL_ONLY", help_heading = "Filtering")]
    pub local_only: bool,

    /// Source CIDRs allowed to forward through the VPN (comma-separated)
    #[arg(long = "allow_forward_src", env = "VPN_STEER_ALLOW_FORWARD_SRC", help_heading = "Filtering")]
    pub allow_forward_src: Option<String>,

    /// Source CIDRs never forwarded through the VPN (comma-separated)
    #[arg(long = "deny_forward_src", env = "VPN_STEER_DENY_FORWARD_SRC", help_heading = "Filtering")]
    pub deny_forward_src: Option<String>,

    /// Sources allowed to open new inbound TCP connections (comma-separated)
    #[arg(long = "allow_inbound_src", env = "VPN_STEER_ALLOW_INBOUND_SRC", help_heading = "Filtering")]
    pub allow_inbound_src: Option<String>,

    /// Allow new inbound TCP connections from local ranges and the TUN subnet
    #[arg(long = "allow_inbound_local", env = "VPN_STEER_ALLOW_INBOUND_LOCAL", help_heading = "Filtering")]
    pub allow_inbound_local: bool,

    /// Leave the host firewall alone; filter in userspace only
    #[arg(long = "no_fw_rules", env = "VPN_STEER_NO_FW_RULES", help_heading = "Filtering")]
    pub no_fw_rules: bool,

    // ==================== Transport ====================
    /// Relay endpoint receiving the tunnelled packets (host:port)
    #[arg(long = "transport_endpoint", env = "VPN_STEER_TRANSPORT_ENDPOINT", help_heading = "Transport")]
    pub transport_endpoint: Option<String>,

    /// Local bind address of the datagram transport
    #[arg(long = "transport_bind", env = "VPN_STEER_TRANSPORT_BIND", default_value = "0.0.0.0:0", help_heading = "Transport")]
    pub transport_bind: String,

    // ==================== Logging ====================
    /// Interval between traffic stats lines (e.g., "5s"; 0 disables)
    #[arg(long = "stats_interval", env = "VPN_STEER_STATS_INTERVAL", default_value = "5s", value_parser = parse_duration, help_heading = "Logging")]
    pub stats_interval: Duration,

    /// Log level: quiet, error, warn, info, debug, trace
    #[arg(long = "log_level", env = "VPN_STEER_LOG_LEVEL", help_heading = "Logging")]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stdout
    #[arg(long = "log_file", env = "VPN_STEER_LOG_FILE", help_heading = "Logging")]
    pub log_file: Option<PathBuf>,

    /// Debug logging (ignored when --log_level is given)
    #[arg(long, env = "VPN_STEER_DEBUG", help_heading = "Logging")]
    pub debug: bool,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn tun_mode(&self) -> TunMode {
        TunMode::resolve(self.tun.as_deref())
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        self.socks_addr()?;
        if self.dial_timeout.is_zero() {
            return Err(anyhow!("dial_timeout must be greater than 0"));
        }

        for (flag, value) in [
            ("allow_forward_src", &self.allow_forward_src),
            ("deny_forward_src", &self.deny_forward_src),
            ("allow_inbound_src", &self.allow_inbound_src),
            ("route", &self.route),
            ("exclude_route", &self.exclude_route),
        ] {
            CidrSet::parse(csv(value)).map_err(|e| anyhow!("--{}: {}", flag, e))?;
        }
        self.dns_servers()?;

        match self.tun_mode() {
            TunMode::Disabled => {
                if self.socks.is_none() {
                    return Err(anyhow!(
                        "nothing to run: pass --tun for the packet dataplane or --socks for the relay"
                    ));
                }
            }
            TunMode::Enabled(_) => {
                self.interface_address()?;
                self.transport_endpoint()?;
                self.transport_bind()?;
                if self.mtu < 576 {
                    return Err(anyhow!("mtu must be at least 576, got {}", self.mtu));
                }
            }
        }
        Ok(())
    }

    pub fn socks_addr(&self) -> Result<Option<SocketAddr>> {
        match self.socks.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => s
                .parse()
                .map(Some)
                .map_err(|_| anyhow!("invalid --socks address '{}', expected host:port", s)),
        }
    }

    /// TUN address and prefix
    pub fn interface_address(&self) -> Result<Ipv4Net> {
        self.ip_cidr
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid --ip_cidr '{}', expected an IPv4 CIDR", self.ip_cidr))
    }

    pub fn transport_endpoint(&self) -> Result<SocketAddr> {
        let raw = self
            .transport_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("--transport_endpoint is required when a TUN is used"))?;
        raw.parse()
            .map_err(|_| anyhow!("invalid --transport_endpoint '{}', expected ip:port", raw))
    }

    pub fn transport_bind(&self) -> Result<SocketAddr> {
        self.transport_bind
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid --transport_bind '{}'", self.transport_bind))
    }

    pub fn routes(&self) -> Result<CidrSet> {
        Ok(CidrSet::parse(csv(&self.route))?)
    }

    pub fn exclude_routes(&self) -> Result<CidrSet> {
        Ok(CidrSet::parse(csv(&self.exclude_route))?)
    }

    pub fn dns_servers(&self) -> Result<Vec<Ipv4Addr>> {
        csv(&self.dns)
            .iter()
            .map(|s| {
                s.parse::<Ipv4Addr>()
                    .map_err(|_| anyhow!("invalid --dns server '{}', expected IPv4", s))
            })
            .collect()
    }
}

/// Policy inputs taken from the command line; host addresses are added
/// later, once the TUN is configured
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    pub allow_domains: DomainList,
    pub deny_domains: DomainList,
    pub allow_forward_src: CidrSet,
    pub deny_forward_src: CidrSet,
    pub local_only: bool,
    pub block_new_inbound: bool,
    pub allow_inbound_src: CidrSet,
    pub no_fw_rules: bool,
}

impl PolicyConfig {
    pub fn from_cli(cli: &CliArgs) -> Result<Self> {
        let mut allow_inbound_src = CidrSet::parse(csv(&cli.allow_inbound_src))?;
        if cli.allow_inbound_local {
            allow_inbound_src.extend(&local_ranges());
            if let TunMode::Enabled(_) = cli.tun_mode() {
                allow_inbound_src.push(cli.interface_address()?.trunc());
            }
        }
        let block_new_inbound = cli.allow_inbound_local || !csv(&cli.allow_inbound_src).is_empty();

        Ok(Self {
            allow_domains: DomainList::new(csv(&cli.domain)),
            deny_domains: DomainList::new(csv(&cli.exclude_domain)),
            allow_forward_src: CidrSet::parse(csv(&cli.allow_forward_src))?,
            deny_forward_src: CidrSet::parse(csv(&cli.deny_forward_src))?,
            local_only: cli.local_only,
            block_new_inbound,
            allow_inbound_src,
            no_fw_rules: cli.no_fw_rules,
        })
    }

    /// Freeze into the immutable [`Policy`]
    pub fn into_policy(self, host_addrs: HostAddresses) -> Policy {
        Policy::builder()
            .allow_domains(self.allow_domains)
            .deny_domains(self.deny_domains)
            .allow_forward_src(self.allow_forward_src)
            .deny_forward_src(self.deny_forward_src)
            .local_only(self.local_only)
            .host_addresses(host_addrs)
            .block_new_inbound(self.block_new_inbound)
            .allow_inbound_src(self.allow_inbound_src)
            .no_fw_rules(self.no_fw_rules)
            .build()
    }
}
