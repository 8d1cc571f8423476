//! macOS: `ifconfig`, `route` and `networksetup`

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use super::{Command, CommandRunner, ForwardRules, InterfaceConfig, Journal, NetworkConfigurator};
use crate::error::{DataplaneError, Result};
use crate::logger::log;

/// Halves of the IPv4 space; together more specific than any default route
const SPLIT_ROUTES: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];

/// Gateway and interface from `route -n get default`
pub fn parse_route_get(output: &str) -> Option<(Ipv4Addr, Option<String>)> {
    let mut gateway = None;
    let mut iface = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("gateway:") {
            gateway = v.trim().parse::<Ipv4Addr>().ok();
        } else if let Some(v) = line.strip_prefix("interface:") {
            iface = Some(v.trim().to_string());
        }
    }
    gateway.map(|gw| (gw, iface))
}

/// `-host ADDR` for a /32, `-net CIDR` otherwise
fn dest_args(net: &Ipv4Net) -> [String; 2] {
    if net.prefix_len() == 32 {
        ["-host".to_string(), net.addr().to_string()]
    } else {
        ["-net".to_string(), net.to_string()]
    }
}

fn route(verb: &str, net: &Ipv4Net, target: &[&str]) -> Command {
    let mut args = vec!["-n".to_string(), verb.to_string()];
    args.extend(dest_args(net));
    args.extend(target.iter().map(|s| s.to_string()));
    Command::new("route", args)
}

pub struct MacosConfigurator {
    tun: String,
    dns_service: Option<String>,
    journal: Journal,
    gateway: Option<Ipv4Addr>,
}

impl MacosConfigurator {
    pub fn new(tun: &str, dns_service: Option<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            tun: tun.to_string(),
            dns_service,
            journal: Journal::new(runner),
            gateway: None,
        }
    }

    async fn default_gateway(&mut self) -> Result<Ipv4Addr> {
        if let Some(gw) = self.gateway {
            return Ok(gw);
        }
        let output = self
            .journal
            .query(&Command::new("route", ["-n", "get", "default"]))
            .await?;
        let (gw, iface) = parse_route_get(&output)
            .ok_or_else(|| DataplaneError::Other("no default gateway found".to_string()))?;
        log::info!(gateway = %gw, interface = ?iface, "Original default gateway");
        self.gateway = Some(gw);
        Ok(gw)
    }

    async fn route_via_tun(&mut self, net: Ipv4Net) -> Result<()> {
        let tun = self.tun.clone();
        self.journal
            .apply_or(
                route("add", &net, &["-interface", tun.as_str()]),
                route("change", &net, &["-interface", tun.as_str()]),
                vec![route("delete", &net, &[])],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NetworkConfigurator for MacosConfigurator {
    async fn configure_interface(&mut self, iface: &InterfaceConfig) -> Result<()> {
        let args = vec![
            iface.name.clone(),
            "inet".to_string(),
            iface.address.addr().to_string(),
            iface.peer().to_string(),
            "mtu".to_string(),
            iface.mtu.to_string(),
            "up".to_string(),
        ];
        self.journal
            .apply(
                Command::new("ifconfig", args),
                vec![Command::new("ifconfig", [iface.name.as_str(), "down"])],
            )
            .await?;
        log::info!(
            name = %iface.name,
            address = %iface.address.addr(),
            peer = %iface.peer(),
            mtu = iface.mtu,
            "Interface configured"
        );
        Ok(())
    }

    async fn apply_default_route_split(&mut self) -> Result<()> {
        // Learn the gateway while it is still the default
        if let Err(e) = self.default_gateway().await {
            log::warn!(error = %e, "Bypass routes will be unavailable");
        }
        for split in SPLIT_ROUTES {
            let net: Ipv4Net = split.parse()?;
            self.route_via_tun(net).await?;
        }
        log::info!(tun = %self.tun, "Default route split via TUN");
        Ok(())
    }

    async fn add_tunnel_route(&mut self, net: Ipv4Net) -> Result<()> {
        self.route_via_tun(net).await
    }

    async fn add_bypass_route(&mut self, net: Ipv4Net) -> Result<()> {
        let gw = self.default_gateway().await?.to_string();
        self.journal
            .apply(
                route("add", &net, &[gw.as_str()]),
                vec![route("delete", &net, &[])],
            )
            .await?;
        Ok(())
    }

    async fn apply_dns(&mut self, servers: &[Ipv4Addr]) -> Result<()> {
        if servers.is_empty() {
            return Ok(());
        }
        let service = match &self.dns_service {
            Some(s) => s.clone(),
            None => {
                log::warn!("No network service given; system DNS left unchanged");
                return Ok(());
            }
        };
        let mut args = vec!["-setdnsservers".to_string(), service.clone()];
        args.extend(servers.iter().map(|s| s.to_string()));
        self.journal
            .apply(
                Command::new("networksetup", args),
                vec![Command::new(
                    "networksetup",
                    ["-setdnsservers", service.as_str(), "Empty"],
                )],
            )
            .await?;
        log::info!(service = %service, count = servers.len(), "DNS servers set");
        Ok(())
    }

    async fn apply_forward_rules(&mut self, rules: &ForwardRules) -> Result<()> {
        if !rules.is_empty() {
            log::info!("Host firewall rules are not managed on macOS; userspace filtering only");
        }
        Ok(())
    }

    async fn teardown(&mut self) -> Result<()> {
        self.journal.unwind().await;
        log::info!(tun = %self.tun, "Network configuration restored");
        Ok(())
    }
}
