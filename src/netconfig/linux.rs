//! Linux: `ip` for addressing and routes, `iptables` for forward rules

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use super::{Command, CommandRunner, ForwardRules, InterfaceConfig, Journal, NetworkConfigurator};
use crate::error::{DataplaneError, Result};
use crate::logger::log;

/// Metric of the default route pointing at the TUN
const TUN_DEFAULT_METRIC: u32 = 50;
/// Metric the original default route is pushed back to
const BUMPED_DEFAULT_METRIC: u32 = 200;

/// The system default route as reported by `ip -o route show default`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Option<Ipv4Addr>,
    pub dev: String,
    pub metric: Option<u32>,
}

impl DefaultRoute {
    /// `[via GW] dev DEV` arguments
    fn target_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(4);
        if let Some(gw) = self.gateway {
            args.push("via".to_string());
            args.push(gw.to_string());
        }
        args.push("dev".to_string());
        args.push(self.dev.clone());
        args
    }
}

/// Parse the first default route in `ip -o route show default` output,
/// skipping routes on `skip_dev`
pub fn parse_default_route(output: &str, skip_dev: &str) -> Option<DefaultRoute> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&"default") {
            return None;
        }
        let value_after = |key: &str| {
            fields
                .iter()
                .position(|f| *f == key)
                .and_then(|i| fields.get(i + 1))
                .copied()
        };
        let dev = value_after("dev")?;
        if dev == skip_dev {
            return None;
        }
        Some(DefaultRoute {
            gateway: value_after("via").and_then(|gw| gw.parse().ok()),
            dev: dev.to_string(),
            metric: value_after("metric").and_then(|m| m.parse().ok()),
        })
    })
}

pub struct LinuxConfigurator {
    tun: String,
    journal: Journal,
    original: Option<DefaultRoute>,
}

impl LinuxConfigurator {
    pub fn new(tun: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            tun: tun.to_string(),
            journal: Journal::new(runner),
            original: None,
        }
    }

    /// Discover the default route once and remember it
    async fn original_route(&mut self) -> Result<DefaultRoute> {
        if let Some(route) = &self.original {
            return Ok(route.clone());
        }
        let output = self
            .journal
            .query(&Command::new("ip", ["-o", "route", "show", "default"]))
            .await?;
        let route = parse_default_route(&output, &self.tun).ok_or_else(|| {
            DataplaneError::Other("no usable default route found".to_string())
        })?;
        log::info!(
            gateway = ?route.gateway,
            dev = %route.dev,
            metric = ?route.metric,
            "Original default route"
        );
        self.original = Some(route.clone());
        Ok(route)
    }

    fn iptables(action: &str, tun: &str, source: Option<&Ipv4Net>, target: &str) -> Command {
        let mut args = vec![action.to_string(), "FORWARD".to_string()];
        args.extend(["-o".to_string(), tun.to_string()]);
        if let Some(net) = source {
            args.extend(["-s".to_string(), net.to_string()]);
        }
        args.extend(["-j".to_string(), target.to_string()]);
        Command::new("iptables", args)
    }

    async fn add_rule(&mut self, insert: bool, source: Option<&Ipv4Net>, target: &str) -> Result<()> {
        let action = if insert { "-I" } else { "-A" };
        let cmd = Self::iptables(action, &self.tun, source, target);
        let undo = Self::iptables("-D", &self.tun, source, target);
        self.journal.apply(cmd, vec![undo]).await?;
        Ok(())
    }
}

#[async_trait]
impl NetworkConfigurator for LinuxConfigurator {
    async fn configure_interface(&mut self, iface: &InterfaceConfig) -> Result<()> {
        let name = iface.name.as_str();
        self.journal
            .apply(
                Command::new("ip", ["addr", "add", iface.address.to_string().as_str(), "dev", name]),
                vec![Command::new("ip", ["addr", "flush", "dev", name])],
            )
            .await?;
        self.journal
            .apply(
                Command::new("ip", ["link", "set", "dev", name, "mtu", iface.mtu.to_string().as_str()]),
                vec![],
            )
            .await?;
        self.journal
            .apply(
                Command::new("ip", ["link", "set", name, "up"]),
                vec![Command::new("ip", ["link", "set", name, "down"])],
            )
            .await?;
        log::info!(name = name, address = %iface.address, mtu = iface.mtu, "Interface configured");
        Ok(())
    }

    async fn apply_default_route_split(&mut self) -> Result<()> {
        let original = self.original_route().await?;
        let tun = self.tun.clone();
        let metric = TUN_DEFAULT_METRIC.to_string();

        self.journal
            .apply_or(
                Command::new("ip", ["route", "add", "default", "dev", tun.as_str(), "metric", metric.as_str()]),
                Command::new("ip", ["route", "replace", "default", "dev", tun.as_str(), "metric", metric.as_str()]),
                vec![Command::new("ip", ["route", "del", "default", "dev", tun.as_str()])],
            )
            .await?;

        // Push the original route behind ours; on teardown drop the bumped
        // copy first, then put the original metric back
        let bumped = BUMPED_DEFAULT_METRIC.to_string();
        let with_metric = |verb: &str, metric: &str| {
            let mut args = vec!["route".to_string(), verb.to_string(), "default".to_string()];
            args.extend(original.target_args());
            args.extend(["metric".to_string(), metric.to_string()]);
            Command::new("ip", args)
        };
        let mut restore = vec!["route".to_string(), "replace".to_string(), "default".to_string()];
        restore.extend(original.target_args());
        if let Some(m) = original.metric {
            restore.extend(["metric".to_string(), m.to_string()]);
        }
        let undo = vec![Command::new("ip", restore), with_metric("del", &bumped)];

        if let Err(e) = self
            .journal
            .apply_or(with_metric("change", &bumped), with_metric("replace", &bumped), undo)
            .await
        {
            log::warn!(error = %e, "Failed to lower the original default route");
        }
        log::info!(tun = %tun, metric = TUN_DEFAULT_METRIC, "Default route via TUN");
        Ok(())
    }

    async fn add_tunnel_route(&mut self, net: Ipv4Net) -> Result<()> {
        let dest = net.to_string();
        let tun = self.tun.clone();
        self.journal
            .apply(
                Command::new("ip", ["route", "add", dest.as_str(), "dev", tun.as_str()]),
                vec![Command::new("ip", ["route", "del", dest.as_str(), "dev", tun.as_str()])],
            )
            .await?;
        Ok(())
    }

    async fn add_bypass_route(&mut self, net: Ipv4Net) -> Result<()> {
        let original = self.original_route().await?;
        let dest = net.to_string();
        let mut args = vec!["route".to_string(), "add".to_string(), dest.clone()];
        args.extend(original.target_args());
        self.journal
            .apply(
                Command::new("ip", args),
                vec![Command::new("ip", ["route", "del", dest.as_str()])],
            )
            .await?;
        Ok(())
    }

    async fn apply_dns(&mut self, servers: &[Ipv4Addr]) -> Result<()> {
        if !servers.is_empty() {
            log::info!(
                count = servers.len(),
                "Resolver configuration left to the system; DNS servers are routed through the TUN"
            );
        }
        Ok(())
    }

    async fn apply_forward_rules(&mut self, rules: &ForwardRules) -> Result<()> {
        if rules.local_only {
            self.add_rule(true, None, "DROP").await?;
            log::info!(tun = %self.tun, "Forwarding into TUN disabled");
            return Ok(());
        }
        if !rules.allow.is_empty() {
            for net in rules.allow.iter() {
                self.add_rule(true, Some(net), "ACCEPT").await?;
            }
            self.add_rule(false, None, "DROP").await?;
        }
        // Inserted last so they sit above every ACCEPT
        for net in rules.deny.iter() {
            self.add_rule(true, Some(net), "DROP").await?;
        }
        log::info!(
            allow = rules.allow.len(),
            deny = rules.deny.len(),
            "Forward rules installed"
        );
        Ok(())
    }

    async fn teardown(&mut self) -> Result<()> {
        self.journal.unwind().await;
        log::info!(tun = %self.tun, "Network configuration restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::RecordingRunner;
    use super::*;
    use crate::core::CidrSet;

    const ROUTES: &str = "default via 172.17.0.254 dev eth0 proto dhcp src 172.17.0.11 metric 100\n";

    #[test]
    fn test_parse_default_route() {
        let route = parse_default_route(ROUTES, "urnet0").unwrap();
        assert_eq!(
            route,
            DefaultRoute {
                gateway: Some(Ipv4Addr::new(172, 17, 0, 254)),
                dev: "eth0".to_string(),
                metric: Some(100),
            }
        );
    }

    #[test]
    fn test_parse_default_route_without_gateway_or_metric() {
        let route = parse_default_route("default dev wg0 scope link\n", "urnet0").unwrap();
        assert_eq!(route.gateway, None);
        assert_eq!(route.dev, "wg0");
        assert_eq!(route.metric, None);
    }

    #[test]
    fn test_parse_default_route_skips_tun_and_devless() {
        let out = "default dev urnet0 metric 50\ndefault via 10.0.0.1\ndefault via 10.0.0.1 dev enp3s0\n";
        let route = parse_default_route(out, "urnet0").unwrap();
        assert_eq!(route.dev, "enp3s0");
        assert!(parse_default_route("", "urnet0").is_none());
    }

    fn configurator() -> (Arc<RecordingRunner>, LinuxConfigurator) {
        let runner = RecordingRunner::new();
        runner.respond("ip -o route show default", Ok(ROUTES));
        let cfg = LinuxConfigurator::new("urnet0", runner.clone());
        (runner, cfg)
    }

    #[tokio::test]
    async fn test_interface_setup_and_teardown() {
        let (runner, mut cfg) = configurator();
        let iface = InterfaceConfig {
            name: "urnet0".to_string(),
            address: "10.255.0.2/24".parse().unwrap(),
            mtu: 1420,
        };
        cfg.configure_interface(&iface).await.unwrap();
        cfg.teardown().await.unwrap();
        assert_eq!(
            runner.commands(),
            vec![
                "ip addr add 10.255.0.2/24 dev urnet0",
                "ip link set dev urnet0 mtu 1420",
                "ip link set urnet0 up",
                "ip link set urnet0 down",
                "ip addr flush dev urnet0",
            ]
        );
    }

    #[tokio::test]
    async fn test_default_route_takeover_and_restore() {
        let (runner, mut cfg) = configurator();
        cfg.apply_default_route_split().await.unwrap();
        cfg.teardown().await.unwrap();
        assert_eq!(
            runner.commands(),
            vec![
                "ip -o route show default",
                "ip route add default dev urnet0 metric 50",
                "ip route change default via 172.17.0.254 dev eth0 metric 200",
                "ip route del default via 172.17.0.254 dev eth0 metric 200",
                "ip route replace default via 172.17.0.254 dev eth0 metric 100",
                "ip route del default dev urnet0",
            ]
        );
    }

    #[tokio::test]
    async fn test_existing_route_is_not_torn_down() {
        let (runner, mut cfg) = configurator();
        runner.respond("ip route add 10.8.0.0/16", Err("RTNETLINK answers: File exists"));
        cfg.add_tunnel_route("10.8.0.0/16".parse().unwrap()).await.unwrap();
        cfg.add_tunnel_route("1.1.1.1/32".parse().unwrap()).await.unwrap();
        cfg.teardown().await.unwrap();
        let cmds = runner.commands();
        assert!(cmds.contains(&"ip route del 1.1.1.1/32 dev urnet0".to_string()));
        assert!(!cmds.contains(&"ip route del 10.8.0.0/16 dev urnet0".to_string()));
    }

    #[tokio::test]
    async fn test_bypass_route_uses_original_gateway() {
        let (runner, mut cfg) = configurator();
        cfg.add_bypass_route("203.0.113.7/32".parse().unwrap()).await.unwrap();
        cfg.add_bypass_route("198.51.100.0/24".parse().unwrap()).await.unwrap();
        let cmds = runner.commands();
        // Discovery runs once
        assert_eq!(
            cmds.iter().filter(|c| c.starts_with("ip -o route")).count(),
            1
        );
        assert!(cmds.contains(&"ip route add 203.0.113.7/32 via 172.17.0.254 dev eth0".to_string()));
    }

    #[tokio::test]
    async fn test_bypass_without_default_route_fails() {
        let runner = RecordingRunner::new();
        let mut cfg = LinuxConfigurator::new("urnet0", runner);
        assert!(cfg.add_bypass_route("203.0.113.7/32".parse().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_forward_rules_order() {
        let (runner, mut cfg) = configurator();
        let rules = ForwardRules {
            allow: CidrSet::parse(["192.168.2.0/24"]).unwrap(),
            deny: CidrSet::parse(["192.168.2.9"]).unwrap(),
            local_only: false,
        };
        cfg.apply_forward_rules(&rules).await.unwrap();
        cfg.teardown().await.unwrap();
        assert_eq!(
            runner.commands(),
            vec![
                "iptables -I FORWARD -o urnet0 -s 192.168.2.0/24 -j ACCEPT",
                "iptables -A FORWARD -o urnet0 -j DROP",
                "iptables -I FORWARD -o urnet0 -s 192.168.2.9/32 -j DROP",
                "iptables -D FORWARD -o urnet0 -s 192.168.2.9/32 -j DROP",
                "iptables -D FORWARD -o urnet0 -j DROP",
                "iptables -D FORWARD -o urnet0 -s 192.168.2.0/24 -j ACCEPT",
            ]
        );
    }

    #[tokio::test]
    async fn test_local_only_blocks_all_forwarding() {
        let (runner, mut cfg) = configurator();
        let rules = ForwardRules {
            local_only: true,
            ..Default::default()
        };
        cfg.apply_forward_rules(&rules).await.unwrap();
        assert_eq!(runner.commands(), vec!["iptables -I FORWARD -o urnet0 -j DROP"]);
    }
}
