//! Startup, steady state and ordered shutdown
//!
//! TUN-less mode runs only the SOCKS5 relay on system routing. TUN mode opens
//! the device, configures the host network, starts the dataplane and the
//! relay (bound to the TUN), then on cancellation stops the relay, stops the
//! dataplane and restores the network, in that order.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use ipnet::Ipv4Net;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{CliArgs, PolicyConfig, TunMode};
use crate::core::stats::spawn_reporter;
use crate::core::{CidrSet, Counters, HostAddresses, Policy, Server};
use crate::dataplane::{open_tun, Dataplane, UdpTransceiver, INBOUND_CHANNEL_SIZE};
use crate::logger::{log, LogLevel};
use crate::netconfig::{platform_configurator, ForwardRules, InterfaceConfig, NetworkConfigurator};
use crate::server_runner::{start_socks, SocksHandle};

/// Everything the configurator is asked to do, resolved from the CLI
#[derive(Debug, Clone)]
pub struct NetworkPlan {
    pub iface: InterfaceConfig,
    pub default_route: bool,
    pub routes: CidrSet,
    pub exclude_routes: CidrSet,
    pub dns: Vec<Ipv4Addr>,
    /// Transport endpoint kept off the TUN when taking the default route
    pub endpoint: Option<Ipv4Addr>,
    /// `None` when host firewall rules are disabled
    pub forward_rules: Option<ForwardRules>,
}

impl NetworkPlan {
    pub fn from_cli(cli: &CliArgs, tun: &str, policy: &PolicyConfig) -> Result<Self> {
        let endpoint = match cli.transport_endpoint()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        };
        let forward_rules = if policy.no_fw_rules {
            None
        } else {
            Some(ForwardRules {
                allow: policy.allow_forward_src.clone(),
                deny: policy.deny_forward_src.clone(),
                local_only: policy.local_only,
            })
        };
        Ok(Self {
            iface: InterfaceConfig {
                name: tun.to_string(),
                address: cli.interface_address()?,
                mtu: cli.mtu,
            },
            default_route: cli.default_route,
            routes: cli.routes()?,
            exclude_routes: cli.exclude_routes()?,
            dns: cli.dns_servers()?,
            endpoint,
            forward_rules,
        })
    }
}

/// Apply `plan` through `configurator`
pub async fn setup_network(
    configurator: &mut dyn NetworkConfigurator,
    plan: &NetworkPlan,
) -> Result<()> {
    configurator.configure_interface(&plan.iface).await?;

    if plan.default_route {
        if let Some(endpoint) = plan.endpoint {
            if let Err(e) = configurator.add_bypass_route(Ipv4Net::from(endpoint)).await {
                log::warn!(endpoint = %endpoint, error = %e, "Failed to keep transport endpoint off the TUN");
            }
        }
        configurator.apply_default_route_split().await?;
    }

    for net in plan.exclude_routes.iter() {
        if let Err(e) = configurator.add_bypass_route(*net).await {
            log::warn!(route = %net, error = %e, "Failed to add exclude route");
        }
    }
    for net in plan.routes.iter() {
        if let Err(e) = configurator.add_tunnel_route(*net).await {
            log::warn!(route = %net, error = %e, "Failed to add route");
        }
    }

    if !plan.dns.is_empty() {
        // Covered by the default route otherwise
        if !plan.default_route {
            for server in &plan.dns {
                if let Err(e) = configurator.add_tunnel_route(Ipv4Net::from(*server)).await {
                    log::warn!(dns = %server, error = %e, "Failed to route DNS server");
                }
            }
        }
        if let Err(e) = configurator.apply_dns(&plan.dns).await {
            log::warn!(error = %e, "Failed to set DNS servers");
        }
    }

    if let Some(rules) = &plan.forward_rules {
        if !rules.is_empty() {
            configurator.apply_forward_rules(rules).await?;
        }
    }
    Ok(())
}

fn build_server(cli: &CliArgs, policy: Arc<Policy>, vpn_interface: Option<String>, level: LogLevel) -> Arc<Server> {
    Arc::new(
        Server::builder()
            .policy(policy)
            .vpn_interface(vpn_interface)
            .dial_timeout(cli.dial_timeout)
            .debug(level.traces_packets())
            .build(),
    )
}

/// Run until `cancel` fires
pub async fn run(cli: CliArgs, level: LogLevel, cancel: CancellationToken) -> Result<()> {
    let policy_config = PolicyConfig::from_cli(&cli)?;
    match cli.tun_mode() {
        TunMode::Disabled => run_socks_only(&cli, policy_config, level, cancel).await,
        TunMode::Enabled(name) => run_tun(&cli, &name, policy_config, level, cancel).await,
    }
}

async fn run_socks_only(
    cli: &CliArgs,
    policy_config: PolicyConfig,
    level: LogLevel,
    cancel: CancellationToken,
) -> Result<()> {
    let listen = cli
        .socks_addr()?
        .ok_or_else(|| anyhow!("--socks is required without a TUN"))?;
    log::info!("No TUN requested; running the SOCKS5 relay on system routing");

    let policy = Arc::new(policy_config.into_policy(HostAddresses::default()));
    let socks = start_socks(listen, build_server(cli, policy, None, level)).await?;

    cancel.cancelled().await;
    socks.stop().await;
    Ok(())
}

async fn run_tun(
    cli: &CliArgs,
    name: &str,
    policy_config: PolicyConfig,
    level: LogLevel,
    cancel: CancellationToken,
) -> Result<()> {
    let plan = NetworkPlan::from_cli(cli, name, &policy_config)?;
    let (source, sink) = open_tun(name, cli.mtu)?;

    let mut configurator = platform_configurator(name, cli.dns_service.clone());
    if let Err(e) = setup_network(configurator.as_mut(), &plan).await {
        let _ = configurator.teardown().await;
        return Err(e);
    }

    let result = run_dataplane(cli, name, &plan, policy_config, level, source, sink, cancel).await;

    if let Err(e) = configurator.teardown().await {
        log::warn!(error = %e, "Network teardown failed");
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_dataplane(
    cli: &CliArgs,
    name: &str,
    plan: &NetworkPlan,
    policy_config: PolicyConfig,
    level: LogLevel,
    source: crate::dataplane::TunSource,
    sink: crate::dataplane::TunSink,
    cancel: CancellationToken,
) -> Result<()> {
    // Snapshot after the TUN address exists; add it explicitly in case the
    // kernel has not published it yet
    let mut host_addrs = HostAddresses::snapshot().unwrap_or_else(|e| {
        log::warn!(error = %e, "Failed to list interface addresses");
        HostAddresses::default()
    });
    host_addrs.insert(plan.iface.address.addr());
    let policy = Arc::new(policy_config.into_policy(host_addrs));

    let transceiver = UdpTransceiver::bind(cli.transport_bind()?, cli.transport_endpoint()?).await?;
    let dataplane_stop = CancellationToken::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
    let receiver = transceiver.spawn_receiver(inbound_tx, dataplane_stop.clone());

    let counters = Arc::new(Counters::new());
    let reporter = if level.shows_info() {
        spawn_reporter(Arc::clone(&counters), cli.stats_interval, dataplane_stop.clone())
    } else {
        None
    };

    let dataplane = Dataplane::new(
        Arc::new(transceiver),
        Arc::clone(&policy),
        counters,
        level.traces_packets(),
    );
    let mut dataplane_task = {
        let stop = dataplane_stop.clone();
        tokio::spawn(async move { dataplane.run(source, sink, inbound_rx, stop).await })
    };

    let socks: Option<SocksHandle> = match cli.socks_addr()? {
        Some(listen) => {
            let server = build_server(cli, Arc::clone(&policy), Some(name.to_string()), level);
            match start_socks(listen, server).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    dataplane_stop.cancel();
                    let _ = dataplane_task.await;
                    return Err(e);
                }
            }
        }
        None => None,
    };

    log::info!(tun = name, socks = socks.is_some(), "Steering active");

    let early_exit = tokio::select! {
        _ = cancel.cancelled() => None,
        res = &mut dataplane_task => Some(res),
    };

    if let Some(socks) = socks {
        socks.stop().await;
    }
    dataplane_stop.cancel();
    let result = match early_exit {
        Some(res) => res,
        None => dataplane_task.await,
    };
    let _ = receiver.await;
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(anyhow!("dataplane task failed: {}", e)),
    }
}
