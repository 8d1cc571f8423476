//! Host network configuration around the TUN device
//!
//! Each platform shells out to its own tools behind [`NetworkConfigurator`].
//! Every applied step records the command that undoes it; [`teardown`]
//! replays those in reverse order. A step whose output says "File exists"
//! is treated as already applied and nothing is recorded for it.
//!
//! [`teardown`]: NetworkConfigurator::teardown

mod linux;
mod macos;

pub use linux::{parse_default_route, DefaultRoute, LinuxConfigurator};
pub use macos::{parse_route_get, MacosConfigurator};

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::core::CidrSet;
use crate::error::{DataplaneError, Result};
use crate::logger::log;

/// Addressing applied to the TUN interface
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub name: String,
    pub address: Ipv4Net,
    pub mtu: u16,
}

impl InterfaceConfig {
    /// Point-to-point peer used by platforms that want one: `.1` of the subnet,
    /// or `.2` when the interface itself owns `.1`
    pub fn peer(&self) -> Ipv4Addr {
        let base = u32::from(self.address.network());
        let first = Ipv4Addr::from(base.wrapping_add(1));
        if first == self.address.addr() {
            Ipv4Addr::from(base.wrapping_add(2))
        } else {
            first
        }
    }
}

/// Source rules enforced in the host firewall
#[derive(Debug, Clone, Default)]
pub struct ForwardRules {
    pub allow: CidrSet,
    pub deny: CidrSet,
    pub local_only: bool,
}

impl ForwardRules {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty() && !self.local_only
    }
}

/// One external command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs external commands.
///
/// `run` returns the combined output on success; a non-zero exit becomes
/// [`DataplaneError::Command`] carrying that output as the reason.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &Command) -> Result<String>;
}

/// [`CommandRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &Command) -> Result<String> {
        let output = tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .output()
            .await
            .map_err(|e| DataplaneError::Command {
                command: cmd.to_string(),
                reason: e.to_string(),
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(text)
        } else {
            Err(DataplaneError::Command {
                command: cmd.to_string(),
                reason: format!("{}: {}", output.status, text.trim()),
            })
        }
    }
}

/// Outcome of one configuration step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Done,
    AlreadyPresent,
}

fn already_present(err: &DataplaneError) -> bool {
    match err {
        DataplaneError::Command { reason, .. } => reason.contains("File exists"),
        _ => false,
    }
}

/// Applies commands and remembers how to undo them
pub struct Journal {
    runner: Arc<dyn CommandRunner>,
    undo: Vec<Command>,
}

impl Journal {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            undo: Vec::new(),
        }
    }

    /// Run a query command; nothing is recorded
    pub async fn query(&self, cmd: &Command) -> Result<String> {
        self.runner.run(cmd).await
    }

    /// Run `cmd`, recording `undo` (in order) when it actually changed something
    pub async fn apply(&mut self, cmd: Command, undo: Vec<Command>) -> Result<Applied> {
        match self.runner.run(&cmd).await {
            Ok(_) => {
                log::debug!(command = %cmd, "Applied");
                self.undo.extend(undo);
                Ok(Applied::Done)
            }
            Err(e) if already_present(&e) => {
                log::debug!(command = %cmd, "Already present");
                Ok(Applied::AlreadyPresent)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`apply`](Self::apply), retrying with `fallback` when `cmd` fails
    pub async fn apply_or(
        &mut self,
        cmd: Command,
        fallback: Command,
        undo: Vec<Command>,
    ) -> Result<Applied> {
        match self.apply(cmd, undo.clone()).await {
            Ok(applied) => Ok(applied),
            Err(e) => {
                log::debug!(error = %e, fallback = %fallback, "Retrying");
                self.apply(fallback, undo).await
            }
        }
    }

    pub fn pending(&self) -> &[Command] {
        &self.undo
    }

    /// Run every recorded undo command, newest first.
    ///
    /// Failures are logged and do not stop the remaining steps.
    pub async fn unwind(&mut self) {
        while let Some(cmd) = self.undo.pop() {
            match self.runner.run(&cmd).await {
                Ok(_) => log::debug!(command = %cmd, "Reverted"),
                Err(e) => log::warn!(command = %cmd, error = %e, "Revert failed"),
            }
        }
    }
}

/// Host network setup around the TUN device.
///
/// All operations are idempotent; repeating one that already took effect is
/// not an error.
#[async_trait]
pub trait NetworkConfigurator: Send {
    /// Assign the address, set the MTU and bring the interface up
    async fn configure_interface(&mut self, iface: &InterfaceConfig) -> Result<()>;

    /// Send all IPv4 traffic through the TUN
    async fn apply_default_route_split(&mut self) -> Result<()>;

    /// Route `net` through the TUN
    async fn add_tunnel_route(&mut self, net: Ipv4Net) -> Result<()>;

    /// Route `net` through the original default gateway
    async fn add_bypass_route(&mut self, net: Ipv4Net) -> Result<()>;

    /// Point the system resolver at `servers`
    async fn apply_dns(&mut self, servers: &[Ipv4Addr]) -> Result<()>;

    /// Install firewall rules for traffic forwarded into the TUN
    async fn apply_forward_rules(&mut self, rules: &ForwardRules) -> Result<()>;

    /// Undo everything recorded so far
    async fn teardown(&mut self) -> Result<()>;
}

/// Configurator that changes nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConfigurator;

#[async_trait]
impl NetworkConfigurator for NoopConfigurator {
    async fn configure_interface(&mut self, iface: &InterfaceConfig) -> Result<()> {
        log::warn!(
            name = %iface.name,
            "No network configurator for this platform; configure the interface manually"
        );
        Ok(())
    }

    async fn apply_default_route_split(&mut self) -> Result<()> {
        Ok(())
    }

    async fn add_tunnel_route(&mut self, _net: Ipv4Net) -> Result<()> {
        Ok(())
    }

    async fn add_bypass_route(&mut self, _net: Ipv4Net) -> Result<()> {
        Ok(())
    }

    async fn apply_dns(&mut self, _servers: &[Ipv4Addr]) -> Result<()> {
        Ok(())
    }

    async fn apply_forward_rules(&mut self, _rules: &ForwardRules) -> Result<()> {
        Ok(())
    }

    async fn teardown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Pick the configurator for the running platform
pub fn platform_configurator(
    tun_name: &str,
    dns_service: Option<String>,
) -> Box<dyn NetworkConfigurator> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    if cfg!(target_os = "linux") {
        Box::new(LinuxConfigurator::new(tun_name, runner))
    } else if cfg!(target_os = "macos") {
        Box::new(MacosConfigurator::new(tun_name, dns_service, runner))
    } else {
        Box::new(NoopConfigurator)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every command and answers from a script of
    /// `(command prefix, response)` pairs; unscripted commands succeed
    /// with empty output
    #[derive(Default)]
    pub struct RecordingRunner {
        pub commands: Mutex<Vec<String>>,
        script: Mutex<Vec<(String, std::result::Result<String, String>)>>,
    }

    impl RecordingRunner {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn respond(&self, prefix: &str, response: std::result::Result<&str, &str>) {
            let response = response.map(str::to_string).map_err(str::to_string);
            self.script
                .lock()
                .unwrap()
                .push((prefix.to_string(), response));
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, cmd: &Command) -> Result<String> {
            let line = cmd.to_string();
            self.commands.lock().unwrap().push(line.clone());
            let script = self.script.lock().unwrap();
            match script.iter().find(|(prefix, _)| line.starts_with(prefix.as_str())) {
                Some((_, Ok(out))) => Ok(out.clone()),
                Some((_, Err(reason))) => Err(DataplaneError::Command {
                    command: line,
                    reason: reason.clone(),
                }),
                None => Ok(String::new()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;

    #[test]
    fn test_command_display() {
        let cmd = Command::new("ip", ["route", "add", "10.0.0.0/8", "dev", "urnet0"]);
        assert_eq!(cmd.to_string(), "ip route add 10.0.0.0/8 dev urnet0");
    }

    #[test]
    fn test_interface_peer() {
        let iface = InterfaceConfig {
            name: "utun7".to_string(),
            address: "10.255.0.2/24".parse().unwrap(),
            mtu: 1420,
        };
        assert_eq!(iface.peer(), Ipv4Addr::new(10, 255, 0, 1));

        let iface = InterfaceConfig {
            address: "10.255.0.1/24".parse().unwrap(),
            ..iface
        };
        assert_eq!(iface.peer(), Ipv4Addr::new(10, 255, 0, 2));
    }

    #[tokio::test]
    async fn test_journal_records_and_unwinds_in_reverse() {
        let runner = RecordingRunner::new();
        let mut journal = Journal::new(runner.clone());
        journal
            .apply(Command::new("a", ["1"]), vec![Command::new("undo", ["a"])])
            .await
            .unwrap();
        journal
            .apply(Command::new("b", ["2"]), vec![Command::new("undo", ["b"])])
            .await
            .unwrap();
        journal.unwind().await;
        assert_eq!(runner.commands(), vec!["a 1", "b 2", "undo b", "undo a"]);
        assert!(journal.pending().is_empty());
    }

    #[tokio::test]
    async fn test_journal_file_exists_is_not_recorded() {
        let runner = RecordingRunner::new();
        runner.respond("ip route add", Err("RTNETLINK answers: File exists"));
        let mut journal = Journal::new(runner.clone());
        let applied = journal
            .apply(
                Command::new("ip", ["route", "add", "10.0.0.0/8"]),
                vec![Command::new("ip", ["route", "del", "10.0.0.0/8"])],
            )
            .await
            .unwrap();
        assert_eq!(applied, Applied::AlreadyPresent);
        assert!(journal.pending().is_empty());
    }

    #[tokio::test]
    async fn test_journal_failure_propagates() {
        let runner = RecordingRunner::new();
        runner.respond("ip", Err("exit status: 2"));
        let mut journal = Journal::new(runner);
        let res = journal.apply(Command::new("ip", ["link"]), vec![]).await;
        assert!(matches!(res, Err(DataplaneError::Command { .. })));
    }

    #[tokio::test]
    async fn test_journal_fallback() {
        let runner = RecordingRunner::new();
        runner.respond("ip route add", Err("exit status: 2"));
        let mut journal = Journal::new(runner.clone());
        journal
            .apply_or(
                Command::new("ip", ["route", "add", "default"]),
                Command::new("ip", ["route", "replace", "default"]),
                vec![Command::new("ip", ["route", "del", "default"])],
            )
            .await
            .unwrap();
        assert_eq!(
            runner.commands(),
            vec!["ip route add default", "ip route replace default"]
        );
        assert_eq!(journal.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_unwind_continues_after_failure() {
        let runner = RecordingRunner::new();
        runner.respond("undo a", Err("boom"));
        let mut journal = Journal::new(runner.clone());
        journal
            .apply(
                Command::new("a", Vec::<String>::new()),
                vec![Command::new("undo", ["z"]), Command::new("undo", ["a"])],
            )
            .await
            .unwrap();
        journal.unwind().await;
        assert_eq!(runner.commands(), vec!["a", "undo a", "undo z"]);
    }

    #[tokio::test]
    async fn test_noop_configurator() {
        let mut cfg = NoopConfigurator;
        cfg.apply_default_route_split().await.unwrap();
        cfg.add_tunnel_route("10.0.0.0/8".parse().unwrap()).await.unwrap();
        cfg.teardown().await.unwrap();
    }
}
