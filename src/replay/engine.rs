//! Interface provisioning, scenario registry and replay worker supervision.

use super::replayer::{ReplayerReport, ScenarioReplayer};
use super::scenario::{Endpoint, ReplayScenario, ScenarioKey};
use crate::clustering::ClusteringResult;
use crate::config::{ReplayConfig, ToolsConfig};
use crate::error::{ConfigurationError, TestbedError, ToolError};
use crate::network::{Network, Node};
use crate::tools::{ToolCommand, ToolRunner};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Protocol number dropped on the inner interface (see `tc filter ... protocol 0x8942`)
const DROPPED_PROTOCOL: &str = "0x8942";

/// veth pair created for one emulated host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedInterface {
    /// Stays in the root namespace; replay traffic enters here
    pub outer: String,
    /// Moved into the host's namespace
    pub inner: String,
    /// Third octet of the pair's subnet
    pub slot: usize,
    pub mac: String,
}

struct Worker {
    scenario: usize,
    stop: watch::Sender<bool>,
    handle: JoinHandle<ReplayerReport>,
}

/// Outcome of [`ReplayEngine::clean`].
#[derive(Debug)]
pub struct CleanReport {
    pub replayers: Vec<ReplayerReport>,
    /// Outer interfaces whose removal failed
    pub failures: Vec<(String, ToolError)>,
}

pub struct ReplayEngine {
    network: Arc<dyn Network>,
    tools: Arc<dyn ToolRunner>,
    programs: ToolsConfig,
    config: ReplayConfig,
    scenarios: Vec<ReplayScenario>,
    index: HashMap<ScenarioKey, usize>,
    /// host IP → provisioned pair
    interfaces: HashMap<String, ProvisionedInterface>,
    /// Outer ends of pairs whose rollback failed
    orphans: Vec<String>,
    workers: Vec<Worker>,
}

impl ReplayEngine {
    pub fn new(
        network: Arc<dyn Network>,
        tools: Arc<dyn ToolRunner>,
        programs: ToolsConfig,
        config: ReplayConfig,
    ) -> Self {
        Self {
            network,
            tools,
            programs,
            config,
            scenarios: Vec::new(),
            index: HashMap::new(),
            interfaces: HashMap::new(),
            orphans: Vec::new(),
            workers: Vec::new(),
        }
    }

    pub fn scenarios(&self) -> &[ReplayScenario] {
        &self.scenarios
    }

    /// 1-based index of the scenario serving the interface pair, either order.
    pub fn scenario_index(&self, intf1: &str, intf2: &str) -> Option<usize> {
        self.index.get(&ScenarioKey::new(intf1, intf2)).map(|i| i + 1)
    }

    pub fn provisioned(&self, ip: &str) -> Option<&ProvisionedInterface> {
        self.interfaces.get(ip)
    }

    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Whether scenario `number` (1-based) has a worker that has not exited.
    pub fn is_running(&self, number: usize) -> bool {
        self.workers
            .iter()
            .any(|w| w.scenario == number && !w.handle.is_finished())
    }

    fn host_command(&self, program: &str) -> HostCommand {
        HostCommand {
            cmd: ToolCommand::new(program),
            sudo: self.config.use_sudo.then(|| self.programs.sudo.clone()),
        }
    }

    fn run_on_host(&self, command: HostCommand) -> Result<(), ToolError> {
        self.tools.run(&command.build())?;
        Ok(())
    }

    fn interface_exists(&self, name: &str) -> Result<bool, ToolError> {
        let show = ToolCommand::new(self.programs.ip.as_str()).args(["link", "show", name]);
        Ok(self.tools.output(&show)?.success)
    }

    /// Provision a veth pair for `host_name` unless its IP already has one.
    pub fn prepare_host(&mut self, host_name: &str) -> Result<Endpoint, TestbedError> {
        let node = self
            .network
            .node(host_name)
            .ok_or_else(|| ConfigurationError::UnknownHost(host_name.to_string()))?;
        let ip = node.ip().to_string();

        if let Some(p) = self.interfaces.get(&ip) {
            return Ok(Endpoint {
                interface: p.outer.clone(),
                ip,
                mac: p.mac.clone(),
            });
        }

        let name = node.name().to_string();
        let inner = format!("{}-veth0", name);
        let outer = format!("{}-out0", name);
        for candidate in [&inner, &outer] {
            if self.interface_exists(candidate)? {
                return Err(TestbedError::ResourceConflict {
                    interface: candidate.clone(),
                });
            }
        }

        let slot = self.interfaces.len();
        let ip_prog = self.programs.ip.clone();
        tracing::info!(host = %name, inner = %inner, outer = %outer, slot, "creating veth pair");

        self.run_on_host(
            self.host_command(&ip_prog)
                .args(["link", "add", inner.as_str(), "type", "veth", "peer", "name", outer.as_str()]),
        )?;
        if let Err(e) = self.configure_pair(node.as_ref(), &inner, &outer, slot) {
            self.discard_pair(&outer);
            return Err(e.into());
        }

        let mac = node.mac().to_string();
        self.interfaces.insert(
            ip.clone(),
            ProvisionedInterface {
                outer: outer.clone(),
                inner,
                slot,
                mac: mac.clone(),
            },
        );
        Ok(Endpoint {
            interface: outer,
            ip,
            mac,
        })
    }

    /// Address both ends, move the inner end into the node and set up mirroring.
    fn configure_pair(&self, node: &dyn Node, inner: &str, outer: &str, slot: usize) -> Result<(), ToolError> {
        let ip_prog = self.programs.ip.as_str();
        let prefix = &self.config.subnet_prefix;
        let outer_addr = format!("{}.{}.2/24", prefix, slot);
        let inner_addr = format!("{}.{}.1/24", prefix, slot);
        let pid = node.pid().to_string();
        let mtu = self.config.outer_mtu.to_string();

        self.run_on_host(self.host_command(ip_prog).args(["addr", "add", outer_addr.as_str(), "dev", outer]))?;
        self.run_on_host(self.host_command(ip_prog).args(["link", "set", outer, "up"]))?;
        self.run_on_host(self.host_command(ip_prog).args(["link", "set", inner, "netns", pid.as_str()]))?;

        let inside = ToolCommand::new(ip_prog);
        node.cmd(&inside.clone().args(["addr", "add", inner_addr.as_str(), "dev", inner]));
        node.cmd(&inside.args(["link", "set", inner, "up"]));
        self.mirror(node, inner);

        self.run_on_host(self.host_command(ip_prog).args(["link", "set", outer, "mtu", mtu.as_str(), "up"]))
    }

    /// Remove a pair whose setup failed. If that fails too, `clean` retries it.
    fn discard_pair(&mut self, outer: &str) {
        if let Err(e) = self.delete_pair(outer) {
            tracing::warn!(interface = %outer, error = %e, "cannot roll back veth pair");
            self.orphans.push(outer.to_string());
        }
    }

    /// Deleting one end removes the pair.
    fn delete_pair(&self, outer: &str) -> Result<(), ToolError> {
        self.run_on_host(
            self.host_command(&self.programs.ip)
                .args(["link", "del", outer, "type", "veth"]),
        )
    }

    /// Mirror traffic between the inner veth end and the host's primary interface.
    fn mirror(&self, node: &dyn Node, inner: &str) {
        let primary = format!("{}-eth0", node.name());
        let primary = primary.as_str();
        let tc = || ToolCommand::new(self.programs.tc.as_str());
        let mirror_to = |from: &str, to: &str| {
            tc().args([
                "filter", "add", "dev", from, "parent", "ffff:", "protocol", "all", "u32", "match",
                "u8", "0", "0", "action", "mirred", "egress", "mirror", "dev", to,
            ])
        };

        node.cmd(&tc().args(["qdisc", "add", "dev", inner, "ingress"]));
        node.cmd(&mirror_to(inner, primary));
        node.cmd(&tc().args([
            "filter", "add", "dev", inner, "parent", "ffff:", "protocol", DROPPED_PROTOCOL, "u32",
            "match", "u8", "0", "0", "action", "drop",
        ]));
        node.cmd(&tc().args(["qdisc", "add", "dev", primary, "ingress"]));
        node.cmd(&mirror_to(primary, inner));
        node.cmd(&ToolCommand::new(self.programs.iptables.as_str()).args([
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-o",
            primary,
            "-j",
            "MASQUERADE",
        ]));
    }

    /// Queue `capture` on the scenario between the two hosts, creating it if needed.
    /// Returns the scenario's 1-based index.
    pub fn prepare(&mut self, capture: &Path, host1: &str, host2: &str) -> Result<usize, TestbedError> {
        let a = self.prepare_host(host1)?;
        let b = self.prepare_host(host2)?;
        let key = ScenarioKey::new(&a.interface, &b.interface);

        if let Some(&i) = self.index.get(&key) {
            self.scenarios[i].append_pcap(capture, self.tools.as_ref(), &self.programs)?;
            return Ok(i + 1);
        }

        let mut scenario = ReplayScenario::new(a, b);
        scenario.append_pcap(capture, self.tools.as_ref(), &self.programs)?;
        self.scenarios.push(scenario);
        let i = self.scenarios.len() - 1;
        self.index.insert(key, i);
        tracing::info!(scenario = i + 1, host1, host2, "scenario registered");
        Ok(i + 1)
    }

    /// Prepare every result that carries a host pair.
    pub fn apply_results(&mut self, results: &[ClusteringResult]) -> Result<usize, TestbedError> {
        let mut prepared = 0;
        for r in results {
            if let Some(pair) = &r.host_pair {
                self.prepare(&r.path, &pair.0, &pair.1)?;
                prepared += 1;
            }
        }
        Ok(prepared)
    }

    /// Spawn one worker per selected scenario (1-based; empty = all) and start them together.
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, selected: &[usize]) -> Result<usize, TestbedError> {
        let available = self.scenarios.len();
        let chosen: Vec<usize> = if selected.is_empty() {
            (1..=available).collect()
        } else {
            if let Some(&bad) = selected.iter().find(|&&i| i == 0 || i > available) {
                return Err(ConfigurationError::UnknownScenario {
                    index: bad,
                    available,
                }
                .into());
            }
            let mut chosen = Vec::with_capacity(selected.len());
            for &i in selected {
                if !chosen.contains(&i) {
                    chosen.push(i);
                }
            }
            chosen
        };
        if let Some(&busy) = chosen.iter().find(|&&n| self.is_running(n)) {
            return Err(ConfigurationError::ScenarioRunning(busy).into());
        }

        let (start_tx, start_rx) = watch::channel(false);
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        for &number in &chosen {
            let scenario = &self.scenarios[number - 1];
            let replayer = ScenarioReplayer::new(
                number,
                scenario.first().interface.clone(),
                scenario.second().interface.clone(),
                scenario.traffic().to_vec().into(),
                Arc::clone(&self.tools),
                self.programs.tcpreplay.clone(),
                self.config.use_sudo.then(|| self.programs.sudo.clone()),
                poll,
            );
            let (stop_tx, stop_rx) = watch::channel(false);
            let handle = tokio::spawn(replayer.run(start_rx.clone(), stop_rx));
            self.workers.push(Worker {
                scenario: number,
                stop: stop_tx,
                handle,
            });
        }
        // all workers registered; release them together
        let _ = start_tx.send(true);
        tracing::info!(workers = chosen.len(), "replay started");
        Ok(chosen.len())
    }

    /// Stop every worker and wait for each to exit. The registry is empty afterwards.
    pub async fn stop(&mut self) -> Vec<ReplayerReport> {
        for w in &self.workers {
            let _ = w.stop.send(true);
        }
        let mut reports = Vec::with_capacity(self.workers.len());
        for w in self.workers.drain(..) {
            let _ = w.stop.send(true);
            match w.handle.await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(scenario = w.scenario, error = %e, "replayer task failed"),
            }
        }
        reports
    }

    /// Stop replay and delete every provisioned veth pair, plus any left over
    /// from a failed setup.
    pub async fn clean(&mut self) -> CleanReport {
        let replayers = self.stop().await;
        let mut pairs: Vec<ProvisionedInterface> = self.interfaces.drain().map(|(_, p)| p).collect();
        pairs.sort_by_key(|p| p.slot);
        let outers: Vec<String> = pairs
            .into_iter()
            .map(|p| p.outer)
            .chain(self.orphans.drain(..))
            .collect();

        let mut failures = Vec::new();
        tracing::info!(pairs = outers.len(), "removing veth pairs");
        for outer in outers {
            if let Err(e) = self.delete_pair(&outer) {
                tracing::warn!(interface = %outer, error = %e, "cannot remove veth pair");
                failures.push((outer, e));
            }
        }
        CleanReport {
            replayers,
            failures,
        }
    }
}

/// Root-namespace command, elevated when configured.
struct HostCommand {
    cmd: ToolCommand,
    sudo: Option<String>,
}

impl HostCommand {
    fn args<'a>(mut self, args: impl IntoIterator<Item = &'a str>) -> Self {
        self.cmd = self.cmd.args(args);
        self
    }

    fn build(self) -> ToolCommand {
        match self.sudo {
            Some(sudo) => self.cmd.elevated(&sudo),
            None => self.cmd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolOutput;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
        /// commands containing any of these exit non-zero
        failing: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn fail_on(&self, needles: &[&'static str]) {
            *self.failing.lock().unwrap() = needles.to_vec();
        }
    }

    impl ToolRunner for Recorder {
        fn output(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError> {
            let line = cmd.to_string();
            let success = !line.contains("link show")
                && !self.failing.lock().unwrap().iter().any(|f| line.contains(f));
            self.commands.lock().unwrap().push(line);
            Ok(ToolOutput {
                success,
                ..Default::default()
            })
        }

        fn spawn(&self, _cmd: &ToolCommand) -> std::io::Result<tokio::process::Child> {
            Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "no replay in unit tests"))
        }
    }

    struct Host {
        name: String,
        ip: String,
        commands: Mutex<Vec<String>>,
    }

    impl Node for Host {
        fn name(&self) -> &str {
            &self.name
        }
        fn ip(&self) -> &str {
            &self.ip
        }
        fn mac(&self) -> &str {
            "02:00:00:00:00:01"
        }
        fn pid(&self) -> u32 {
            77
        }
        fn cmd(&self, command: &ToolCommand) -> String {
            self.commands.lock().unwrap().push(command.to_string());
            String::new()
        }
    }

    struct Net(Vec<Arc<Host>>);

    impl Network for Net {
        fn node(&self, name: &str) -> Option<Arc<dyn Node>> {
            self.0
                .iter()
                .find(|h| h.name == name)
                .map(|h| Arc::clone(h) as Arc<dyn Node>)
        }
        fn hosts(&self) -> Vec<String> {
            self.0.iter().map(|h| h.name.clone()).collect()
        }
    }

    fn engine(use_sudo: bool) -> (ReplayEngine, Arc<Recorder>, Arc<Host>) {
        let host = Arc::new(Host {
            name: "h1".into(),
            ip: "10.0.0.1".into(),
            commands: Mutex::new(Vec::new()),
        });
        let tools = Arc::new(Recorder::default());
        let config = ReplayConfig {
            use_sudo,
            ..ReplayConfig::default()
        };
        let engine = ReplayEngine::new(
            Arc::new(Net(vec![Arc::clone(&host)])),
            tools.clone(),
            ToolsConfig::default(),
            config,
        );
        (engine, tools, host)
    }

    #[test]
    fn provisioning_command_sequence() {
        let (mut engine, tools, host) = engine(false);
        let ep = engine.prepare_host("h1").unwrap();
        assert_eq!(ep.interface, "h1-out0");
        assert_eq!(ep.ip, "10.0.0.1");

        let host_cmds = tools.commands.lock().unwrap().clone();
        assert_eq!(
            host_cmds,
            vec![
                "ip link show h1-veth0",
                "ip link show h1-out0",
                "ip link add h1-veth0 type veth peer name h1-out0",
                "ip addr add 4.4.0.2/24 dev h1-out0",
                "ip link set h1-out0 up",
                "ip link set h1-veth0 netns 77",
                "ip link set h1-out0 mtu 65535 up",
            ]
        );
        let node_cmds = host.commands.lock().unwrap().clone();
        assert_eq!(node_cmds[0], "ip addr add 4.4.0.1/24 dev h1-veth0");
        assert!(node_cmds.contains(&"tc qdisc add dev h1-eth0 ingress".to_string()));
        assert!(node_cmds
            .iter()
            .any(|c| c.contains("protocol 0x8942") && c.ends_with("action drop")));
        assert!(node_cmds
            .iter()
            .any(|c| c.starts_with("tc filter add dev h1-eth0") && c.ends_with("mirror dev h1-veth0")));
        assert_eq!(
            node_cmds.last().unwrap(),
            "iptables -t nat -A POSTROUTING -o h1-eth0 -j MASQUERADE"
        );
    }

    #[test]
    fn sudo_wraps_host_commands_only() {
        let (mut engine, tools, host) = engine(true);
        engine.prepare_host("h1").unwrap();
        let host_cmds = tools.commands.lock().unwrap().clone();
        assert!(host_cmds[0].starts_with("ip link show"));
        assert!(host_cmds[2].starts_with("sudo ip link add"));
        assert!(host.commands.lock().unwrap().iter().all(|c| !c.starts_with("sudo")));
    }

    #[test]
    fn unknown_host_is_rejected() {
        let (mut engine, tools, _) = engine(false);
        let err = engine.prepare_host("h9").unwrap_err();
        assert!(matches!(
            err,
            TestbedError::Configuration(ConfigurationError::UnknownHost(ref h)) if h == "h9"
        ));
        assert!(tools.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_selection_creates_no_workers() {
        let (mut engine, _, _) = engine(false);
        let err = engine.start(&[1]).unwrap_err();
        assert!(matches!(
            err,
            TestbedError::Configuration(ConfigurationError::UnknownScenario { index: 1, available: 0 })
        ));
        assert_eq!(engine.active_workers(), 0);
        assert_eq!(engine.start(&[]).unwrap(), 0);
    }

    #[test]
    fn failed_setup_rolls_back_the_pair() {
        let (mut engine, tools, _) = engine(false);
        tools.fail_on(&["addr add"]);
        let err = engine.prepare_host("h1").unwrap_err();
        assert!(matches!(err, TestbedError::Tool(ToolError::Failed { .. })));
        assert!(engine.provisioned("10.0.0.1").is_none());
        assert_eq!(
            tools.commands.lock().unwrap().last().unwrap(),
            "ip link del h1-out0 type veth"
        );

        // nothing left over, and the host can be provisioned again
        tools.fail_on(&[]);
        tools.commands.lock().unwrap().clear();
        engine.prepare_host("h1").unwrap();
        assert!(engine.provisioned("10.0.0.1").is_some());
    }

    #[tokio::test]
    async fn clean_retries_pairs_whose_rollback_failed() {
        let (mut engine, tools, _) = engine(false);
        tools.fail_on(&["netns", "link del"]);
        assert!(engine.prepare_host("h1").is_err());
        assert!(engine.provisioned("10.0.0.1").is_none());

        tools.fail_on(&[]);
        tools.commands.lock().unwrap().clear();
        let report = engine.clean().await;
        assert!(report.failures.is_empty());
        assert_eq!(
            tools.commands.lock().unwrap().clone(),
            vec!["ip link del h1-out0 type veth"]
        );

        // second clean has nothing to remove
        tools.commands.lock().unwrap().clear();
        engine.clean().await;
        assert!(tools.commands.lock().unwrap().is_empty());
    }
}
