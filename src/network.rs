//! The emulated network as seen by the replay engine: named hosts with an
//! address, a MAC and a namespace to run commands in.

use crate::config::{NetworkConfig, ToolsConfig};
use crate::tools::{ToolCommand, ToolRunner};
use std::collections::BTreeMap;
use std::sync::Arc;

pub trait Node: Send + Sync {
    fn name(&self) -> &str;
    fn ip(&self) -> &str;
    fn mac(&self) -> &str;
    /// PID of a process inside the node's network namespace
    fn pid(&self) -> u32;
    /// Run a command inside the node. Output only; exit status is not checked.
    fn cmd(&self, command: &ToolCommand) -> String;
}

pub trait Network: Send + Sync {
    fn node(&self, name: &str) -> Option<Arc<dyn Node>>;
    fn hosts(&self) -> Vec<String>;
}

/// Host whose commands run through `nsenter -t <pid> -n`.
pub struct NamespaceNode {
    name: String,
    ip: String,
    mac: String,
    pid: u32,
    nsenter: String,
    sudo: Option<String>,
    tools: Arc<dyn ToolRunner>,
}

impl NamespaceNode {
    pub(crate) fn enter(&self, command: &ToolCommand) -> ToolCommand {
        let cmd = ToolCommand::new(self.nsenter.as_str())
            .arg("-t")
            .arg(self.pid.to_string())
            .arg("-n")
            .arg(command.program.as_str())
            .args(command.args.iter().cloned());
        match &self.sudo {
            Some(sudo) => cmd.elevated(sudo),
            None => cmd,
        }
    }
}

impl Node for NamespaceNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ip(&self) -> &str {
        &self.ip
    }

    fn mac(&self) -> &str {
        &self.mac
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn cmd(&self, command: &ToolCommand) -> String {
        let full = self.enter(command);
        match self.tools.output(&full) {
            Ok(out) => {
                if !out.success {
                    tracing::debug!(node = %self.name, command = %command, stderr = %out.stderr.trim(), "node command failed");
                }
                out.stdout
            }
            Err(e) => {
                tracing::warn!(node = %self.name, command = %command, error = %e, "node command not run");
                String::new()
            }
        }
    }
}

/// Hosts listed in configuration, addressed through their namespaces.
pub struct NamespaceNetwork {
    nodes: BTreeMap<String, Arc<NamespaceNode>>,
}

impl NamespaceNetwork {
    pub fn from_config(
        network: &NetworkConfig,
        programs: &ToolsConfig,
        use_sudo: bool,
        tools: Arc<dyn ToolRunner>,
    ) -> Self {
        let nodes = network
            .hosts
            .iter()
            .map(|h| {
                let node = NamespaceNode {
                    name: h.name.clone(),
                    ip: h.ip.clone(),
                    mac: h.mac.clone(),
                    pid: h.pid,
                    nsenter: programs.nsenter.clone(),
                    sudo: use_sudo.then(|| programs.sudo.clone()),
                    tools: Arc::clone(&tools),
                };
                (h.name.clone(), Arc::new(node))
            })
            .collect();
        Self { nodes }
    }
}

impl Network for NamespaceNetwork {
    fn node(&self, name: &str) -> Option<Arc<dyn Node>> {
        self.nodes
            .get(name)
            .map(|n| Arc::clone(n) as Arc<dyn Node>)
    }

    fn hosts(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::tools::SystemTools;

    fn network(use_sudo: bool) -> NamespaceNetwork {
        let config = NetworkConfig {
            hosts: vec![
                HostConfig {
                    name: "h2".into(),
                    ip: "10.0.0.2".into(),
                    mac: "00:00:00:00:00:02".into(),
                    pid: 4242,
                },
                HostConfig {
                    name: "h1".into(),
                    ip: "10.0.0.1".into(),
                    mac: "00:00:00:00:00:01".into(),
                    pid: 4241,
                },
            ],
        };
        NamespaceNetwork::from_config(&config, &ToolsConfig::default(), use_sudo, Arc::new(SystemTools))
    }

    #[test]
    fn hosts_are_listed_by_name() {
        let net = network(false);
        assert_eq!(net.hosts(), vec!["h1", "h2"]);
        let h1 = net.node("h1").unwrap();
        assert_eq!(h1.ip(), "10.0.0.1");
        assert_eq!(h1.pid(), 4241);
        assert!(net.node("h9").is_none());
    }

    #[test]
    fn commands_enter_the_namespace() {
        let net = network(true);
        let node = &net.nodes["h2"];
        let cmd = node.enter(&ToolCommand::new("tc").args(["qdisc", "add"]));
        assert_eq!(cmd.to_string(), "sudo nsenter -t 4242 -n tc qdisc add");
    }
}
