//! A pair of provisioned endpoints and the traffic prepared for them.

use crate::config::ToolsConfig;
use crate::error::ToolError;
use crate::tools::{ToolCommand, ToolRunner};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Provisioned outer interface of one emulated host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub interface: String,
    pub ip: String,
    pub mac: String,
}

/// Interface pair in canonical order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ScenarioKey(String, String);

impl ScenarioKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }
}

/// Rewritten capture and its direction cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficItem {
    pub pcap: PathBuf,
    pub cache: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayScenario {
    first: Endpoint,
    second: Endpoint,
    traffic: Vec<TrafficItem>,
}

impl ReplayScenario {
    pub fn new(first: Endpoint, second: Endpoint) -> Self {
        Self {
            first,
            second,
            traffic: Vec::new(),
        }
    }

    pub fn key(&self) -> ScenarioKey {
        ScenarioKey::new(&self.first.interface, &self.second.interface)
    }

    pub fn first(&self) -> &Endpoint {
        &self.first
    }

    pub fn second(&self) -> &Endpoint {
        &self.second
    }

    pub fn traffic(&self) -> &[TrafficItem] {
        &self.traffic
    }

    /// `<stem>.<intf1>-<intf2>.rewritten.pcap` and `<stem>.<intf1>-<intf2>.cache` next to `capture`
    pub fn output_paths(&self, capture: &Path) -> TrafficItem {
        let stem = capture
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tag = format!("{}-{}", self.first.interface, self.second.interface);
        TrafficItem {
            pcap: capture.with_file_name(format!("{}.{}.rewritten.pcap", stem, tag)),
            cache: capture.with_file_name(format!("{}.{}.cache", stem, tag)),
        }
    }

    pub(crate) fn tcpprep_command(&self, program: &str, capture: &Path, item: &TrafficItem) -> ToolCommand {
        ToolCommand::new(program)
            .arg("--auto=bridge")
            .arg(format!("--pcap={}", capture.display()))
            .arg(format!("--cachefile={}", item.cache.display()))
    }

    pub(crate) fn tcprewrite_command(&self, program: &str, capture: &Path, item: &TrafficItem) -> ToolCommand {
        let (a, b) = (&self.first, &self.second);
        ToolCommand::new(program)
            .arg("--fixcsum")
            .arg(format!("--endpoints={}:{}", a.ip, b.ip))
            .arg(format!("--cachefile={}", item.cache.display()))
            .arg(format!("--enet-dmac={},{}", b.mac, a.mac))
            .arg(format!("--enet-smac={},{}", a.mac, b.mac))
            .arg(format!("--infile={}", capture.display()))
            .arg(format!("--outfile={}", item.pcap.display()))
    }

    /// Build the direction cache, rewrite addressing onto this scenario's
    /// endpoints and queue the result.
    pub fn append_pcap(
        &mut self,
        capture: &Path,
        tools: &dyn ToolRunner,
        programs: &ToolsConfig,
    ) -> Result<&TrafficItem, ToolError> {
        let item = self.output_paths(capture);
        tools.run(&self.tcpprep_command(&programs.tcpprep, capture, &item))?;
        tools.run(&self.tcprewrite_command(&programs.tcprewrite, capture, &item))?;
        tracing::debug!(
            capture = %capture.display(),
            rewritten = %item.pcap.display(),
            "traffic prepared"
        );
        self.traffic.push(item);
        Ok(&self.traffic[self.traffic.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> ReplayScenario {
        ReplayScenario::new(
            Endpoint {
                interface: "h1-out0".into(),
                ip: "10.0.0.1".into(),
                mac: "aa:aa:aa:aa:aa:01".into(),
            },
            Endpoint {
                interface: "h2-out0".into(),
                ip: "10.0.0.2".into(),
                mac: "aa:aa:aa:aa:aa:02".into(),
            },
        )
    }

    #[test]
    fn key_is_unordered() {
        assert_eq!(ScenarioKey::new("b", "a"), ScenarioKey::new("a", "b"));
        assert_eq!(scenario().key(), ScenarioKey::new("h2-out0", "h1-out0"));
    }

    #[test]
    fn outputs_are_tagged_with_the_interface_pair() {
        let item = scenario().output_paths(Path::new("/cap/x_processed/3.pcap"));
        assert_eq!(item.pcap, PathBuf::from("/cap/x_processed/3.h1-out0-h2-out0.rewritten.pcap"));
        assert_eq!(item.cache, PathBuf::from("/cap/x_processed/3.h1-out0-h2-out0.cache"));
    }

    #[test]
    fn rewrite_swaps_macs_per_direction() {
        let s = scenario();
        let capture = Path::new("/c/1.pcap");
        let item = s.output_paths(capture);
        let cmd = s.tcprewrite_command("tcprewrite", capture, &item);
        assert_eq!(
            cmd.args,
            vec![
                "--fixcsum",
                "--endpoints=10.0.0.1:10.0.0.2",
                "--cachefile=/c/1.h1-out0-h2-out0.cache",
                "--enet-dmac=aa:aa:aa:aa:aa:02,aa:aa:aa:aa:aa:01",
                "--enet-smac=aa:aa:aa:aa:aa:01,aa:aa:aa:aa:aa:02",
                "--infile=/c/1.pcap",
                "--outfile=/c/1.h1-out0-h2-out0.rewritten.pcap",
            ]
        );
        let prep = s.tcpprep_command("tcpprep", capture, &item);
        assert_eq!(prep.to_string(), "tcpprep --auto=bridge --pcap=/c/1.pcap --cachefile=/c/1.h1-out0-h2-out0.cache");
    }
}
