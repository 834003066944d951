//! Splitting a capture into per-flow or per-host-pair sub-captures.

use crate::capture::{CaptureReader, PcapWriter, Transport};
use crate::error::{CaptureError, TestbedError};
use crate::tools::{SystemTools, ToolCommand, ToolRunner};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitBackend {
    /// `PcapSplitter` subprocess
    External,
    /// In-process grouping
    Native,
}

#[derive(Clone)]
pub struct Splitter {
    backend: SplitBackend,
    program: String,
    tools: Arc<dyn ToolRunner>,
}

impl std::fmt::Debug for Splitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Splitter")
            .field("backend", &self.backend)
            .field("program", &self.program)
            .finish()
    }
}

impl Default for Splitter {
    fn default() -> Self {
        Self::native()
    }
}

impl Splitter {
    pub fn native() -> Self {
        Self {
            backend: SplitBackend::Native,
            program: String::new(),
            tools: Arc::new(SystemTools),
        }
    }

    pub fn external(program: impl Into<String>, tools: Arc<dyn ToolRunner>) -> Self {
        Self {
            backend: SplitBackend::External,
            program: program.into(),
            tools,
        }
    }

    pub fn backend(&self) -> SplitBackend {
        self.backend
    }

    /// Fill `dir` (already created) with sub-captures of `capture`.
    pub fn split(
        &self,
        capture: &Path,
        dir: &Path,
        by_flow: bool,
        file_limit: usize,
    ) -> Result<(), TestbedError> {
        match self.backend {
            SplitBackend::External => {
                let cmd = splitter_command(&self.program, capture, dir, by_flow, file_limit);
                self.tools.run(&cmd)?;
                Ok(())
            }
            SplitBackend::Native => {
                let written = split_native(capture, dir, by_flow, file_limit)?;
                tracing::debug!(capture = %capture.display(), files = written.len(), "native split");
                Ok(())
            }
        }
    }
}

/// `PcapSplitter -f <capture> -o <dir> -m <method> [-p <limit>]`
pub(crate) fn splitter_command(
    program: &str,
    capture: &Path,
    dir: &Path,
    by_flow: bool,
    file_limit: usize,
) -> ToolCommand {
    let method = if by_flow { "connection" } else { "ip-src-dst" };
    let mut cmd = ToolCommand::new(program)
        .arg("-f")
        .arg(capture.to_string_lossy())
        .arg("-o")
        .arg(dir.to_string_lossy())
        .arg("-m")
        .arg(method);
    if file_limit != 0 {
        cmd = cmd.arg("-p").arg(file_limit.to_string());
    }
    cmd
}

/// Direction-independent grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Flow((IpAddr, u16), (IpAddr, u16)),
    Hosts(IpAddr, IpAddr),
}

impl GroupKey {
    fn flow(a: (IpAddr, u16), b: (IpAddr, u16)) -> Self {
        if a <= b {
            GroupKey::Flow(a, b)
        } else {
            GroupKey::Flow(b, a)
        }
    }

    fn hosts(a: IpAddr, b: IpAddr) -> Self {
        if a <= b {
            GroupKey::Hosts(a, b)
        } else {
            GroupKey::Hosts(b, a)
        }
    }
}

/// Group packets of `capture` into `dir`. Returns the files written.
pub(crate) fn split_native(
    capture: &Path,
    dir: &Path,
    by_flow: bool,
    file_limit: usize,
) -> Result<Vec<PathBuf>, CaptureError> {
    let mut reader = CaptureReader::open(capture)?;
    let mut groups: HashMap<GroupKey, String> = HashMap::new();
    let mut writers: HashMap<String, PcapWriter> = HashMap::new();
    let mut splits = 0usize;

    while let Some(packet) = reader.next_packet()? {
        let summary = packet.decode();
        let key = match (summary.endpoints, summary.transport.ports()) {
            (Some((src, dst)), Some((sport, dport))) if by_flow => {
                Some(GroupKey::flow((src, sport), (dst, dport)))
            }
            (Some((src, dst)), _) if !by_flow => Some(GroupKey::hosts(src, dst)),
            _ => None,
        };
        // ICMP and other non-port traffic has no flow
        let key = key.filter(|_| !by_flow || !matches!(summary.transport, Transport::Icmp));

        let name = match key {
            Some(key) => groups
                .entry(key)
                .or_insert_with(|| {
                    splits += 1;
                    let number = if file_limit != 0 { splits % file_limit } else { splits };
                    format!("{}.pcap", number)
                })
                .clone(),
            None => "other.pcap".to_string(),
        };

        let writer = match writers.entry(name) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let path = dir.join(e.key());
                e.insert(PcapWriter::create(&path, packet.linktype)?)
            }
        };
        writer.write_packet(&packet)?;
    }

    let mut written = Vec::with_capacity(writers.len());
    for (_, writer) in writers {
        written.push(writer.path().to_path_buf());
        writer.finish()?;
    }
    written.sort();
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_command_shape() {
        let cmd = splitter_command(
            "tools/PcapSplitter",
            Path::new("/cap/a.pcap"),
            Path::new("/cap/a_processed"),
            true,
            4,
        );
        assert_eq!(
            cmd.to_string(),
            "tools/PcapSplitter -f /cap/a.pcap -o /cap/a_processed -m connection -p 4"
        );
        let cmd = splitter_command("s", Path::new("a"), Path::new("b"), false, 0);
        assert_eq!(cmd.args, vec!["-f", "a", "-o", "b", "-m", "ip-src-dst"]);
    }

    #[test]
    fn group_keys_ignore_direction() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(GroupKey::hosts(a, b), GroupKey::hosts(b, a));
        assert_eq!(GroupKey::flow((a, 80), (b, 5000)), GroupKey::flow((b, 5000), (a, 80)));
        assert_ne!(GroupKey::flow((a, 80), (b, 5000)), GroupKey::flow((a, 80), (b, 5001)));
    }
}
