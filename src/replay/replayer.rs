//! Per-scenario worker: loops the scenario's traffic through the replayer
//! until told to stop.

use super::scenario::TrafficItem;
use crate::tools::{ToolCommand, ToolRunner};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayerState {
    Idle,
    Running,
    Stopped,
}

/// What a worker did before it exited.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayerReport {
    /// 1-based scenario index
    pub scenario: usize,
    /// Completed passes over the traffic list
    pub passes: u64,
    pub items_started: u64,
    pub state: ReplayerState,
}

pub struct ScenarioReplayer {
    scenario: usize,
    intf1: String,
    intf2: String,
    traffic: Arc<[TrafficItem]>,
    tools: Arc<dyn ToolRunner>,
    program: String,
    sudo: Option<String>,
    poll: Duration,
    state: ReplayerState,
    passes: u64,
    items_started: u64,
}

impl ScenarioReplayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scenario: usize,
        intf1: String,
        intf2: String,
        traffic: Arc<[TrafficItem]>,
        tools: Arc<dyn ToolRunner>,
        program: String,
        sudo: Option<String>,
        poll: Duration,
    ) -> Self {
        Self {
            scenario,
            intf1,
            intf2,
            traffic,
            tools,
            program,
            sudo,
            poll,
            state: ReplayerState::Idle,
            passes: 0,
            items_started: 0,
        }
    }

    /// `tcpreplay --quiet --intf1=<i1> --intf2=<i2> --cachefile=<cache> <pcap>`
    pub fn command(&self, item: &TrafficItem) -> ToolCommand {
        let cmd = ToolCommand::new(self.program.as_str())
            .arg("--quiet")
            .arg(format!("--intf1={}", self.intf1))
            .arg(format!("--intf2={}", self.intf2))
            .arg(format!("--cachefile={}", item.cache.display()))
            .arg(item.pcap.display().to_string());
        match &self.sudo {
            Some(sudo) => cmd.elevated(sudo),
            None => cmd,
        }
    }

    fn report(&self) -> ReplayerReport {
        ReplayerReport {
            scenario: self.scenario,
            passes: self.passes,
            items_started: self.items_started,
            state: self.state,
        }
    }

    /// Wait for `start`, then replay until `stop` flips (or its sender is gone).
    pub async fn run(
        mut self,
        mut start: watch::Receiver<bool>,
        mut stop: watch::Receiver<bool>,
    ) -> ReplayerReport {
        loop {
            if *start.borrow_and_update() {
                break;
            }
            if stop_requested(&stop) {
                self.state = ReplayerState::Stopped;
                return self.report();
            }
            tokio::select! {
                changed = start.changed() => {
                    if changed.is_err() && !*start.borrow() {
                        self.state = ReplayerState::Stopped;
                        return self.report();
                    }
                }
                _ = stop.changed() => {}
            }
        }

        self.state = ReplayerState::Running;
        tracing::info!(scenario = self.scenario, items = self.traffic.len(), "replayer running");

        'passes: while !stop_requested(&stop) {
            if self.traffic.is_empty() {
                pause(self.poll, &mut stop).await;
                continue;
            }
            let traffic = Arc::clone(&self.traffic);
            for item in traffic.iter() {
                if stop_requested(&stop) {
                    break 'passes;
                }
                if !self.replay_item(item, &mut stop).await {
                    break 'passes;
                }
            }
            self.passes += 1;
        }

        self.state = ReplayerState::Stopped;
        tracing::info!(scenario = self.scenario, passes = self.passes, "replayer stopped");
        self.report()
    }

    /// Replay one item. Returns false when a stop request cut it short.
    async fn replay_item(&mut self, item: &TrafficItem, stop: &mut watch::Receiver<bool>) -> bool {
        let cmd = self.command(item);
        let mut child = match self.tools.spawn(&cmd) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(scenario = self.scenario, command = %cmd, error = %e, "cannot launch replayer");
                pause(self.poll, stop).await;
                return true;
            }
        };
        self.items_started += 1;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if !status.success() {
                        tracing::warn!(
                            scenario = self.scenario,
                            pcap = %item.pcap.display(),
                            %status,
                            "replayer exited unsuccessfully"
                        );
                    }
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(scenario = self.scenario, error = %e, "cannot poll replayer");
                    return true;
                }
            }

            pause(self.poll, stop).await;
            if stop_requested(stop) {
                terminate(&mut child);
                match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::debug!(scenario = self.scenario, %status, "replayer terminated");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(scenario = self.scenario, error = %e, "cannot reap replayer");
                    }
                    Err(_) => {
                        tracing::warn!(scenario = self.scenario, "replayer still running after SIGTERM");
                    }
                }
                return false;
            }
        }
    }
}

/// How long a stopped worker waits for its terminated replayer to exit
const TERM_GRACE: Duration = Duration::from_secs(2);

fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

/// Sleep one poll interval, waking early on a stop signal.
async fn pause(poll: Duration, stop: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(poll) => {}
        _ = stop.changed() => {}
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            if libc::kill(pid as libc::pid_t, libc::SIGTERM) != 0 {
                tracing::debug!(pid, "SIGTERM not delivered (process may have exited)");
            }
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::SystemTools;
    use std::path::PathBuf;

    fn replayer(traffic: Vec<TrafficItem>, sudo: Option<&str>) -> ScenarioReplayer {
        ScenarioReplayer::new(
            1,
            "h1-out0".into(),
            "h2-out0".into(),
            traffic.into(),
            Arc::new(SystemTools),
            "tcpreplay".into(),
            sudo.map(String::from),
            Duration::from_millis(10),
        )
    }

    fn item() -> TrafficItem {
        TrafficItem {
            pcap: PathBuf::from("/c/1.rewritten.pcap"),
            cache: PathBuf::from("/c/1.cache"),
        }
    }

    #[test]
    fn replay_command_shape() {
        let cmd = replayer(vec![], Some("sudo")).command(&item());
        assert_eq!(
            cmd.to_string(),
            "sudo tcpreplay --quiet --intf1=h1-out0 --intf2=h2-out0 --cachefile=/c/1.cache /c/1.rewritten.pcap"
        );
    }

    #[tokio::test]
    async fn stop_before_start_never_runs() {
        let (_start_tx, start_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);
        let r = replayer(vec![item()], None);
        let handle = tokio::spawn(r.run(start_rx, stop_rx));
        stop_tx.send(true).unwrap();
        let report = handle.await.unwrap();
        assert_eq!(report.state, ReplayerState::Stopped);
        assert_eq!(report.items_started, 0);
    }

    #[tokio::test]
    async fn launch_failures_keep_looping_until_stopped() {
        let (start_tx, start_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut r = replayer(vec![item()], None);
        r.program = "/nonexistent/tcpreplay".into();
        let handle = tokio::spawn(r.run(start_rx, stop_rx));
        start_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        let report = handle.await.unwrap();
        assert_eq!(report.state, ReplayerState::Stopped);
        assert_eq!(report.items_started, 0);
        assert!(report.passes >= 1);
    }

    fn item_named(n: u32) -> TrafficItem {
        TrafficItem {
            pcap: PathBuf::from(format!("/c/{}.rewritten.pcap", n)),
            cache: PathBuf::from(format!("/c/{}.cache", n)),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn finished_items_loop_in_order() {
        let (start_tx, start_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);
        // `true` ignores the replay arguments and exits at once
        let mut r = replayer(vec![item_named(1), item_named(2)], None);
        r.program = "true".into();
        let handle = tokio::spawn(r.run(start_rx, stop_rx));
        start_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        stop_tx.send(true).unwrap();
        let report = handle.await.unwrap();
        assert_eq!(report.state, ReplayerState::Stopped);
        assert!(report.passes >= 2, "passes: {}", report.passes);
        assert!(report.items_started >= 2 * report.passes);
        assert!(report.items_started <= 2 * report.passes + 2);
    }

    /// Spawns a long sleep for every item and remembers its pid.
    #[derive(Default)]
    struct Sleeper {
        pids: std::sync::Mutex<Vec<u32>>,
    }

    impl ToolRunner for Sleeper {
        fn output(&self, _cmd: &ToolCommand) -> Result<crate::tools::ToolOutput, crate::error::ToolError> {
            Ok(Default::default())
        }

        fn spawn(&self, _cmd: &ToolCommand) -> std::io::Result<Child> {
            let child = tokio::process::Command::new("sleep").arg("30").spawn()?;
            if let Some(pid) = child.id() {
                self.pids.lock().unwrap().push(pid);
            }
            Ok(child)
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn stop_terminates_and_reaps_the_running_item() {
        let (start_tx, start_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);
        let tools = Arc::new(Sleeper::default());
        let mut r = replayer(vec![item()], None);
        r.tools = tools.clone();
        let handle = tokio::spawn(r.run(start_rx, stop_rx));
        start_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.items_started, 1);
        assert_eq!(report.passes, 0);

        let pids = tools.pids.lock().unwrap().clone();
        assert_eq!(pids.len(), 1);
        assert!(!std::path::Path::new(&format!("/proc/{}", pids[0])).exists());
    }
}
