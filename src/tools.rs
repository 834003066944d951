//! External programs: command shape, one-shot execution, long-running spawn.
//! Everything the testbed launches goes through [`ToolRunner`].

use crate::error::ToolError;
use std::fmt;
use std::process::Stdio;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Same command run through `sudo` (or whatever `sudo` points at)
    pub fn elevated(self, sudo: &str) -> Self {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.program);
        args.extend(self.args);
        Self {
            program: sudo.to_string(),
            args,
        }
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for a in &self.args {
            write!(f, " {}", a)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

pub trait ToolRunner: Send + Sync {
    /// Run to completion; spawn failures are errors, exit status is reported.
    fn output(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError>;

    /// Start a long-running process (the replayer). Must be called inside a tokio runtime.
    fn spawn(&self, cmd: &ToolCommand) -> std::io::Result<tokio::process::Child>;

    /// Run to completion and require a zero exit status.
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError> {
        let out = self.output(cmd)?;
        if out.success {
            Ok(out)
        } else {
            Err(ToolError::Failed {
                program: cmd.program.clone(),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs programs on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTools;

impl ToolRunner for SystemTools {
    fn output(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError> {
        tracing::debug!(command = %cmd, "run");
        let out = std::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ToolError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;
        Ok(ToolOutput {
            success: out.status.success(),
            status: out.status.to_string(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    fn spawn(&self, cmd: &ToolCommand) -> std::io::Result<tokio::process::Child> {
        tracing::debug!(command = %cmd, "spawn");
        tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevated_prepends_program() {
        let cmd = ToolCommand::new("tcpreplay").arg("--quiet").elevated("sudo");
        assert_eq!(cmd.program, "sudo");
        assert_eq!(cmd.args, vec!["tcpreplay", "--quiet"]);
        assert_eq!(cmd.to_string(), "sudo tcpreplay --quiet");
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let err = SystemTools
            .run(&ToolCommand::new("/nonexistent/replay-testbed-tool"))
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_failure() {
        let err = SystemTools.run(&ToolCommand::new("false")).unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
        assert!(SystemTools.run(&ToolCommand::new("true")).is_ok());
    }
}
