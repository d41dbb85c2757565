//! OS command execution behind a trait so discovery can run against fakes.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Timeout for every discovery command
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// A program plus arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
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

    /// Run a pipeline through `sh -c`
    pub fn sh(script: impl Into<String>) -> Self {
        Self::new("sh", ["-c".to_string(), script.into()])
    }

    /// Run a script through PowerShell without loading profiles
    pub fn powershell(script: impl Into<String>) -> Self {
        Self::new(
            "powershell",
            ["-NoProfile".to_string(), "-Command".to_string(), script.into()],
        )
    }

    /// Run a pipeline through `cmd /C`
    pub fn cmd(script: impl Into<String>) -> Self {
        Self::new("cmd", ["/C".to_string(), script.into()])
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs a command and returns its stdout.
///
/// A non-zero exit status is not an error (`grep` exits 1 on no match);
/// only spawn failures and timeouts are.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &ShellCommand) -> Result<String>;
}

/// Runs commands with `tokio::process` under a timeout
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self {
            timeout: COMMAND_TIMEOUT,
        }
    }
}

impl SystemRunner {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &ShellCommand) -> Result<String> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&command.program)
                .args(&command.args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .with_context(|| format!("Command timed out: {}", command.program))?
        .with_context(|| format!("Failed to run: {}", command.program))?;

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let cmd = ShellCommand::new("ps", ["-o", "ppid=", "-p", "42"]);
        assert_eq!(cmd.to_string(), "ps -o ppid= -p 42");
        assert_eq!(ShellCommand::sh("echo hi").to_string(), "sh -c echo hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_ignores_exit_status() {
        let runner = SystemRunner::default();
        let stdout = runner
            .run(&ShellCommand::sh("echo found; exit 1"))
            .await
            .unwrap();
        assert_eq!(stdout.trim(), "found");
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let runner = SystemRunner::default();
        let result = runner
            .run(&ShellCommand::new("agquota-no-such-program", Vec::<String>::new()))
            .await;
        assert!(result.is_err());
    }
}
