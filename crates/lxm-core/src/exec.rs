use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stderr trimmed for error messages, falling back to stdout.
    pub fn error_text(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

/// Narrow capability for running a single external command. Everything
/// the engine does to the OS (iptables mutations, service reloads)
/// goes through this seam, so reconciliation logic can be tested
/// against a scripted implementation.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Runs commands via tokio, enforcing a per-command timeout. A timeout
/// is reported as an error of that command, never a panic or a hang of
/// the whole pass.
pub struct SystemRunner {
    command_timeout: Duration,
}

impl SystemRunner {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        use tokio::process::Command;

        let mut cmd = Command::new(program);
        cmd.args(args);

        let output = timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| {
                anyhow!(
                    "{} timed out after {}s",
                    program,
                    self.command_timeout.as_secs()
                )
            })?
            .with_context(|| format!("failed to spawn {}", program))?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
