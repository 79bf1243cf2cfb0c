use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lxm_core::{CommandOutput, CommandRunner};
use tokio::sync::Mutex;

/// Records `systemctl` invocations and optionally rejects reloads, so
/// rollback paths can be exercised without a live service.
pub struct FakeSystemctl {
    calls: Mutex<Vec<Vec<String>>>,
    reject_reload: Mutex<bool>,
}

impl FakeSystemctl {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(vec![]),
            reject_reload: Mutex::new(false),
        }
    }

    pub async fn reject_reloads(&self, reject: bool) {
        *self.reject_reload.lock().await = reject;
    }

    pub async fn reload_count(&self) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some("reload"))
            .count()
    }
}

#[async_trait]
impl CommandRunner for FakeSystemctl {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        if program != "systemctl" {
            return Err(anyhow!("unexpected program {}", program));
        }
        self.calls
            .lock()
            .await
            .push(args.iter().map(|s| s.to_string()).collect());

        if args.first() == Some(&"reload") && *self.reject_reload.lock().await {
            return Ok(CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: "Job for lxc-net.service failed.".to_string(),
            });
        }
        Ok(CommandOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}
