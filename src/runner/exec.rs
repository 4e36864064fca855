use std::{
    fs,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use tokio::{process::Command, sync::watch};
use tracing::{debug, info, warn};

use super::{Runner, StartFuture, write_agent_files};
use crate::{
    binaries::BinaryLocator,
    harness::{AgentCommand, Endpoint, Harness, HarnessError, HarnessFuture, LOCALHOST},
};

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

const STOP_GRACE: Duration = Duration::from_secs(5);

type Exit = Option<Result<(), HarnessError>>;

/// Runs agents as child processes of this one.
#[derive(Clone)]
pub struct ExecRunner {
    locator: Arc<dyn BinaryLocator>,
}

impl ExecRunner {
    pub fn new(locator: Arc<dyn BinaryLocator>) -> Self {
        Self { locator }
    }
}

impl Runner for ExecRunner {
    fn agent_dir(&self, host_dir: &Path) -> PathBuf {
        host_dir.to_path_buf()
    }

    fn start<'a>(&'a self, cmd: &'a AgentCommand) -> StartFuture<'a> {
        Box::pin(async move {
            let binary = self
                .locator
                .locate(cmd.product, &cmd.version)
                .await
                .with_context(|| format!("locate {} {}", cmd.product, cmd.version))?;
            let harness = spawn_agent(&binary, cmd)?;
            Ok(Arc::new(harness) as Arc<dyn Harness>)
        })
    }
}

pub struct ExecHarness {
    cmd: AgentCommand,
    pid: Option<u32>,
    exit: watch::Receiver<Exit>,
    kill: watch::Sender<bool>,
}

/// Spawns `binary` for `cmd`. A reaper task owns the child and publishes
/// how it ended.
pub fn spawn_agent(binary: &Path, cmd: &AgentCommand) -> anyhow::Result<ExecHarness> {
    write_agent_files(cmd)?;

    let stdout_path = cmd.host_dir.join(STDOUT_LOG);
    let stderr_path = cmd.host_dir.join(STDERR_LOG);
    let stdout = fs::File::create(&stdout_path)
        .with_context(|| format!("create {}", stdout_path.display()))?;
    let stderr = fs::File::create(&stderr_path)
        .with_context(|| format!("create {}", stderr_path.display()))?;

    let mut child = Command::new(binary)
        .args(&cmd.args)
        .envs(&cmd.env)
        .current_dir(&cmd.host_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn {} for {}", binary.display(), cmd.name))?;
    let pid = child.id();
    info!(agent = %cmd.name, binary = %binary.display(), pid, "agent started");

    let (exit_tx, exit_rx) = watch::channel::<Exit>(None);
    let (kill_tx, mut kill_rx) = watch::channel(false);
    let agent = cmd.name.clone();
    tokio::spawn(async move {
        // A dropped harness counts as a kill request too.
        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill_rx.changed() => None,
        };
        let status = match status {
            Some(status) => status,
            None => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let outcome = match status {
            Ok(status) => exit_result(&agent, status),
            Err(err) => Err(HarnessError::Io {
                agent: agent.clone(),
                message: format!("wait: {err}"),
            }),
        };
        debug!(agent = %agent, outcome = ?outcome, "agent exited");
        exit_tx.send_replace(Some(outcome));
    });

    Ok(ExecHarness {
        cmd: cmd.clone(),
        pid,
        exit: exit_rx,
        kill: kill_tx,
    })
}

fn exit_result(agent: &str, status: ExitStatus) -> Result<(), HarnessError> {
    if status.success() {
        Ok(())
    } else {
        Err(HarnessError::Exited {
            agent: agent.to_string(),
            status: status.to_string(),
        })
    }
}

impl ExecHarness {
    fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    async fn wait_exit(&self) -> Result<(), HarnessError> {
        let mut rx = self.exit.clone();
        let seen = rx.wait_for(|o| o.is_some()).await.ok().and_then(|o| o.clone());
        match seen.or_else(|| rx.borrow().clone()) {
            Some(outcome) => outcome,
            None => Err(HarnessError::Io {
                agent: self.cmd.name.clone(),
                message: "reaper task ended without an exit status".to_string(),
            }),
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // SAFETY: kill(2) takes no pointers; a stale pid only yields ESRCH.
    let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

impl Harness for ExecHarness {
    fn name(&self) -> &str {
        &self.cmd.name
    }

    fn endpoint(&self, name: &str, local: bool) -> Result<Endpoint, HarnessError> {
        let port = self.cmd.port(name)?;
        let host = self.cmd.ip.unwrap_or(LOCALHOST);
        Ok(self.cmd.endpoint_at(name, host, port, local))
    }

    fn wait(&self) -> HarnessFuture<'_, ()> {
        Box::pin(self.wait_exit())
    }

    fn stop(&self) -> HarnessFuture<'_, ()> {
        Box::pin(async move {
            if self.exited() {
                return Ok(());
            }
            if let Some(pid) = self.pid {
                terminate(pid);
            }
            if tokio::time::timeout(STOP_GRACE, self.wait_exit())
                .await
                .is_err()
            {
                warn!(agent = %self.cmd.name, "agent ignored SIGTERM; killing");
                self.kill.send_replace(true);
                let _ = self.wait_exit().await;
            }
            info!(agent = %self.cmd.name, "agent stopped");
            Ok(())
        })
    }
}
