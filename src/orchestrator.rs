//! Process-per-shard fan-out.
//!
//! Every shard runs as its own OS process bound to one credential, with its
//! stdout and stderr captured in a per-shard log file. The orchestrator waits
//! on all of them and reports each exit independently: one failed shard never
//! stops the others. When the shutdown future resolves, every live worker is
//! sent SIGTERM (a hard kill off unix), workers not yet started are never
//! launched, and the orchestrator returns once the live ones have exited.

use std::fmt;
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::config::CREDENTIAL_ENV;
use crate::shard::ShardId;
use crate::worker::EXIT_CANCELLED;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no shard tasks to run")]
    NoTasks,
}

/// Program and leading arguments used to start a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub base_args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// Re-invoke the running binary.
    pub fn current_exe() -> Result<Self, OrchestratorError> {
        let program = std::env::current_exe().map_err(|source| OrchestratorError::Io {
            path: PathBuf::from("<current_exe>"),
            source,
        })?;
        Ok(Self::new(program, Vec::new()))
    }
}

/// One worker process to launch.
#[derive(Debug, Clone)]
pub struct ShardTask {
    pub shard_id: ShardId,
    /// Arguments after the command's base arguments.
    pub args: Vec<String>,
    /// Passed to the worker through its environment, never on the command line.
    pub credential: String,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ShardStatus {
    Succeeded,
    Failed { code: Option<i32> },
    Cancelled,
    LaunchFailed { reason: String },
}

impl ShardStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ShardStatus::Succeeded)
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardStatus::Succeeded => f.write_str("succeeded"),
            ShardStatus::Failed { code: Some(code) } => write!(f, "failed (exit code {code})"),
            ShardStatus::Failed { code: None } => f.write_str("failed (killed by signal)"),
            ShardStatus::Cancelled => f.write_str("cancelled"),
            ShardStatus::LaunchFailed { reason } => write!(f, "failed to launch: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardOutcome {
    pub shard_id: ShardId,
    pub status: ShardStatus,
    pub log_path: PathBuf,
    pub elapsed_ms: u64,
}

/// Runs shard workers as child processes.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    command: WorkerCommand,
    max_workers: usize,
    shutdown_grace: Duration,
}

impl Orchestrator {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            max_workers: usize::MAX,
            shutdown_grace: Duration::from_secs(120),
        }
    }

    /// Bound how many workers run at once (at least one).
    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n.max(1);
        self
    }

    /// How long a signalled worker may take before it is killed outright.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Launch every task and wait for all of them.
    ///
    /// Outcomes are returned in task order.
    pub async fn run<F>(
        &self,
        tasks: Vec<ShardTask>,
        shutdown: F,
    ) -> Result<Vec<ShardOutcome>, OrchestratorError>
    where
        F: Future<Output = ()>,
    {
        if tasks.is_empty() {
            return Err(OrchestratorError::NoTasks);
        }
        for task in &tasks {
            if let Some(dir) = task.log_path.parent() {
                std::fs::create_dir_all(dir).map_err(|source| OrchestratorError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(self.max_workers.min(tasks.len())));
        info!(
            shards = tasks.len(),
            max_workers = self.max_workers.min(tasks.len()),
            "launching shard workers"
        );

        let all = join_all(
            tasks
                .into_iter()
                .map(|task| self.run_one(task, permits.clone(), cancel_rx.clone())),
        );
        tokio::pin!(all);
        tokio::pin!(shutdown);

        let outcomes = tokio::select! {
            outcomes = &mut all => outcomes,
            _ = &mut shutdown => {
                warn!("termination requested; forwarding to shard workers");
                let _ = cancel_tx.send(true);
                all.await
            }
        };

        for outcome in &outcomes {
            if outcome.status.is_success() {
                info!(shard_id = outcome.shard_id.get(), elapsed_ms = outcome.elapsed_ms, "shard succeeded");
            } else {
                error!(
                    shard_id = outcome.shard_id.get(),
                    status = %outcome.status,
                    log = %outcome.log_path.display(),
                    "shard did not succeed"
                );
            }
        }
        Ok(outcomes)
    }

    async fn run_one(
        &self,
        task: ShardTask,
        permits: Arc<Semaphore>,
        mut cancel: watch::Receiver<bool>,
    ) -> ShardOutcome {
        let started = Instant::now();
        let outcome = |status: ShardStatus| ShardOutcome {
            shard_id: task.shard_id,
            status,
            log_path: task.log_path.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        let _permit = tokio::select! {
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return outcome(ShardStatus::Cancelled),
            },
            _ = cancelled(&mut cancel) => return outcome(ShardStatus::Cancelled),
        };
        if *cancel.borrow() {
            return outcome(ShardStatus::Cancelled);
        }

        let mut child = match self.spawn(&task) {
            Ok(child) => child,
            Err(e) => {
                error!(shard_id = task.shard_id.get(), error = %e, "failed to launch worker");
                return outcome(ShardStatus::LaunchFailed {
                    reason: e.to_string(),
                });
            }
        };
        info!(
            shard_id = task.shard_id.get(),
            pid = child.id(),
            log = %task.log_path.display(),
            "worker started"
        );

        let mut signalled = false;
        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancelled(&mut cancel) => {
                signalled = true;
                terminate(&mut child);
                match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!(shard_id = task.shard_id.get(), "worker ignored termination; killing");
                        let _ = child.start_kill();
                        child.wait().await
                    }
                }
            }
        };

        match status {
            Ok(status) => outcome(exit_status(status, signalled)),
            Err(e) => outcome(ShardStatus::LaunchFailed {
                reason: format!("wait failed: {e}"),
            }),
        }
    }

    fn spawn(&self, task: &ShardTask) -> std::io::Result<Child> {
        let log = File::create(&task.log_path)?;
        let log_err = log.try_clone()?;
        Command::new(&self.command.program)
            .args(&self.command.base_args)
            .args(&task.args)
            .env(CREDENTIAL_ENV, &task.credential)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
    }
}

/// Resolves once cancellation is requested; never if the sender goes away.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                return;
            }
        }
    }
    let _ = child.start_kill();
}

fn exit_status(status: ExitStatus, signalled: bool) -> ShardStatus {
    match status.code() {
        Some(0) => ShardStatus::Succeeded,
        Some(EXIT_CANCELLED) => ShardStatus::Cancelled,
        Some(code) => ShardStatus::Failed { code: Some(code) },
        None if signalled => ShardStatus::Cancelled,
        None => ShardStatus::Failed { code: None },
    }
}

/// Per-shard log file inside `dir`.
pub fn log_path(dir: &Path, shard_id: ShardId) -> PathBuf {
    dir.join(format!("shard_{shard_id}.log"))
}
