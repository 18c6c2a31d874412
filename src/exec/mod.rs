//! Remote execution substrate.
//!
//! Everything the engine does on a host goes through [`Executor`]: either
//! synchronously with [`Executor::run`], or as a tracked background task via
//! [`Executor::submit`] / [`Executor::poll`] / [`Executor::wait`] /
//! [`Executor::cancel`]. The executor itself never bounds concurrency; callers
//! decide how many tasks to keep in flight.
//!
//! A non-zero exit status is data, not an error. Only an unreachable host
//! (or a task that was cancelled or timed out) produces an [`Error`].

#[cfg(test)]
pub mod fake;
pub mod shell;
pub mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::HostRole;
use crate::error::{Error, Result};

pub use store::KeyedStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one shell command on a host and captures its result.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn run(&self, host: HostRole, command: &str) -> Result<CommandOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    /// Finished with exit status 0.
    Done,
    /// Finished non-zero, the host was unreachable, or the task was cancelled.
    Failed,
    TimedOut,
}

#[derive(Debug, Clone)]
struct TaskCommand {
    host: HostRole,
    command: String,
}

struct TaskHandle {
    join: JoinHandle<Result<CommandOutput>>,
    cancel: Option<oneshot::Sender<()>>,
    started: Arc<AtomicBool>,
}

enum TaskOutcome {
    Finished(CommandOutput),
    Errored(Error),
    TimedOut(Duration),
}

impl TaskOutcome {
    fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Finished(out) if out.success() => TaskStatus::Done,
            TaskOutcome::Finished(_) | TaskOutcome::Errored(_) => TaskStatus::Failed,
            TaskOutcome::TimedOut(_) => TaskStatus::TimedOut,
        }
    }
}

pub struct Executor {
    transport: Arc<dyn Transport>,
    next_id: u64,
    handles: KeyedStore<TaskHandle>,
    outcomes: KeyedStore<TaskOutcome>,
    commands: KeyedStore<TaskCommand>,
    command_timeout: Duration,
}

/// Bound on a single synchronous [`Executor::run`] unless configured otherwise.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

impl Executor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            next_id: 1,
            handles: KeyedStore::new(),
            outcomes: KeyedStore::new(),
            commands: KeyedStore::new(),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Run a command and wait for it, whatever its exit status.
    ///
    /// A command still running after the command timeout is abandoned (its
    /// future is dropped, which closes the remote channel) and reported as
    /// [`Error::TimedOut`].
    pub async fn run(&self, host: HostRole, command: &str) -> Result<CommandOutput> {
        debug!("[{}] run: {}", host, command);
        let pending = self.transport.run(host, command);
        let out = match tokio::time::timeout(self.command_timeout, pending).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("[{}] gave up after {:?}: {}", host, self.command_timeout, command);
                return Err(Error::TimedOut {
                    task: "inline".to_string(),
                    host,
                    command: command.to_string(),
                    after: self.command_timeout,
                });
            }
        };
        if !out.success() {
            debug!("[{}] exit {}: {}", host, out.exit_code, out.stderr.trim());
        }
        Ok(out)
    }

    /// Run a command and return its stdout, treating a non-zero exit as [`Error::Command`].
    pub async fn run_checked(&self, host: HostRole, command: &str) -> Result<String> {
        let out = self.run(host, command).await?;
        checked(host, command, out)
    }

    /// Run a command, returning whether it exited 0.
    pub async fn run_ok(&self, host: HostRole, command: &str) -> Result<bool> {
        Ok(self.run(host, command).await?.success())
    }

    /// Start a command in the background and return its task id.
    pub fn submit(&mut self, host: HostRole, command: &str) -> String {
        let id = format!("task-{}", self.next_id);
        self.next_id += 1;
        debug!("[{}] submit {}: {}", host, id, command);

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let started = Arc::new(AtomicBool::new(false));

        let join = tokio::spawn({
            let transport = Arc::clone(&self.transport);
            let started = Arc::clone(&started);
            let command = command.to_string();
            let task = id.clone();
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::select! {
                    res = transport.run(host, &command) => res,
                    Ok(()) = cancel_rx => Err(Error::Cancelled { task, host, command }),
                }
            }
        });

        self.handles.set(
            id.clone(),
            TaskHandle {
                join,
                cancel: Some(cancel_tx),
                started,
            },
        );
        self.commands.set(
            id.clone(),
            TaskCommand {
                host,
                command: command.to_string(),
            },
        );
        id
    }

    /// Current status of a task, or `None` if the id is unknown or already consumed.
    pub fn poll(&mut self, id: &str) -> Option<TaskStatus> {
        if !self.commands.contains(id) {
            return None;
        }
        if let Some(outcome) = self.outcomes.get(id) {
            return Some(outcome.status());
        }

        let handle = self.handles.get_mut(id)?;
        if !handle.join.is_finished() {
            return Some(if handle.started.load(Ordering::SeqCst) {
                TaskStatus::Running
            } else {
                TaskStatus::Pending
            });
        }

        let Some(joined) = (&mut handle.join).now_or_never() else {
            return Some(TaskStatus::Running);
        };
        self.handles.unset(id);
        let outcome = outcome_from_join(id, joined);
        let status = outcome.status();
        self.outcomes.set(id, outcome);
        Some(status)
    }

    /// Block until the task finishes or `timeout` elapses, then consume its result.
    ///
    /// On timeout the task is cancelled before [`Error::TimedOut`] is returned.
    pub async fn wait(&mut self, id: &str, timeout: Duration) -> Result<CommandOutput> {
        let outcome = match self.outcomes.unset(id) {
            Some(outcome) => outcome,
            None => {
                let mut handle = self
                    .handles
                    .unset(id)
                    .ok_or_else(|| Error::UnknownTask(id.to_string()))?;

                match tokio::time::timeout(timeout, &mut handle.join).await {
                    Ok(joined) => outcome_from_join(id, joined),
                    Err(_) => {
                        warn!("task {} exceeded {:?}, cancelling", id, timeout);
                        if let Some(cancel) = handle.cancel.take() {
                            let _ = cancel.send(());
                        }
                        TaskOutcome::TimedOut(timeout)
                    }
                }
            }
        };

        debug!("task {} finished: {:?}", id, outcome.status());
        let meta = self.commands.unset(id);
        finish(id, meta, outcome)
    }

    /// Request cancellation. Returns false when the task is unknown or already finished.
    pub fn cancel(&mut self, id: &str) -> bool {
        let Some(handle) = self.handles.get_mut(id) else {
            return false;
        };
        match handle.cancel.take() {
            Some(cancel) => {
                debug!("cancelling task {}", id);
                cancel.send(()).is_ok()
            }
            None => false,
        }
    }

    /// Ids of tasks whose results have not been consumed yet.
    pub fn live_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.commands.keys().map(str::to_string).collect();
        ids.sort();
        ids
    }
}

fn outcome_from_join(
    id: &str,
    joined: std::result::Result<Result<CommandOutput>, tokio::task::JoinError>,
) -> TaskOutcome {
    match joined {
        Ok(Ok(out)) => TaskOutcome::Finished(out),
        Ok(Err(err)) => TaskOutcome::Errored(err),
        Err(join_err) => TaskOutcome::Errored(Error::Other(anyhow::anyhow!(
            "task {} aborted: {}",
            id,
            join_err
        ))),
    }
}

fn finish(
    id: &str,
    meta: Option<TaskCommand>,
    outcome: TaskOutcome,
) -> Result<CommandOutput> {
    match outcome {
        TaskOutcome::Finished(out) => Ok(out),
        TaskOutcome::Errored(err) => Err(err),
        TaskOutcome::TimedOut(after) => {
            let (host, command) = meta
                .map(|m| (m.host, m.command))
                .unwrap_or((HostRole::App, String::new()));
            Err(Error::TimedOut {
                task: id.to_string(),
                host,
                command,
                after,
            })
        }
    }
}

/// Turn a finished command into its stdout, or [`Error::Command`] on non-zero exit.
pub fn checked(host: HostRole, command: &str, out: CommandOutput) -> Result<String> {
    if out.success() {
        Ok(out.stdout)
    } else {
        Err(Error::Command {
            host,
            command: command.to_string(),
            code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        })
    }
}
