//! Execution units: one isolated run of one job.
//!
//! Every unit runs on its own tokio task so the pool's control path never
//! awaits a handler directly. [`TaskExecutor`] runs an async Rust handler on
//! that task (a panic is contained and reported as a crash);
//! [`ProcessExecutor`] runs a child process per job and speaks the
//! [`report`](crate::report) protocol with it.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::Instant;

use crate::job::{Job, JobId};
use crate::report::{ExecutionReport, JOB_ATTEMPT_ENV, JOB_DATA_ENV};

/// Result type for job handlers.
pub type JobResult = std::result::Result<serde_json::Value, JobError>;

/// Error returned from job handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct JobError {
    /// Error message.
    pub message: String,
}

impl JobError {
    /// Create a new handler error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

/// How an execution unit ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Handler reported success.
    Success(serde_json::Value),
    /// Handler reported a business failure.
    Failure(String),
    /// The unit died without a usable report.
    Crash(String),
    /// The unit was terminated from outside.
    Killed,
}

impl From<ExecutionReport> for Outcome {
    fn from(report: ExecutionReport) -> Self {
        match report {
            ExecutionReport::Success(result) => Outcome::Success(result),
            ExecutionReport::Failure(error) => Outcome::Failure(error),
        }
    }
}

/// A running job.
pub struct ExecutionUnit {
    job_id: JobId,
    started_at: Instant,
    task: JoinHandle<Outcome>,
}

impl ExecutionUnit {
    /// Run `work` as the execution unit for `job_id`.
    pub fn spawn<F>(job_id: JobId, work: F) -> Self
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        Self {
            job_id,
            started_at: Instant::now(),
            task: tokio::spawn(work),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Cancellation token that outlives borrows of the unit.
    pub fn handle(&self) -> UnitHandle {
        UnitHandle {
            job_id: self.job_id.clone(),
            started_at: self.started_at,
            abort: self.task.abort_handle(),
        }
    }

    /// Terminate the unit immediately.
    pub fn kill(&self) {
        self.task.abort();
    }

    /// Wait for the unit to end.
    pub async fn join(&mut self) -> Outcome {
        match (&mut self.task).await {
            Ok(outcome) => outcome,
            Err(e) => outcome_from_join_error(e),
        }
    }
}

fn outcome_from_join_error(err: JoinError) -> Outcome {
    if err.is_cancelled() {
        return Outcome::Killed;
    }
    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Outcome::Crash(format!("handler panicked: {}", message))
}

/// Ownership token for a running unit, held by the in-flight registry.
#[derive(Debug, Clone)]
pub struct UnitHandle {
    job_id: JobId,
    started_at: Instant,
    abort: AbortHandle,
}

impl UnitHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Terminate the unit. No grace period.
    pub fn kill(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Starts an execution unit for a job.
pub trait Executor: Send + Sync + 'static {
    /// Launch `job`. Must not block; the work runs inside the returned unit.
    fn launch(&self, job: Job) -> ExecutionUnit;
}

/// Runs an async handler on a dedicated tokio task.
///
/// Killing the unit aborts the task, which only takes effect at the
/// handler's next `.await`. A CPU-bound handler that never yields keeps
/// running past a timeout or a forced drain until it returns on its own.
/// Use [`ProcessExecutor`] when jobs must be stoppable at any point.
pub struct TaskExecutor<F> {
    handler: Arc<F>,
}

impl<F, Fut> TaskExecutor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    /// Create a new TaskExecutor.
    pub fn new(handler: F) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<F, Fut> Executor for TaskExecutor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    fn launch(&self, job: Job) -> ExecutionUnit {
        let handler = self.handler.clone();
        ExecutionUnit::spawn(job.id.clone(), async move {
            match handler(job).await {
                Ok(result) => Outcome::Success(result),
                Err(e) => Outcome::Failure(e.message),
            }
        })
    }
}

/// Runs a child process per job.
///
/// The child is killed when its unit is killed or dropped. stderr is
/// inherited so handler diagnostics reach the pool's log stream.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessExecutor {
    /// Create a new ProcessExecutor running `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an extra environment variable for every child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

impl Executor for ProcessExecutor {
    fn launch(&self, job: Job) -> ExecutionUnit {
        let command = self.command();
        let program = self.program.display().to_string();
        ExecutionUnit::spawn(job.id.clone(), run_child(command, program, job))
    }
}

async fn run_child(mut command: Command, program: String, job: Job) -> Outcome {
    let data = match job.to_json() {
        Ok(data) => data,
        Err(e) => return Outcome::Crash(format!("cannot encode job: {}", e)),
    };
    command
        .env(JOB_DATA_ENV, data)
        .env(JOB_ATTEMPT_ENV, job.attempt.to_string());

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return Outcome::Crash(format!("failed to start {}: {}", program, e)),
    };
    tracing::trace!(job_id = %job.id, pid = ?child.id(), "Handler process started");

    let output = match child.wait_with_output().await {
        Ok(output) => output,
        Err(e) => return Outcome::Crash(format!("failed to wait for {}: {}", program, e)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let last_line = stdout.lines().map(str::trim).rev().find(|l| !l.is_empty());
    match last_line {
        Some(line) => match ExecutionReport::parse(line) {
            Ok(report) => report.into(),
            Err(e) => Outcome::Crash(format!(
                "unreadable report from {} ({}): {}",
                program, output.status, e
            )),
        },
        None => Outcome::Crash(format!(
            "{} exited with {} without reporting",
            program, output.status
        )),
    }
}
