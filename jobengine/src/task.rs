use std::fmt::Display;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    job::{Job, Metadata},
    job_log::JobLog,
    progress::ProgressReporter,
};

/// The work behind one job type.
///
/// A task is registered once against a type name via [`crate::JobEngine::register_task`] and is
/// then shared by every job of that type, so it must not keep per-job state in `self` without
/// keying it by [`crate::job::JobId`].
#[async_trait]
pub trait Task: Send + Sync {
    /// Metadata keys that must be present before [`Task::execute`] is invoked.
    ///
    /// Jobs missing any of them fail with [`TaskError::MissingMetadata`] without executing.
    fn required_metadata_keys(&self) -> &[&'static str] {
        &[]
    }

    /// Do the work.
    ///
    /// Implementations are expected to check [`JobContext::is_cancelled`] at natural boundaries
    /// (once per file, record or batch) and return promptly once it is set. The engine waits for
    /// this future to finish; it never aborts it.
    async fn execute(&self, ctx: &JobContext, job: &Job) -> ExecutionResult;

    /// Release task-local resources. Always called after [`Task::execute`] returns, whatever the
    /// outcome. Errors are logged and otherwise ignored.
    async fn cleanup(&self, _job: &Job) -> Result<(), TaskError> {
        Ok(())
    }

    /// Called synchronously when a running job of this type is cancelled, in addition to the
    /// cancellation token being triggered.
    fn on_cancel(&self, _job: &Job) {}
}

/// Everything a running task needs to talk back to the engine.
#[derive(Debug, Clone)]
pub struct JobContext {
    cancellation: CancellationToken,
    progress: ProgressReporter,
    log: JobLog,
}

impl JobContext {
    pub(crate) fn new(
        cancellation: CancellationToken,
        progress: ProgressReporter,
        log: JobLog,
    ) -> Self {
        Self {
            cancellation,
            progress,
            log,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the job has been cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// A child token, for handing to nested work that should stop with the job.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.child_token()
    }

    /// Fire-and-forget progress report. Never blocks.
    pub fn report(&self, percent: u8, message: impl Into<String>) {
        self.progress.report(percent, message)
    }

    pub fn reporter(&self) -> ProgressReporter {
        self.progress.clone()
    }

    /// The job's log. Events emitted while `execute` runs already go to it; use
    /// [`JobLog::dispatch`] for work spawned onto other tasks.
    pub fn log(&self) -> &JobLog {
        &self.log
    }
}

/// What a task returns.
///
/// Stats are carried on both arms so that partially collected results survive a failure; the
/// engine merges them into the job metadata either way.
#[derive(Debug)]
pub enum ExecutionResult {
    Done { stats: Metadata },
    Error { error: TaskError, stats: Metadata },
}

impl ExecutionResult {
    pub fn done() -> Self {
        Self::Done {
            stats: Metadata::new(),
        }
    }

    pub fn with_stats(mut self, more: Metadata) -> Self {
        self.stats_mut().extend(more);
        self
    }

    pub fn with_stat(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.stats_mut().insert(key.into(), value.into());
        self
    }

    pub(crate) fn into_parts(self) -> (Option<TaskError>, Metadata) {
        match self {
            Self::Done { stats } => (None, stats),
            Self::Error { error, stats } => (Some(error), stats),
        }
    }

    fn stats_mut(&mut self) -> &mut Metadata {
        match self {
            Self::Done { stats } | Self::Error { stats, .. } => stats,
        }
    }
}

impl From<TaskError> for ExecutionResult {
    fn from(error: TaskError) -> Self {
        Self::Error {
            error,
            stats: Metadata::new(),
        }
    }
}

impl<E> From<Result<Metadata, E>> for ExecutionResult
where
    E: Into<TaskError>,
{
    fn from(result: Result<Metadata, E>) -> Self {
        match result {
            Ok(stats) => Self::Done { stats },
            Err(error) => error.into().into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Some units of a bulk operation failed while others succeeded. Jobs ending with this error
    /// are still reported as completed.
    #[error("{message} ({completed} of {total} completed)")]
    PartialSuccess {
        completed: u64,
        total: u64,
        message: String,
    },
    #[error("missing required metadata: {0}")]
    MissingMetadata(String),
    #[error("{0}")]
    Failed(String),
    #[error("task panicked: {0}")]
    Panic(String),
}

impl TaskError {
    pub fn failed(error: impl Display) -> Self {
        Self::Failed(error.to_string())
    }

    pub fn partial(completed: u64, total: u64, message: impl Into<String>) -> Self {
        Self::PartialSuccess {
            completed,
            total,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(value: std::io::Error) -> Self {
        Self::failed(value)
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(value: serde_json::Error) -> Self {
        Self::failed(value)
    }
}

/// First required key absent from the job's metadata.
pub(crate) fn missing_metadata(task: &dyn Task, job: &Job) -> Option<&'static str> {
    task.required_metadata_keys()
        .iter()
        .copied()
        .find(|key| !job.metadata.contains_key(*key))
}
