//! An in-process engine for long running background jobs.
//!
//! Work is described by [`Task`] implementations registered against a job type. Jobs of the same
//! type run one at a time, oldest first; jobs of different types run in parallel. Callers get a
//! [`JobId`] back immediately and observe progress by polling [`JobEngine::get_job`].
//!
//! ```no_run
//! use async_trait::async_trait;
//! use jobengine::prelude::*;
//!
//! struct ImportLibrary;
//!
//! #[async_trait]
//! impl Task for ImportLibrary {
//!     fn required_metadata_keys(&self) -> &[&'static str] {
//!         &["path"]
//!     }
//!
//!     async fn execute(&self, ctx: &JobContext, job: &Job) -> ExecutionResult {
//!         let files = ["a.flac", "b.flac", "c.flac"];
//!         for (done, file) in files.iter().enumerate() {
//!             if ctx.is_cancelled() {
//!                 break;
//!             }
//!             tracing::info!(%file, "importing");
//!             ctx.report((done * 100 / files.len()) as u8, format!("Importing {file}"));
//!         }
//!         ExecutionResult::done().with_stat("imported", files.len())
//!     }
//! }
//!
//! # async fn run() -> Result<(), JobEngineError> {
//! let engine = JobEngine::new(EngineConfig::default()).with_task("import", ImportLibrary);
//! let job_id = engine
//!     .job("import")
//!     .with_metadata_entry("path", "/music")
//!     .start()?;
//! let job = engine.get_job(job_id)?;
//! # Ok(())
//! # }
//! ```
use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, RwLock},
};

use chrono::TimeDelta;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod job;
pub mod job_log;
pub mod notifier;
pub mod prelude;
pub mod progress;
pub mod pruner;
pub mod task;

use config::EngineConfig;
use job::{
    builder::JobBuilder,
    registry::{CancelOutcome, Registry},
    runner::JobRunner,
    Job, JobId, Metadata,
};
use job_log::{DiscardJobLogs, FileJobLogs, JobLogFactory};
use notifier::{CommandRunner, Notifier, NotifierConfig, ShellCommandRunner};
use pruner::{runner::PrunerRunner, PrunerConfig, Sweeper};
use task::Task;

pub(crate) type TaskTable = Arc<RwLock<HashMap<String, Arc<dyn Task>>>>;

/// Handle to a job engine.
///
/// Cloning is cheap and every clone refers to the same set of jobs. Independent engines share
/// nothing, so tests can run as many as they like side by side.
///
/// Starting jobs spawns onto the current Tokio runtime, so the engine must be used from within
/// one.
#[derive(Clone)]
pub struct JobEngine {
    registry: Registry,
    tasks: TaskTable,
    logs: Arc<dyn JobLogFactory>,
    notifier_config: NotifierConfig,
    notifier: Notifier,
    progress_buffer: usize,
    pruner: Arc<Mutex<Option<PrunerHandle>>>,
}

struct PrunerHandle {
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl JobEngine {
    pub fn new(config: EngineConfig) -> Self {
        let logs: Arc<dyn JobLogFactory> = match config.log_dir {
            Some(dir) => Arc::new(FileJobLogs::new(dir)),
            None => Arc::new(DiscardJobLogs),
        };
        Self {
            registry: Registry::new(),
            tasks: Default::default(),
            logs,
            notifier: Notifier::new(config.notifier.clone(), Arc::new(ShellCommandRunner)),
            notifier_config: config.notifier,
            progress_buffer: config.progress_buffer,
            pruner: Default::default(),
        }
    }

    /// Replace the factory used to open per-job logs.
    pub fn with_log_factory(self, logs: impl JobLogFactory + 'static) -> Self {
        Self {
            logs: Arc::new(logs),
            ..self
        }
    }

    /// Replace how notification commands are executed.
    pub fn with_command_runner(self, runner: impl CommandRunner + 'static) -> Self {
        Self {
            notifier: Notifier::new(self.notifier_config.clone(), Arc::new(runner)),
            ..self
        }
    }

    pub fn with_task(self, job_type: impl Into<String>, task: impl Task + 'static) -> Self {
        let _ = self.register_task(job_type, task).inspect_err(|err| {
            tracing::error!(?err, "Failed to register task, error: {err}");
        });
        self
    }

    /// Periodically sweep finished jobs. Replaces any previously configured pruner.
    pub fn with_pruner(self, config: PrunerConfig) -> Self {
        let cancellation_token = CancellationToken::new();
        let handle = PrunerRunner::new(self.sweeper(), config).spawn(cancellation_token.clone());
        let previous = match self.pruner.lock() {
            Ok(mut pruner) => pruner.replace(PrunerHandle {
                cancellation_token,
                handle,
            }),
            Err(_) => {
                tracing::error!("Pruner state poisoned, not starting the job pruner");
                cancellation_token.cancel();
                None
            }
        };
        if let Some(previous) = previous {
            previous.cancellation_token.cancel();
        }
        self
    }

    /// Bind `job_type` to a task. Registering the same type again replaces the task for jobs
    /// started from then on.
    pub fn register_task(
        &self,
        job_type: impl Into<String>,
        task: impl Task + 'static,
    ) -> Result<(), JobEngineError> {
        let job_type = job_type.into();
        let mut tasks = self.tasks.write().map_err(|_| JobEngineError::BadState)?;
        if tasks.insert(job_type.clone(), Arc::new(task)).is_some() {
            tracing::warn!(job_type, "Replaced task registered for {job_type}");
        }
        Ok(())
    }

    pub fn registered_types(&self) -> Result<Vec<String>, JobEngineError> {
        let tasks = self.tasks.read().map_err(|_| JobEngineError::BadState)?;
        let mut types = tasks.keys().cloned().collect::<Vec<_>>();
        types.sort();
        Ok(types)
    }

    pub fn job(&self, job_type: impl Into<String>) -> JobBuilder<'_> {
        JobBuilder::new(self, job_type)
    }

    /// Create a job and return its id without waiting for it.
    ///
    /// The job starts right away if no other job of its type is running, otherwise it waits its
    /// turn behind the older pending jobs of that type. Metadata is not inspected here; each task
    /// declares which keys it needs.
    pub fn start_job(
        &self,
        job_type: &str,
        name: impl Into<String>,
        metadata: Metadata,
    ) -> Result<JobId, JobEngineError> {
        if self.task(job_type)?.is_none() {
            return Err(JobEngineError::NoHandler(job_type.to_owned()));
        }

        let (job_id, promoted) = self
            .registry
            .insert(job_type.to_owned(), name.into(), metadata)?;
        tracing::debug!(%job_id, job_type, "Created job {job_id}");

        if let Some(promoted) = promoted {
            self.runner().spawn(promoted);
        }
        Ok(job_id)
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<Job>, JobEngineError> {
        self.registry.get(id)
    }

    /// All known jobs, oldest first.
    pub fn list_jobs(&self) -> Result<Vec<Job>, JobEngineError> {
        self.registry.list()
    }

    pub fn list_jobs_of_type(&self, job_type: &str) -> Result<Vec<Job>, JobEngineError> {
        self.registry.list_of_type(job_type)
    }

    /// Request cancellation of a job.
    ///
    /// A pending job is cancelled on the spot and will never run. A running job has its
    /// cancellation signalled and becomes [`job::JobStatus::Cancelled`] once its task returns;
    /// poll [`JobEngine::get_job`] to observe that. Cancelling a finished job does nothing.
    pub fn cancel_job(&self, id: JobId) -> Result<(), JobEngineError> {
        match self.registry.cancel(id)? {
            CancelOutcome::AlreadyFinished => {
                tracing::debug!(job_id = %id, "Job {id} already finished, nothing to cancel");
            }
            CancelOutcome::Dequeued(job) => {
                tracing::debug!(job_id = %id, "Cancelled pending job {id}");
                self.notifier.notify(&job);
            }
            CancelOutcome::Signalled(job) => {
                tracing::debug!(job_id = %id, "Signalled cancellation of job {id}");
                if let Some(task) = self.task(&job.job_type)? {
                    let hook = std::panic::catch_unwind(AssertUnwindSafe(|| task.on_cancel(&job)));
                    if hook.is_err() {
                        tracing::error!(job_id = %id, "Cancel hook for job {id} panicked");
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete finished jobs not updated within `max_age`, and their logs. Returns how many
    /// jobs were removed.
    pub fn sweep(&self, max_age: TimeDelta) -> Result<usize, JobEngineError> {
        self.sweeper().sweep(max_age)
    }

    /// Stop background maintenance started by this engine.
    ///
    /// Running jobs are left alone; cancel them first if they should not outlive the engine.
    pub async fn graceful_shutdown(&self) -> Result<(), JobEngineError> {
        tracing::debug!("Shutting down job engine");
        let pruner = self
            .pruner
            .lock()
            .map_err(|_| JobEngineError::GracefulShutdownFailed)?
            .take();
        if let Some(PrunerHandle {
            cancellation_token,
            handle,
        }) = pruner
        {
            cancellation_token.cancel();
            handle
                .await
                .map_err(|_| JobEngineError::GracefulShutdownFailed)?;
        }
        Ok(())
    }

    fn task(&self, job_type: &str) -> Result<Option<Arc<dyn Task>>, JobEngineError> {
        let tasks = self.tasks.read().map_err(|_| JobEngineError::BadState)?;
        Ok(tasks.get(job_type).cloned())
    }

    fn runner(&self) -> JobRunner {
        JobRunner::new(
            self.registry.clone(),
            self.tasks.clone(),
            self.logs.clone(),
            self.notifier.clone(),
            self.progress_buffer,
        )
    }

    fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.registry.clone(), self.logs.clone())
    }
}

#[derive(Debug, Error)]
pub enum JobEngineError {
    #[error("No task registered for job type `{0}`")]
    NoHandler(String),
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Job registry in bad state")]
    BadState,
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}
