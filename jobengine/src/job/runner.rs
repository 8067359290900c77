use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, instrument::WithSubscriber, Instrument};

use crate::{
    job::{
        registry::{Outcome, Promoted, Registry},
        Job, JobId, Metadata,
    },
    job_log::{JobLog, JobLogFactory},
    notifier::Notifier,
    progress::{self, ProgressUpdate},
    task::{missing_metadata, JobContext, Task, TaskError},
    TaskTable,
};

/// How long to wait for buffered progress events to land once a task has returned.
const PROGRESS_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Drives a promoted job from running to a terminal state, then promotes the next job of the
/// same type.
#[derive(Clone)]
pub(crate) struct JobRunner {
    registry: Registry,
    tasks: TaskTable,
    logs: Arc<dyn JobLogFactory>,
    notifier: Notifier,
    progress_buffer: usize,
}

impl JobRunner {
    pub(crate) fn new(
        registry: Registry,
        tasks: TaskTable,
        logs: Arc<dyn JobLogFactory>,
        notifier: Notifier,
        progress_buffer: usize,
    ) -> Self {
        Self {
            registry,
            tasks,
            logs,
            notifier,
            progress_buffer,
        }
    }

    pub(crate) fn spawn(&self, promoted: Promoted) {
        tokio::spawn(self.clone().run(promoted));
    }

    pub(crate) fn promote_next(&self, job_type: &str) {
        match self.registry.promote_next(job_type) {
            Ok(Some(promoted)) => self.spawn(promoted),
            Ok(None) => {}
            Err(err) => tracing::error!(
                ?err,
                job_type,
                "Failed to promote next {job_type} job, error: {err}"
            ),
        }
    }

    #[instrument(skip(self, promoted), fields(job_id = %promoted.job.id, job_type = %promoted.job.job_type))]
    async fn run(self, promoted: Promoted) {
        let Promoted {
            mut job,
            cancellation,
        } = promoted;
        let job_id = job.id;
        let job_type = job.job_type.clone();

        let log = self.open_log(job_id).await;
        if let Some(path) = log.path() {
            job.log_path = Some(path.to_owned());
            if let Err(err) = self.registry.set_log_path(job_id, path.to_owned()) {
                tracing::error!(?err, %job_id, "Failed to record log path of job {job_id}");
            }
        }

        tracing::debug!(%job_id, "Executing job {job_id}");
        log.in_scope(|| tracing::info!("Starting {} job {:?}", job.job_type, job.name));

        let (error, stats) = match self.task(&job_type) {
            Some(task) => self.execute(task, job, cancellation.clone(), &log).await,
            None => (
                Some(TaskError::failed(format!("no task registered for {job_type}"))),
                Metadata::new(),
            ),
        };

        let outcome = classify(cancellation.is_cancelled(), error, &stats);
        self.record_outcome(job_id, outcome, stats, &log);
        self.promote_next(&job_type);

        // Dropping the last handle flushes the log file, which may block briefly.
        tokio::task::spawn_blocking(move || drop(log));
    }

    fn task(&self, job_type: &str) -> Option<Arc<dyn Task>> {
        self.tasks.read().ok()?.get(job_type).cloned()
    }

    async fn open_log(&self, job_id: JobId) -> JobLog {
        let logs = self.logs.clone();
        match tokio::task::spawn_blocking(move || logs.open(job_id)).await {
            Ok(Ok(log)) => log,
            Ok(Err(err)) => {
                tracing::warn!(?err, %job_id, "Failed to open log for job {job_id}: {err}");
                JobLog::discard()
            }
            Err(err) => {
                tracing::error!(?err, %job_id, "Opening log for job {job_id} panicked");
                JobLog::discard()
            }
        }
    }

    async fn execute(
        &self,
        task: Arc<dyn Task>,
        job: Job,
        cancellation: CancellationToken,
        log: &JobLog,
    ) -> (Option<TaskError>, Metadata) {
        if let Some(key) = missing_metadata(task.as_ref(), &job) {
            return (
                Some(TaskError::MissingMetadata(key.to_owned())),
                Metadata::new(),
            );
        }

        let job = Arc::new(job);
        let (reporter, receiver) = progress::channel(job.id, self.progress_buffer);
        let drain = tokio::spawn(drain_progress(self.registry.clone(), job.id, receiver));
        let ctx = JobContext::new(cancellation, reporter, log.clone());

        // Executing on a separate task turns a panic into a `JoinError` instead of taking the
        // runner down with it.
        let result = tokio::spawn(
            {
                let task = task.clone();
                let job = job.clone();
                async move { task.execute(&ctx, &job).await }
            }
            .in_current_span()
            .with_subscriber(log.dispatch()),
        )
        .await;

        if tokio::time::timeout(PROGRESS_DRAIN_GRACE, drain).await.is_err() {
            tracing::debug!(job_id = %job.id, "Progress reporter outlived the task");
        }

        let cleanup = tokio::spawn(
            {
                let job = job.clone();
                async move { task.cleanup(&job).await }
            }
            .in_current_span()
            .with_subscriber(log.dispatch()),
        )
        .await
        .map_err(TaskError::from)
        .and_then(|result| result);
        if let Err(err) = cleanup {
            tracing::warn!(job_id = %job.id, ?err, "Cleanup for job {} failed: {err}", job.id);
            log.in_scope(|| tracing::warn!(%err, "Cleanup failed"));
        }

        match result {
            Ok(result) => result.into_parts(),
            Err(err) => (Some(err.into()), Metadata::new()),
        }
    }

    fn record_outcome(&self, job_id: JobId, outcome: Outcome, stats: Metadata, log: &JobLog) {
        match &outcome {
            Outcome::Completed { message } => {
                tracing::debug!(%job_id, "Job complete {job_id}");
                log.in_scope(|| tracing::info!(status = "completed", "{message}"));
            }
            Outcome::Failed { error } => {
                tracing::warn!(%job_id, %error, "Job {job_id} failed: {error}");
                log.in_scope(|| tracing::error!(status = "failed", "Failed: {error}"));
            }
            Outcome::Cancelled => {
                tracing::debug!(%job_id, "Job cancelled {job_id}");
                log.in_scope(|| tracing::warn!(status = "cancelled", "Cancelled"));
            }
        }

        match self.registry.finish(job_id, outcome, stats) {
            Ok(Some(job)) => {
                self.notifier.notify(&job);
            }
            Ok(None) => {
                tracing::warn!(%job_id, "Job {job_id} was no longer running when it finished")
            }
            Err(err) => tracing::error!(
                ?err,
                %job_id,
                "Failed to record outcome of job {job_id}, error: {err}"
            ),
        }
    }
}

async fn drain_progress(
    registry: Registry,
    job_id: JobId,
    mut receiver: mpsc::Receiver<ProgressUpdate>,
) {
    while let Some(update) = receiver.recv().await {
        if let Err(err) = registry.apply_progress(job_id, update) {
            tracing::error!(?err, %job_id, "Failed to record progress for job {job_id}");
            break;
        }
    }
}

fn classify(cancelled: bool, error: Option<TaskError>, stats: &Metadata) -> Outcome {
    match error {
        _ if cancelled => Outcome::Cancelled,
        None => Outcome::Completed {
            message: stats
                .get("msg")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("Completed")
                .to_owned(),
        },
        Some(error @ TaskError::PartialSuccess { .. }) => Outcome::Completed {
            message: format!("Completed with errors: {error}"),
        },
        Some(error) => Outcome::Failed {
            error: error.to_string(),
        },
    }
}

impl From<JoinError> for TaskError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        match value.try_into_panic() {
            Ok(panic) => Self::Panic(
                panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or(msg),
            ),
            Err(_) => Self::Failed(msg),
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn cancellation_wins_over_result() {
        let outcome = classify(true, Some(TaskError::failed("boom")), &Metadata::new());
        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(classify(true, None, &Metadata::new()), Outcome::Cancelled);
    }

    #[test]
    fn success_prefers_task_message() {
        assert_eq!(
            classify(false, None, &Metadata::new()),
            Outcome::Completed {
                message: "Completed".to_owned()
            }
        );

        let mut stats = Metadata::new();
        stats.insert("msg".to_owned(), json!("Synced 12 tracks"));
        assert_eq!(
            classify(false, None, &stats),
            Outcome::Completed {
                message: "Synced 12 tracks".to_owned()
            }
        );
    }

    #[test]
    fn partial_success_completes() {
        let outcome = classify(
            false,
            Some(TaskError::partial(9, 10, "1 file unreadable")),
            &Metadata::new(),
        );
        assert_eq!(
            outcome,
            Outcome::Completed {
                message: "Completed with errors: 1 file unreadable (9 of 10 completed)".to_owned()
            }
        );
    }

    #[test]
    fn other_errors_fail() {
        assert_eq!(
            classify(false, Some(TaskError::failed("boom")), &Metadata::new()),
            Outcome::Failed {
                error: "boom".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn panics_become_task_errors() {
        let err = tokio::spawn(async { panic!("exploded") }).await.unwrap_err();
        assert_eq!(
            TaskError::from(err),
            TaskError::Panic("exploded".to_owned())
        );

        let reason = String::from("formatted");
        let err = tokio::spawn(async move { panic!("{reason} panic") })
            .await
            .unwrap_err();
        assert_eq!(
            TaskError::from(err),
            TaskError::Panic("formatted panic".to_owned())
        );
    }
}
