//! The in-memory store of every job and the policy deciding which job of a type may run.
//!
//! All mutation happens under a single write lock. Checking whether a type already has a
//! running job and promoting a pending one is always done inside the same critical section, so
//! two jobs of the same type can never be started concurrently.
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    job::{Job, JobId, JobStatus, Metadata},
    progress::ProgressUpdate,
    JobEngineError,
};

struct JobRecord {
    job: Job,
    cancellation: Option<CancellationToken>,
    cancel_requested: bool,
}

#[derive(Default)]
struct Jobs {
    next_id: u64,
    records: HashMap<JobId, JobRecord>,
}

impl Jobs {
    fn get_mut(&mut self, id: JobId) -> Result<&mut JobRecord, JobEngineError> {
        self.records
            .get_mut(&id)
            .ok_or(JobEngineError::NotFound(id))
    }

    fn has_running(&self, job_type: &str) -> bool {
        self.records
            .values()
            .any(|record| record.job.job_type == job_type && record.job.status == JobStatus::Running)
    }

    fn promote(&mut self, job_type: &str) -> Option<Promoted> {
        if self.has_running(job_type) {
            return None;
        }
        let record = self
            .records
            .values_mut()
            .filter(|record| {
                record.job.job_type == job_type && record.job.status == JobStatus::Pending
            })
            .min_by_key(|record| (record.job.created_at, record.job.id))?;

        let cancellation = CancellationToken::new();
        record.job.mark_running();
        record.cancellation = Some(cancellation.clone());
        tracing::debug!(job_id = %record.job.id, job_type, "Promoted job {} to running", record.job.id);

        Some(Promoted {
            job: record.job.clone(),
            cancellation,
        })
    }
}

/// A job that has just been flipped to running and must now be handed to a runner.
pub(crate) struct Promoted {
    pub(crate) job: Job,
    pub(crate) cancellation: CancellationToken,
}

#[derive(Debug)]
pub(crate) enum CancelOutcome {
    /// The job had already reached a terminal state; nothing changed.
    AlreadyFinished,
    /// The job was pending and is now cancelled without ever running.
    Dequeued(Job),
    /// The job is running and its cancellation token has been triggered.
    Signalled(Job),
}

/// How the runner classified a finished execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed { message: String },
    Failed { error: String },
    Cancelled,
}

#[derive(Clone, Default)]
pub(crate) struct Registry {
    jobs: Arc<RwLock<Jobs>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create a pending job and, if nothing of its type is running, promote it straight away.
    pub(crate) fn insert(
        &self,
        job_type: String,
        name: String,
        metadata: Metadata,
    ) -> Result<(JobId, Option<Promoted>), JobEngineError> {
        let mut jobs = self.jobs.write().map_err(|_| JobEngineError::BadState)?;
        let id = JobId::from(jobs.next_id);
        jobs.next_id += 1;

        let job = Job::new(id, job_type.clone(), name, metadata);
        jobs.records.insert(
            id,
            JobRecord {
                job,
                cancellation: None,
                cancel_requested: false,
            },
        );

        Ok((id, jobs.promote(&job_type)))
    }

    pub(crate) fn promote_next(&self, job_type: &str) -> Result<Option<Promoted>, JobEngineError> {
        let mut jobs = self.jobs.write().map_err(|_| JobEngineError::BadState)?;
        Ok(jobs.promote(job_type))
    }

    /// Record where a running job's log is written.
    pub(crate) fn set_log_path(&self, id: JobId, path: PathBuf) -> Result<(), JobEngineError> {
        let mut jobs = self.jobs.write().map_err(|_| JobEngineError::BadState)?;
        jobs.get_mut(id)?.job.log_path = Some(path);
        Ok(())
    }

    pub(crate) fn get(&self, id: JobId) -> Result<Option<Job>, JobEngineError> {
        let jobs = self.jobs.read().map_err(|_| JobEngineError::BadState)?;
        Ok(jobs.records.get(&id).map(|record| record.job.clone()))
    }

    pub(crate) fn list(&self) -> Result<Vec<Job>, JobEngineError> {
        self.list_matching(|_| true)
    }

    pub(crate) fn list_of_type(&self, job_type: &str) -> Result<Vec<Job>, JobEngineError> {
        self.list_matching(|job| job.job_type == job_type)
    }

    fn list_matching(&self, predicate: impl Fn(&Job) -> bool) -> Result<Vec<Job>, JobEngineError> {
        let jobs = self.jobs.read().map_err(|_| JobEngineError::BadState)?;
        let mut matching = jobs
            .records
            .values()
            .map(|record| &record.job)
            .filter(|job| predicate(job))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by_key(|job| job.id);
        Ok(matching)
    }

    /// Apply a progress event. Returns `false` when the event was dropped because the job is
    /// gone or already terminal.
    pub(crate) fn apply_progress(
        &self,
        id: JobId,
        update: ProgressUpdate,
    ) -> Result<bool, JobEngineError> {
        let mut jobs = self.jobs.write().map_err(|_| JobEngineError::BadState)?;
        match jobs.records.get_mut(&id) {
            Some(record) if !record.job.status.is_terminal() && !record.cancel_requested => {
                record.job.mark_progress(update.percent, update.message);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub(crate) fn cancel(&self, id: JobId) -> Result<CancelOutcome, JobEngineError> {
        let mut jobs = self.jobs.write().map_err(|_| JobEngineError::BadState)?;
        let record = jobs.get_mut(id)?;
        match record.job.status {
            JobStatus::Pending => {
                record.job.mark_cancelled();
                Ok(CancelOutcome::Dequeued(record.job.clone()))
            }
            JobStatus::Running => {
                record.cancel_requested = true;
                record.job.message = "Cancelling...".to_owned();
                record.job.updated_at = Utc::now();
                if let Some(cancellation) = record.cancellation.as_ref() {
                    cancellation.cancel();
                }
                Ok(CancelOutcome::Signalled(record.job.clone()))
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                Ok(CancelOutcome::AlreadyFinished)
            }
        }
    }

    /// Record the terminal state of a running job and merge the task's stats into its metadata.
    ///
    /// A cancellation request that raced the end of execution wins over whatever the runner
    /// classified. Returns the final snapshot, or `None` if the job is no longer running.
    pub(crate) fn finish(
        &self,
        id: JobId,
        outcome: Outcome,
        stats: Metadata,
    ) -> Result<Option<Job>, JobEngineError> {
        let mut jobs = self.jobs.write().map_err(|_| JobEngineError::BadState)?;
        let record = jobs.get_mut(id)?;
        if record.job.status != JobStatus::Running {
            return Ok(None);
        }

        record.job.metadata.extend(stats);
        let outcome = if record.cancel_requested {
            Outcome::Cancelled
        } else {
            outcome
        };
        match outcome {
            Outcome::Completed { message } => record.job.mark_completed(message),
            Outcome::Failed { error } => record.job.mark_failed(error),
            Outcome::Cancelled => record.job.mark_cancelled(),
        }
        record.cancellation = None;
        Ok(Some(record.job.clone()))
    }

    /// Remove terminal jobs last updated before `now - max_age`, returning what was removed.
    ///
    /// An age reaching past the earliest representable time removes nothing.
    pub(crate) fn sweep(&self, max_age: TimeDelta) -> Result<Vec<Job>, JobEngineError> {
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return Ok(Vec::new());
        };
        let mut jobs = self.jobs.write().map_err(|_| JobEngineError::BadState)?;
        let expired = jobs
            .records
            .values()
            .filter(|record| record.job.status.is_terminal() && record.job.updated_at < cutoff)
            .map(|record| record.job.id)
            .collect::<Vec<_>>();

        Ok(expired
            .into_iter()
            .filter_map(|id| jobs.records.remove(&id))
            .map(|record| record.job)
            .collect())
    }
}
