//! The job record and its status lifecycle.
use std::{fmt::Display, path::PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

pub mod builder;
pub(crate) mod registry;
pub(crate) mod runner;

/// Open key/value bag carried by every job.
///
/// Task inputs are supplied through it at creation, and whatever stats a task returns are merged
/// into it once the job finishes.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Opaque job identifier, assigned sequentially by the engine.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Where a job is in its lifecycle.
///
/// `Pending -> Running -> {Completed | Failed | Cancelled}`, with `Pending -> Cancelled` allowed
/// for jobs that never started. The last three are terminal.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(status)
    }
}

/// A snapshot of one unit of background work.
///
/// Snapshots are copies; mutating one has no effect on the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub name: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub error: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_path: Option<PathBuf>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        job_type: String,
        name: String,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_type,
            name,
            status: JobStatus::Pending,
            progress: 0,
            message: "Pending".to_owned(),
            error: None,
            metadata,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            log_path: None,
        }
    }

    /// Time spent running, if the job has started.
    ///
    /// For jobs still running this is measured against the current time.
    pub fn elapsed(&self) -> Option<TimeDelta> {
        let started_at = self.started_at?;
        Some(self.finished_at.unwrap_or_else(Utc::now) - started_at)
    }

    /// A string metadata value, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(serde_json::Value::as_str)
    }

    pub(crate) fn mark_running(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.message = "Starting...".to_owned();
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_progress(&mut self, percent: u8, message: String) {
        self.progress = percent.min(100);
        self.message = message;
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_completed(&mut self, message: String) {
        self.finish(JobStatus::Completed);
        self.progress = 100;
        self.message = message;
    }

    pub(crate) fn mark_failed(&mut self, error: String) {
        self.finish(JobStatus::Failed);
        self.message = format!("Failed: {error}");
        self.error = Some(error);
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.finish(JobStatus::Cancelled);
        self.message = "Cancelled".to_owned();
    }

    fn finish(&mut self, status: JobStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.finished_at = Some(now);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    impl Job {
        pub(crate) const DEFAULT_TYPE: &'static str = "job_type";

        pub(crate) fn raw_job() -> Self {
            Self::new(
                0.into(),
                Self::DEFAULT_TYPE.to_owned(),
                "job".to_owned(),
                Metadata::new(),
            )
        }

        pub(crate) fn with_status(self, status: JobStatus) -> Self {
            Self { status, ..self }
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn completing_forces_full_progress() {
        let mut job = Job::raw_job();
        job.mark_running();
        job.mark_progress(40, "Halfway".to_owned());
        job.mark_completed("Completed".to_owned());

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn progress_is_clamped() {
        let mut job = Job::raw_job();
        job.mark_progress(250, "Too far".to_owned());
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn failing_records_error() {
        let mut job = Job::raw_job();
        job.mark_running();
        job.mark_failed("boom".to_owned());

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert_eq!(job.message, "Failed: boom");
    }

    #[test]
    fn elapsed_requires_start() {
        let mut job = Job::raw_job();
        assert!(job.elapsed().is_none());
        job.mark_running();
        job.mark_completed("Completed".to_owned());
        assert!(job.elapsed().unwrap() >= TimeDelta::zero());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        assert_eq!(JobStatus::Running.to_string(), "running");
    }
}
