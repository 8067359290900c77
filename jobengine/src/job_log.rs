//! Per-job log streams.
//!
//! Every job gets its own [`JobLog`], opened from the engine's [`JobLogFactory`] when the job
//! starts running. A job log is a `tracing` subscriber: while a task executes it is the default
//! subscriber, so tasks log with the usual `tracing` macros and keep their structured fields.
//!
//! [`FileJobLogs`] writes one text file per job into a directory through a non-blocking writer.
//! [`DiscardJobLogs`] opens no file, and job events go to whatever subscriber the application
//! installed.
use std::{
    fmt,
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;

use crate::job::{Job, JobId};

#[derive(Debug, Error)]
pub enum JobLogError {
    #[error("Failed to access job log at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Creates and removes job log artifacts.
pub trait JobLogFactory: Send + Sync {
    /// Open the log for a job about to run.
    fn open(&self, job_id: JobId) -> Result<JobLog, JobLogError>;

    /// Remove the log artifact of a job that is being swept.
    fn remove(&self, job: &Job) -> Result<(), JobLogError>;
}

/// Writes `job-<id>.log` files into a directory.
#[derive(Debug, Clone)]
pub struct FileJobLogs {
    dir: PathBuf,
    max_level: tracing::Level,
}

impl FileJobLogs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_level: tracing::Level::INFO,
        }
    }

    pub fn with_max_level(self, max_level: tracing::Level) -> Self {
        Self { max_level, ..self }
    }

    pub fn path_for(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("job-{}.log", u64::from(job_id)))
    }
}

impl JobLogFactory for FileJobLogs {
    fn open(&self, job_id: JobId) -> Result<JobLog, JobLogError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| JobLogError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(job_id);
        let file = File::create(&path).map_err(|source| JobLogError::Io {
            path: path.clone(),
            source,
        })?;

        let (writer, guard) = tracing_appender::non_blocking(file);
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
            .with_max_level(self.max_level)
            .finish();

        Ok(JobLog {
            path: Some(path),
            dispatch: Some(Dispatch::new(subscriber)),
            guard: Some(Arc::new(guard)),
        })
    }

    fn remove(&self, job: &Job) -> Result<(), JobLogError> {
        let Some(path) = job.log_path.as_ref() else {
            return Ok(());
        };
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(JobLogError::Io {
                path: path.clone(),
                source,
            }),
        }
    }
}

/// Opens no files; job events go to the application's subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardJobLogs;

impl JobLogFactory for DiscardJobLogs {
    fn open(&self, _job_id: JobId) -> Result<JobLog, JobLogError> {
        Ok(JobLog::discard())
    }

    fn remove(&self, _job: &Job) -> Result<(), JobLogError> {
        Ok(())
    }
}

/// Handle to the log stream of a single job.
///
/// Clones share the same subscriber. Buffered lines are flushed once the last clone is dropped.
#[derive(Clone, Default)]
pub struct JobLog {
    path: Option<PathBuf>,
    dispatch: Option<Dispatch>,
    guard: Option<Arc<WorkerGuard>>,
}

impl JobLog {
    pub fn discard() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The subscriber job events should be dispatched to.
    ///
    /// Hand this to nested work spawned by a task, for example with
    /// [`tracing::instrument::WithSubscriber::with_subscriber`], to keep its events in the job log.
    pub fn dispatch(&self) -> Dispatch {
        match &self.dispatch {
            Some(dispatch) => dispatch.clone(),
            None => tracing::dispatcher::get_default(Dispatch::clone),
        }
    }

    /// Run `f` with this job's log as the default subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }
}

impl fmt::Debug for JobLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLog")
            .field("path", &self.path)
            .field("enabled", &self.dispatch.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn file_logs_keep_structured_fields() {
        let dir = tempfile::tempdir().unwrap();
        let logs = FileJobLogs::new(dir.path().join("jobs"));
        let log = logs.open(7.into()).unwrap();
        let path = log.path().unwrap().to_path_buf();
        assert_eq!(path, logs.path_for(7.into()));

        log.in_scope(|| tracing::info!(tracks = 12, "scanning library"));
        log.clone()
            .in_scope(|| tracing::error!(device = "ipod", "disk went away"));
        tracing::info!("not part of the job");
        log.in_scope(|| tracing::debug!("below the job log level"));
        drop(log);

        let contents = std::fs::read_to_string(path).unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2, "{contents}");
        assert!(lines[0].contains("INFO"));
        assert!(lines[0].contains("scanning library tracks=12"));
        assert!(lines[1].contains("ERROR"));
        assert!(lines[1].contains("disk went away device=\"ipod\""));
    }

    #[test]
    fn max_level_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let logs = FileJobLogs::new(dir.path()).with_max_level(tracing::Level::DEBUG);
        let log = logs.open(1.into()).unwrap();
        let path = log.path().unwrap().to_path_buf();

        log.in_scope(|| tracing::debug!("reading tags"));
        drop(log);

        assert!(std::fs::read_to_string(path)
            .unwrap()
            .contains("reading tags"));
    }

    #[test]
    fn file_logs_remove_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let logs = FileJobLogs::new(dir.path());
        let log = logs.open(3.into()).unwrap();
        let job = Job {
            log_path: log.path().map(Path::to_path_buf),
            ..Job::raw_job()
        };
        drop(log);

        assert!(job.log_path.as_ref().unwrap().exists());
        logs.remove(&job).unwrap();
        assert!(!job.log_path.as_ref().unwrap().exists());
        // Removing twice is fine.
        logs.remove(&job).unwrap();
    }

    #[test]
    fn discard_has_no_path() {
        let log = DiscardJobLogs.open(1.into()).unwrap();
        assert_eq!(log.in_scope(|| 42), 42);
        assert!(log.path().is_none());
    }
}
