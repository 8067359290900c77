//! Retention of finished jobs.
//!
//! Finished jobs stay queryable until they are swept. [`crate::JobEngine::sweep`] removes every
//! completed, failed or cancelled job not updated within a given age, along with its log file.
//! Pending and running jobs are never touched, however old.
//!
//! Sweeping can be driven by whatever maintenance loop the embedding service already has, or the
//! engine can run it on a cron schedule via [`PrunerConfig`]:
//!
//! ```no_run
//! # use std::str::FromStr;
//! # use chrono::TimeDelta;
//! # use jobengine::{config::EngineConfig, pruner::PrunerConfig, JobEngine};
//! # async fn setup() {
//! // Every hour, drop jobs that finished more than three days ago.
//! let engine = JobEngine::new(EngineConfig::default()).with_pruner(
//!     PrunerConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
//!         .with_max_age(TimeDelta::days(3)),
//! );
//! # }
//! ```
use std::sync::Arc;

use chrono::TimeDelta;

pub(crate) mod runner;

use crate::{job::registry::Registry, job_log::JobLogFactory, JobEngineError};

/// When the pruner should run and how old finished jobs may get.
#[derive(Debug, Clone)]
pub struct PrunerConfig {
    schedule: cron::Schedule,
    max_age: TimeDelta,
}

impl PrunerConfig {
    /// Construct a new instance of [`PrunerConfig`] scheduled to run on the provided cron
    /// schedule, keeping finished jobs for a week.
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            max_age: TimeDelta::days(7),
        }
    }

    pub fn with_max_age(self, max_age: TimeDelta) -> Self {
        Self { max_age, ..self }
    }

    pub fn max_age(&self) -> TimeDelta {
        self.max_age
    }
}

#[derive(Clone)]
pub(crate) struct Sweeper {
    registry: Registry,
    logs: Arc<dyn JobLogFactory>,
}

impl Sweeper {
    pub(crate) fn new(registry: Registry, logs: Arc<dyn JobLogFactory>) -> Self {
        Self { registry, logs }
    }

    pub(crate) fn sweep(&self, max_age: TimeDelta) -> Result<usize, JobEngineError> {
        let removed = self.registry.sweep(max_age)?;
        for job in &removed {
            if let Err(err) = self.logs.remove(job) {
                tracing::warn!(?err, job_id = %job.id, "Failed to remove log of job {}: {err}", job.id);
            }
        }
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "Swept {} finished jobs", removed.len());
        }
        Ok(removed.len())
    }
}
