//! Progress reporting from a running task back to the engine.
//!
//! A task never touches the job registry directly. It pushes `(percent, message)` pairs into a
//! bounded channel and the job runner drains them into the registry. Reporting never waits: when
//! the buffer is full the update is dropped, as a later one will supersede it anyway.
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::job::JobId;

/// A single progress event emitted by a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub message: String,
}

/// Fire-and-forget handle for reporting progress of one job.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    sender: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    /// Report the current progress. Values above 100 are clamped.
    pub fn report(&self, percent: u8, message: impl Into<String>) {
        let update = ProgressUpdate {
            percent: percent.min(100),
            message: message.into(),
        };
        match self.sender.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => tracing::trace!(
                job_id = %self.job_id,
                percent = update.percent,
                "Progress buffer full, dropping update"
            ),
            Err(TrySendError::Closed(_)) => tracing::trace!(
                job_id = %self.job_id,
                "Progress reported after the job finished"
            ),
        }
    }
}

pub(crate) fn channel(
    job_id: JobId,
    capacity: usize,
) -> (ProgressReporter, mpsc::Receiver<ProgressUpdate>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (ProgressReporter { job_id, sender }, receiver)
}
