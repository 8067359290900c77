//! Engine configuration.
//!
//! Loading is left to the embedding application; everything here deserializes with serde and
//! falls back to defaults for missing keys, so it can be nested in a larger config file.
use std::path::PathBuf;

use serde::Deserialize;

use crate::notifier::NotifierConfig;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory for per-job log files. Job output is discarded when unset.
    pub log_dir: Option<PathBuf>,
    /// Capacity of each job's progress channel. Reports beyond it are dropped until the engine
    /// catches up.
    pub progress_buffer: usize,
    pub notifier: NotifierConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            progress_buffer: Self::DEFAULT_PROGRESS_BUFFER,
            notifier: NotifierConfig::default(),
        }
    }
}

impl EngineConfig {
    const DEFAULT_PROGRESS_BUFFER: usize = 64;

    pub fn with_log_dir(self, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: Some(log_dir.into()),
            ..self
        }
    }

    pub fn with_progress_buffer(self, progress_buffer: usize) -> Self {
        Self {
            progress_buffer,
            ..self
        }
    }

    pub fn with_notifier(self, notifier: NotifierConfig) -> Self {
        Self { notifier, ..self }
    }
}
