use serde_json::Value;

use crate::{JobEngine, JobEngineError};

use super::{JobId, Metadata};

/// Convenience for assembling a job request, obtained from [`JobEngine::job`].
///
/// ```no_run
/// # use jobengine::{config::EngineConfig, JobEngine};
/// # fn start(engine: &JobEngine) -> Result<(), jobengine::JobEngineError> {
/// let job_id = engine
///     .job("import")
///     .with_name("Import ~/Music")
///     .with_metadata_entry("path", "/home/me/Music")
///     .start()?;
/// # Ok(())
/// # }
/// ```
#[must_use = "the job is only created once `start` is called"]
pub struct JobBuilder<'a> {
    engine: &'a JobEngine,
    job_type: String,
    name: Option<String>,
    metadata: Metadata,
}

impl<'a> JobBuilder<'a> {
    pub(crate) fn new(engine: &'a JobEngine, job_type: impl Into<String>) -> Self {
        Self {
            engine,
            job_type: job_type.into(),
            name: None,
            metadata: Metadata::new(),
        }
    }

    /// Defaults to the job type.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn start(self) -> Result<JobId, JobEngineError> {
        let name = self.name.unwrap_or_else(|| self.job_type.clone());
        self.engine.start_job(&self.job_type, name, self.metadata)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use crate::{config::EngineConfig, task::test::SimpleTask};

    use super::*;

    #[tokio::test]
    async fn builds_job() {
        let engine = JobEngine::new(EngineConfig::default()).with_task("scan", SimpleTask);
        let mut extra = Metadata::new();
        extra.insert("dry_run".to_owned(), json!(true));

        let id = engine
            .job("scan")
            .with_name("Scan library")
            .with_metadata_entry("path", "/music")
            .with_metadata(extra)
            .start()
            .unwrap();

        let job = engine.get_job(id).unwrap().unwrap();
        assert_eq!(job.name, "Scan library");
        assert_eq!(job.job_type, "scan");
        assert_eq!(job.metadata.get("path"), Some(&json!("/music")));
        assert_eq!(job.metadata.get("dry_run"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn name_defaults_to_type() {
        let engine = JobEngine::new(EngineConfig::default()).with_task("scan", SimpleTask);
        let id = engine.job("scan").start().unwrap();
        assert_eq!(engine.get_job(id).unwrap().unwrap().name, "scan");
    }

    #[tokio::test]
    async fn unknown_type_errors() {
        let engine = JobEngine::new(EngineConfig::default());
        assert_matches!(
            engine.job("scan").start(),
            Err(JobEngineError::NoHandler(job_type)) if job_type == "scan"
        );
    }
}
