//! Post-completion notifications.
//!
//! Once a job reaches a terminal state the engine can run a user supplied shell command, for
//! example to ping a chat webhook. The command is a template rendered from the job outcome (see
//! [`template`] for the placeholder syntax), with the following fields:
//!
//! | field      | value                                                              |
//! |------------|--------------------------------------------------------------------|
//! | `id`       | numeric job id                                                     |
//! | `name`     | job name                                                           |
//! | `type`     | job type                                                           |
//! | `status`   | `completed`, `failed` or `cancelled`                               |
//! | `message`  | the task's `msg` result field if it returned one, else job message |
//! | `duration` | elapsed running time, e.g. `1m 5s`                                 |
//!
//! The same values are exported to the command's environment as `JOB_ID`, `JOB_NAME`,
//! `JOB_TYPE`, `JOB_STATUS`, `JOB_MESSAGE` and `JOB_DURATION`.
//!
//! Notifications are best effort. Rendering or execution failures are logged and never affect
//! the job, and the command runs detached from the job runner so a slow webhook cannot hold up
//! the next job.
use std::{process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;
use serde::Deserialize;
use thiserror::Error;
use tokio::{process::Command, task::JoinHandle};

use crate::job::Job;

pub mod template;

use template::TemplateError;

/// Job types value matching every type.
pub const WILDCARD: &str = "*";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub enabled: bool,
    /// Job types that trigger a notification. [`WILDCARD`] matches all of them.
    pub job_types: Vec<String>,
    /// Command template, run through `sh -c`.
    pub command: String,
    /// Hard limit after which the command is killed.
    #[serde(rename = "timeout_secs", deserialize_with = "deserialize_secs")]
    pub timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            job_types: Vec::new(),
            command: String::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl NotifierConfig {
    /// An enabled configuration firing `command` for every job type.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            enabled: true,
            job_types: vec![WILDCARD.to_owned()],
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_job_types<T: Into<String>>(self, job_types: impl IntoIterator<Item = T>) -> Self {
        Self {
            job_types: job_types.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub fn disabled(self) -> Self {
        Self {
            enabled: false,
            ..self
        }
    }

    /// Whether a job of `job_type` should trigger a notification.
    pub fn allows(&self, job_type: &str) -> bool {
        self.enabled
            && self
                .job_types
                .iter()
                .any(|allowed| allowed == WILDCARD || allowed == job_type)
    }
}

fn deserialize_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("Failed to render notification command")]
    Template(#[from] TemplateError),
    #[error("Failed to run notification command")]
    Spawn(#[source] std::io::Error),
    #[error("Notification command timed out after {0:?}")]
    Timeout(Duration),
}

/// Captured result of a notification command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a rendered notification command.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        env: &[(&'static str, String)],
        timeout: Duration,
    ) -> Result<CommandOutput, NotifierError>;
}

/// Runs commands through `sh -c`, inheriting the engine's environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellCommandRunner;

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(
        &self,
        command: &str,
        env: &[(&'static str, String)],
        timeout: Duration,
    ) -> Result<CommandOutput, NotifierError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(env.iter().map(|(key, value)| (*key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(NotifierError::Spawn)?;

        // Dropping the child on timeout kills it.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| NotifierError::Timeout(timeout))?
            .map_err(NotifierError::Spawn)?;

        Ok(CommandOutput {
            code: output.status.code(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// The values a notification command can refer to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationFields {
    pub id: String,
    pub name: String,
    pub job_type: String,
    pub status: String,
    pub message: String,
    pub duration: String,
}

impl From<&Job> for NotificationFields {
    fn from(job: &Job) -> Self {
        Self {
            id: u64::from(job.id).to_string(),
            name: job.name.clone(),
            job_type: job.job_type.clone(),
            status: job.status.to_string(),
            message: job.metadata_str("msg").unwrap_or(&job.message).to_owned(),
            duration: job.elapsed().map(format_duration).unwrap_or_default(),
        }
    }
}

impl NotificationFields {
    pub fn get(&self, field: &str) -> Option<&str> {
        match field {
            "id" => Some(&self.id),
            "name" => Some(&self.name),
            "type" => Some(&self.job_type),
            "status" => Some(&self.status),
            "message" => Some(&self.message),
            "duration" => Some(&self.duration),
            _ => None,
        }
    }

    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        template::render(template, |field| self.get(field))
    }

    fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("JOB_ID", self.id.clone()),
            ("JOB_NAME", self.name.clone()),
            ("JOB_TYPE", self.job_type.clone()),
            ("JOB_STATUS", self.status.clone()),
            ("JOB_MESSAGE", self.message.clone()),
            ("JOB_DURATION", self.duration.clone()),
        ]
    }
}

/// Formats a duration as `1h 2m 3s`, falling back to milliseconds below one second.
pub fn format_duration(delta: TimeDelta) -> String {
    let total = delta.num_seconds().max(0);
    if total == 0 {
        return format!("{}ms", delta.num_milliseconds().max(0));
    }
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);
    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, _) => format!("{minutes}m {seconds}s"),
        _ => format!("{hours}h {minutes}m {seconds}s"),
    }
}

#[derive(Clone)]
pub(crate) struct Notifier {
    config: Arc<NotifierConfig>,
    runner: Arc<dyn CommandRunner>,
}

impl Notifier {
    pub(crate) fn new(config: NotifierConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config: Arc::new(config),
            runner,
        }
    }

    /// Fire the notification for a finished job, if configured to.
    ///
    /// Returns the handle of the detached command, mostly useful in tests.
    pub(crate) fn notify(&self, job: &Job) -> Option<JoinHandle<()>> {
        if !self.config.allows(&job.job_type) {
            return None;
        }

        let job_id = job.id;
        let fields = NotificationFields::from(job);
        let command = match fields.render(&self.config.command) {
            Ok(command) => command,
            Err(err) => {
                let err = NotifierError::from(err);
                tracing::error!(?err, %job_id, "Not notifying for job {job_id}: {err}");
                return None;
            }
        };

        let runner = self.runner.clone();
        let timeout = self.config.timeout;
        Some(tokio::spawn(async move {
            match runner.run(&command, &fields.env(), timeout).await {
                Ok(output) if output.success => {
                    tracing::debug!(%job_id, stdout = %output.stdout, "Notification sent for job {job_id}")
                }
                Ok(output) => tracing::warn!(
                    %job_id,
                    code = ?output.code,
                    stderr = %output.stderr,
                    "Notification command for job {job_id} exited unsuccessfully"
                ),
                Err(err) => {
                    tracing::error!(?err, %job_id, "Notification for job {job_id} failed: {err}")
                }
            }
        }))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::job::JobStatus;

    /// Records commands instead of running them.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingRunner {
        pub(crate) commands: Arc<Mutex<Vec<String>>>,
        pub(crate) fail: bool,
    }

    impl RecordingRunner {
        pub(crate) fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(
            &self,
            command: &str,
            _env: &[(&'static str, String)],
            timeout: Duration,
        ) -> Result<CommandOutput, NotifierError> {
            self.commands.lock().unwrap().push(command.to_owned());
            if self.fail {
                return Err(NotifierError::Timeout(timeout));
            }
            Ok(CommandOutput {
                code: Some(0),
                success: true,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn finished_job(job_type: &str) -> Job {
        let mut job = Job {
            job_type: job_type.to_owned(),
            name: "Nightly sync".to_owned(),
            ..Job::raw_job()
        };
        job.mark_running();
        job.mark_completed("Completed".to_owned());
        job
    }

    async fn notify(config: NotifierConfig, job: &Job) -> Vec<String> {
        let runner = RecordingRunner::default();
        let notifier = Notifier::new(config, Arc::new(runner.clone()));
        if let Some(handle) = notifier.notify(job) {
            handle.await.unwrap();
        }
        runner.commands()
    }

    #[tokio::test]
    async fn notifies_allowed_types() {
        let config = NotifierConfig::new("echo {{name}} {{status}}").with_job_types(["sync"]);
        assert_eq!(
            notify(config, &finished_job("sync")).await,
            vec!["echo Nightly sync completed"]
        );
    }

    #[tokio::test]
    async fn skips_other_types() {
        let config = NotifierConfig::new("echo {{name}}").with_job_types(["sync", "import"]);
        assert!(notify(config, &finished_job("lyrics")).await.is_empty());
    }

    #[tokio::test]
    async fn wildcard_matches_everything() {
        let config = NotifierConfig::new("echo {{type}}").with_job_types(["sync", WILDCARD]);
        assert_eq!(
            notify(config, &finished_job("lyrics")).await,
            vec!["echo lyrics"]
        );
    }

    #[tokio::test]
    async fn disabled_never_notifies() {
        let config = NotifierConfig::new("echo {{name}}").disabled();
        assert!(notify(config, &finished_job("sync")).await.is_empty());
        assert!(notify(NotifierConfig::default(), &finished_job("sync"))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn render_failure_skips_command() {
        let config = NotifierConfig::new("echo {{owner}}");
        assert!(notify(config, &finished_job("sync")).await.is_empty());
    }

    #[tokio::test]
    async fn runner_failure_is_contained() {
        let runner = RecordingRunner {
            fail: true,
            ..Default::default()
        };
        let notifier = Notifier::new(NotifierConfig::new("false"), Arc::new(runner.clone()));
        notifier.notify(&finished_job("sync")).unwrap().await.unwrap();
        assert_eq!(runner.commands(), vec!["false"]);
    }

    #[test]
    fn fields_prefer_task_message() {
        let mut job = finished_job("sync");
        assert_eq!(NotificationFields::from(&job).message, "Completed");

        job.metadata
            .insert("msg".to_owned(), json!("Copied 40 tracks to phone"));
        let fields = NotificationFields::from(&job);
        assert_eq!(fields.message, "Copied 40 tracks to phone");
        assert_eq!(fields.status, "completed");
        assert_eq!(fields.job_type, "sync");
        assert_eq!(fields.id, "0");
    }

    #[test]
    fn fields_for_failed_job() {
        let mut job = Job::raw_job();
        job.mark_running();
        job.mark_failed("boom".to_owned());
        let fields = NotificationFields::from(&job);
        assert_eq!(fields.status, JobStatus::Failed.to_string());
        assert_eq!(fields.message, "Failed: boom");
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(TimeDelta::milliseconds(350)), "350ms");
        assert_eq!(format_duration(TimeDelta::seconds(42)), "42s");
        assert_eq!(format_duration(TimeDelta::seconds(65)), "1m 5s");
        assert_eq!(format_duration(TimeDelta::seconds(3725)), "1h 2m 5s");
        assert_eq!(format_duration(TimeDelta::seconds(-3)), "0ms");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: NotifierConfig = serde_json::from_value(json!({
            "enabled": true,
            "job_types": ["*"],
            "command": "notify {{name}}",
            "timeout_secs": 5
        }))
        .unwrap();
        assert_eq!(
            config,
            NotifierConfig::new("notify {{name}}").with_timeout(Duration::from_secs(5))
        );

        let config: NotifierConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config, NotifierConfig::default());
    }

    #[tokio::test]
    async fn shell_runner_captures_output_and_env() {
        let output = ShellCommandRunner
            .run(
                "printf '%s' \"$JOB_NAME\"",
                &[("JOB_NAME", "Nightly sync".to_owned())],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "Nightly sync");
    }

    #[tokio::test]
    async fn shell_runner_reports_exit_code() {
        let output = ShellCommandRunner
            .run("echo oops >&2; exit 3", &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stderr, "oops\n");
    }

    #[tokio::test]
    async fn shell_runner_kills_on_timeout() {
        let result = ShellCommandRunner
            .run("sleep 5", &[], Duration::from_millis(50))
            .await;
        assert_matches!(result, Err(NotifierError::Timeout(_)));
    }
}
