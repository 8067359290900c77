use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;
use jobengine::prelude::*;

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let log_dir = std::env::temp_dir().join("jobengine-demo");
    let config = EngineConfig::default()
        .with_log_dir(log_dir.clone())
        .with_notifier(
            NotifierConfig::new("echo \"[notify] {{ .Name }} {{ .Status }} after {{ .Duration }}\"")
                .with_job_types(["import"]),
        );
    let engine = JobEngine::new(config)
        .with_task("import", ImportTask)
        .with_task("sync", SyncTask)
        .with_pruner(
            PrunerConfig::new(cron::Schedule::from_str("0 * * * * *").unwrap())
                .with_max_age(TimeDelta::minutes(5)),
        );

    let first = engine
        .job("import")
        .with_name("Import ~/Music")
        .with_metadata_entry("path", "~/Music")
        .start()
        .unwrap();
    let second = engine
        .job("import")
        .with_name("Import /mnt/nas")
        .with_metadata_entry("path", "/mnt/nas")
        .start()
        .unwrap();
    let sync = engine.job("sync").with_name("Sync devices").start().unwrap();
    println!("Started jobs {first}, {second} and {sync}, logs in {}", log_dir.display());

    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.cancel_job(sync).unwrap();

    loop {
        let jobs = engine.list_jobs().unwrap();
        for job in &jobs {
            println!(
                "{:>10} {:<16} {:>3}% {}",
                job.status, job.name, job.progress, job.message
            );
        }
        println!();
        if jobs.iter().all(|job| job.status.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    // Give the notifier a moment to print.
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.graceful_shutdown().await.unwrap();
}

struct ImportTask;

#[async_trait]
impl Task for ImportTask {
    fn required_metadata_keys(&self) -> &[&'static str] {
        &["path"]
    }

    async fn execute(&self, ctx: &JobContext, job: &Job) -> ExecutionResult {
        let path = job.metadata_str("path").unwrap_or_default();
        let total = 10u64;
        let mut unreadable = 0;
        for track in 1..=total {
            if ctx.is_cancelled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(60)).await;
            if track % 7 == 0 {
                unreadable += 1;
                tracing::warn!(path, track, "track is unreadable");
            } else {
                tracing::info!(path, track, "imported track");
            }
            ctx.report((track * 100 / total) as u8, format!("Imported {track} of {total}"));
        }

        let result = if unreadable > 0 {
            ExecutionResult::from(TaskError::partial(
                total - unreadable,
                total,
                "some tracks were unreadable",
            ))
        } else {
            ExecutionResult::done()
        };
        result.with_stat("imported", total - unreadable)
    }
}

struct SyncTask;

#[async_trait]
impl Task for SyncTask {
    async fn execute(&self, ctx: &JobContext, _job: &Job) -> ExecutionResult {
        let mut synced: u8 = 0;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(50)) => {
                    synced = synced.saturating_add(1);
                    ctx.report(synced.min(99), format!("Synced {synced} devices"));
                }
            }
        }
        ExecutionResult::done().with_stat("synced", synced)
    }

    fn on_cancel(&self, job: &Job) {
        println!("Stopping {}", job.name);
    }
}
