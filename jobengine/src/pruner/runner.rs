use std::{ops::Sub, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{PrunerConfig, Sweeper};

pub(crate) struct PrunerRunner {
    config: PrunerConfig,
    sweeper: Sweeper,
}

impl PrunerRunner {
    pub fn new(sweeper: Sweeper, config: PrunerConfig) -> Self {
        Self { sweeper, config }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn({
            async move {
                loop {
                    let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                        tracing::warn!("No future scheduled time for the job pruner");
                        break;
                    };
                    let delay = next
                        .sub(Utc::now())
                        .sub(TimeDelta::milliseconds(10))
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.prune();
                            // Make sure the same scheduled instant is not picked up twice.
                            if let Ok(delay) = (next - Utc::now()).to_std() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        _ = cancellation_token.cancelled() => {
                            tracing::debug!("Shutting down the job pruner");
                            break;
                        },
                    }
                }
            }
        })
    }

    fn prune(&self) {
        if let Err(err) = self.sweeper.sweep(self.config.max_age) {
            tracing::error!(?err, "Failed to clean up jobs with error {err}")
        }
    }
}

#[cfg(test)]
mod test {
    use std::{str::FromStr, sync::Arc};

    use super::*;
    use crate::{
        job::{
            registry::{Outcome, Registry},
            Metadata,
        },
        job_log::DiscardJobLogs,
    };

    fn registry_with_finished_job() -> Registry {
        let registry = Registry::new();
        let (id, _) = registry
            .insert("scan".to_owned(), "scan".to_owned(), Metadata::new())
            .unwrap();
        registry
            .finish(
                id,
                Outcome::Completed {
                    message: "Completed".to_owned(),
                },
                Metadata::new(),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn runs_on_schedule() {
        let registry = registry_with_finished_job();
        let config = PrunerConfig::new(cron::Schedule::from_str("* * * * * *").unwrap())
            .with_max_age(TimeDelta::zero());
        let sweeper = Sweeper::new(registry.clone(), Arc::new(DiscardJobLogs));
        let token = CancellationToken::new();
        let handle = PrunerRunner::new(sweeper, config).spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(registry.list().unwrap().is_empty());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let registry = registry_with_finished_job();
        let config = PrunerConfig::new(cron::Schedule::from_str("0 0 0 1 1 *").unwrap())
            .with_max_age(TimeDelta::zero());
        let sweeper = Sweeper::new(registry.clone(), Arc::new(DiscardJobLogs));
        let token = CancellationToken::new();
        let handle = PrunerRunner::new(sweeper, config).spawn(token.clone());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
    }
}
