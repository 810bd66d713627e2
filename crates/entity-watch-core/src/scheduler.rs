/// Periodic poll driver for a watch registry
use anyhow::{Context, Result};
use entity_watch_config::config::PollConfig;
use entity_watch_engine::{PollResults, WatchRegistry};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info};

/// Configuration for the poll scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Seconds between poll cycles
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl From<&PollConfig> for SchedulerConfig {
    fn from(config: &PollConfig) -> Self {
        Self {
            interval_secs: config.interval_secs,
        }
    }
}

/// Runs `poll_all` on a fixed interval.
///
/// Polls are blocking I/O, so each cycle runs on the blocking thread pool.
/// A failed cycle is logged and the next tick retries from the stored cursors.
#[derive(Clone)]
pub struct PollScheduler {
    registry: Arc<WatchRegistry>,
    config: SchedulerConfig,
}

impl PollScheduler {
    /// Create a new scheduler for `registry`.
    pub fn new(registry: Arc<WatchRegistry>, config: SchedulerConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    /// Run one poll cycle for every registered entity.
    pub async fn run_once(&self) -> Result<PollResults> {
        let registry = self.registry.clone();
        let results = tokio::task::spawn_blocking(move || registry.poll_all())
            .await
            .context("Poll task panicked")??;
        Ok(results)
    }

    /// Poll until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Poll until `shutdown` completes. An in-flight cycle finishes first.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        info!(
            "Starting poll scheduler for {} entities every {} seconds",
            self.registry.entities().len(),
            period.as_secs()
        );

        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Poll scheduler stopping");
                    return Ok(());
                }
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(results) => debug!(
                            entities = results.entities().count(),
                            changes = results.total(),
                            "Poll cycle complete"
                        ),
                        Err(e) => error!("Poll cycle failed: {:#}", e),
                    }
                }
            }
        }
    }
}
