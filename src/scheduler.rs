use std::{sync::Arc, time::Duration};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::{sync::Notify, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    core::types::DeploymentResult,
    orchestrator::{Orchestrator, OrchestratorError},
};

/// Something that can run one blocking pass.
pub trait PassRunner: Send + Sync + 'static {
    fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeploymentResult>, OrchestratorError>;
}

impl PassRunner for Orchestrator {
    fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeploymentResult>, OrchestratorError> {
        self.run_pass(cancel, Utc::now())
    }
}

/// Background loop: one pass at start-up, then one per interval or per
/// explicit trigger. Passes run on the blocking pool and never overlap;
/// triggers that arrive during a pass collapse into a single follow-up pass.
pub struct Scheduler {
    runner: Arc<dyn PassRunner>,
    interval: Duration,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn PassRunner>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            runner,
            interval: interval.max(Duration::from_secs(1)),
            trigger: Arc::new(Notify::new()),
            cancel,
        }
    }

    /// Handle for requesting an immediate pass.
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "[scheduler] started, interval {}s",
            self.interval.as_secs()
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => debug!("[scheduler] interval elapsed"),
                _ = self.trigger.notified() => info!("[scheduler] pass triggered"),
            }

            let runner = self.runner.clone();
            let cancel = self.cancel.clone();
            match tokio::task::spawn_blocking(move || runner.run_once(&cancel)).await {
                Ok(Ok(results)) => {
                    for result in results.iter().filter(|r| !r.success) {
                        warn!("[scheduler] {}: {}", result.domain, result.message);
                    }
                }
                Ok(Err(err)) => warn!("[scheduler] pass failed: {}", err),
                Err(err) => error!("[scheduler] pass aborted: {}", err),
            }
        }
        info!("[scheduler] stopped");
    }
}
