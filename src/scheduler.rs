//! Periodic certificate renewal.

use crate::orchestrator::Orchestrator;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Shortest interval between two sweeps.
const MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Runs [`Orchestrator::renew_sweep`] on a fixed interval, starting immediately.
pub struct RenewalScheduler {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    lookahead_days: Option<u32>,
}

impl RenewalScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval: interval.max(MIN_INTERVAL),
            lookahead_days: None,
        }
    }

    /// Sweep with a lookahead other than the configured `renew_before_days`.
    #[must_use]
    pub fn with_lookahead(mut self, days: u32) -> Self {
        self.lookahead_days = Some(days);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sweep every interval until `shutdown` completes. Returns the number of sweeps run.
    pub async fn run<S>(self, shutdown: S) -> usize
    where
        S: Future<Output = ()>,
    {
        tracing::info!(
            "renewal scheduler started, sweeping every {}s",
            self.interval.as_secs()
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut sweeps = 0;
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    let report = self
                        .orchestrator
                        .renew_sweep(self.lookahead_days, false)
                        .await;
                    sweeps += 1;
                    for failure in &report.failed {
                        tracing::error!("renewal of {} failed: {}", failure.domain, failure.reason);
                    }
                }
            }
        }
        tracing::info!("renewal scheduler stopped after {sweeps} sweeps");
        sweeps
    }
}
