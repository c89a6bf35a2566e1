// src/scheduler.rs
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::Pipeline;

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    pub interval: Duration,
    /// Run once immediately instead of waiting a full interval.
    pub run_on_start: bool,
}

/// Spawn the periodic run loop. Cancelling `shutdown` stops it after the
/// run in flight (if any) has finished.
pub fn spawn_scheduler(pipeline: Pipeline, cfg: SchedulerCfg, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        // a slow run must not trigger a burst of catch-up runs
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !cfg.run_on_start {
            ticker.tick().await;
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = pipeline.run_once().await;
            tracing::info!(
                target: "scheduler",
                run_id = %report.run_id,
                run_ts = %report.run_timestamp,
                sources = report.sources.len(),
                processed = report.processed(),
                failed = report.failed(),
                "scheduled run complete"
            );
        }
        tracing::info!(target: "scheduler", "scheduler stopped");
    })
}
