//! Periodic maintenance driver
//!
//! One background loop ticks the engine's sweeps: callback timeouts,
//! unmatched callback retries, due status queries, stale job leases,
//! and terminal-job retention.

use crate::application::callback_matcher::CallbackMatcher;
use crate::application::job_queue::JobQueueService;
use crate::domain::job::JobType;
use crate::domain::repository::TsqRepository;
use crate::types::Payload;
use crate::EngineError;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Maintenance configuration
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between maintenance passes
    pub tick: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
        }
    }
}

/// Runs the periodic sweeps
pub struct MaintenanceRunner {
    matcher: Arc<CallbackMatcher>,
    queue: Arc<JobQueueService>,
    tsqs: Arc<dyn TsqRepository>,
    config: MaintenanceConfig,
}

impl MaintenanceRunner {
    /// Create a maintenance runner
    pub fn new(
        matcher: Arc<CallbackMatcher>,
        queue: Arc<JobQueueService>,
        tsqs: Arc<dyn TsqRepository>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            matcher,
            queue,
            tsqs,
            config,
        }
    }

    /// Run until the shutdown signal flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Maintenance runner started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(err) = self.tick().await {
                error!(error = %err, "Maintenance pass failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.tick) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Maintenance runner stopped");
    }

    /// One maintenance pass; each sweep runs even if an earlier one
    /// found nothing
    pub async fn tick(&self) -> Result<(), EngineError> {
        let now = Utc::now();

        let timed_out = self.matcher.sweep_timeouts(now).await?;
        let matched = self.matcher.retry_unmatched().await?;
        let tsqs_enqueued = self.enqueue_due_tsqs().await?;
        let reclaimed = self.queue.reclaim_stale().await?.len();
        let purged = self.queue.purge_terminal().await?;

        if timed_out + matched + tsqs_enqueued + reclaimed + purged > 0 {
            debug!(
                timed_out,
                matched, tsqs_enqueued, reclaimed, purged, "Maintenance pass"
            );
        }

        Ok(())
    }

    /// Enqueue an execution job for every due status query, and clear
    /// the due time so the next pass does not enqueue it twice
    async fn enqueue_due_tsqs(&self) -> Result<usize, EngineError> {
        let due = self.tsqs.due(Utc::now()).await?;
        let count = due.len();

        for mut tsq in due {
            self.queue
                .enqueue(
                    JobType::ExecuteTsq,
                    Payload::new(json!({
                        "tsq_id": tsq.id.0,
                        "instance_id": tsq.instance_id.0,
                    })),
                    1,
                )
                .await?;
            tsq.next_retry_at = None;
            self.tsqs.save(&tsq).await?;
        }

        Ok(count)
    }
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::*;
    use crate::application::job_queue::JobQueueConfig;
    use crate::application::ports::TracingEventHandler;
    use crate::application::reversal_controller::{ReversalConfig, ReversalController};
    use crate::application::rules::ActionCodeRules;
    use crate::application::testing::{harness, Harness, ScriptedGateway};
    use crate::domain::ids::InstanceId;
    use crate::domain::repository::JobRepository;
    use crate::domain::tsq::TsqRequest;
    use serde_json::json as j;

    fn runner(h: &Harness) -> MaintenanceRunner {
        let coordinator = Arc::new(h.coordinator.clone());
        let reversal_controller = Arc::new(ReversalController::new(
            h.reversals.clone(),
            h.instances.clone(),
            h.executions.clone(),
            h.callbacks.clone(),
            h.gateway.clone(),
            coordinator.clone(),
            ActionCodeRules::default(),
            ReversalConfig::default(),
        ));
        let matcher = Arc::new(CallbackMatcher::new(
            h.callbacks.clone(),
            h.executions.clone(),
            h.reversals.clone(),
            coordinator,
            reversal_controller,
            Arc::new(TracingEventHandler),
            ActionCodeRules::default(),
        ));
        let queue = Arc::new(JobQueueService::new(
            h.jobs.clone(),
            JobQueueConfig::default(),
        ));
        MaintenanceRunner::new(matcher, queue, h.tsqs.clone(), MaintenanceConfig::default())
    }

    #[tokio::test]
    async fn test_due_tsq_enqueued_once() {
        let h = harness(ScriptedGateway::new(vec![]));
        let runner = runner(&h);

        let tsq = TsqRequest::new(InstanceId("inst-1".to_string()), "timeout".to_string(), 3);
        h.tsqs.save(&tsq).await.unwrap();

        runner.tick().await.unwrap();
        // The pass consumed the due time; a second pass enqueues nothing
        runner.tick().await.unwrap();

        let claimed = h.jobs.claim("w", 10).await.unwrap();
        let tsq_jobs: Vec<_> = claimed
            .iter()
            .filter(|job| job.job_type == JobType::ExecuteTsq)
            .collect();
        assert_eq!(tsq_jobs.len(), 1);
        assert_eq!(
            tsq_jobs[0].payload.get_str("tsq_id").unwrap(),
            tsq.id.0.as_str()
        );
        assert_eq!(
            tsq_jobs[0].payload.as_value()["instance_id"],
            j!("inst-1")
        );
    }

    #[tokio::test]
    async fn test_empty_tick_is_harmless() {
        let h = harness(ScriptedGateway::new(vec![]));
        let runner = runner(&h);
        runner.tick().await.unwrap();
    }
}
