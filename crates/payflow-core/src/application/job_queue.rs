//! The durable job queue and its workers
//!
//! Workers atomically claim a bounded batch of due jobs under a lease,
//! execute them, and complete or reschedule with linear backoff. A job
//! that exhausts its attempts goes terminal and its failure is reflected
//! onto the owning flow instance explicitly; nothing is thrown past the
//! queue boundary.

use crate::application::coordinator::ExecutionCoordinator;
use crate::application::reversal_controller::ReversalController;
use crate::application::tsq_controller::TsqController;
use crate::domain::ids::{InstanceId, JobId, ReversalId, TsqId};
use crate::domain::job::{Job, JobType};
use crate::domain::repository::JobRepository;
use crate::types::Payload;
use crate::EngineError;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Queue configuration
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Jobs claimed per poll
    pub batch_size: usize,

    /// Sleep between empty polls
    pub poll_interval: Duration,

    /// Linear backoff unit; attempt `n` reschedules after `n × unit`
    pub retry_backoff: Duration,

    /// Lease age after which a worker is presumed dead
    pub lease_timeout: Duration,

    /// How long terminal jobs are kept before purging
    pub retention: Duration,

    /// Default attempts for enqueued jobs
    pub max_attempts: u32,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(500),
            retry_backoff: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(300),
            retention: Duration::from_secs(7 * 24 * 3600),
            max_attempts: 3,
        }
    }
}

/// What failing an attempt did with the job
#[derive(Debug, PartialEq, Eq)]
pub enum JobDisposition {
    /// Rescheduled with backoff
    Retried,
    /// Attempts exhausted; the job is permanently FAILED
    Exhausted,
}

/// Lease-based FIFO-with-priority queue over a `JobRepository`
pub struct JobQueueService {
    jobs: Arc<dyn JobRepository>,
    config: JobQueueConfig,
}

impl JobQueueService {
    /// Create a queue service
    pub fn new(jobs: Arc<dyn JobRepository>, config: JobQueueConfig) -> Self {
        Self { jobs, config }
    }

    /// Enqueue a job ready to run immediately
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: Payload,
        priority: i32,
    ) -> Result<JobId, EngineError> {
        let job = Job::new(job_type, payload, priority, self.config.max_attempts);
        let id = job.id.clone();
        self.jobs.save(&job).await?;
        debug!(job_id = %id, ?job_type, "Job enqueued");
        Ok(id)
    }

    /// Claim a batch of due jobs for a worker
    pub async fn claim(&self, worker_id: &str) -> Result<Vec<Job>, EngineError> {
        self.jobs.claim(worker_id, self.config.batch_size).await
    }

    /// Mark a claimed job done
    pub async fn complete(
        &self,
        mut job: Job,
        result: Option<Payload>,
    ) -> Result<(), EngineError> {
        job.complete(result);
        self.jobs.save(&job).await
    }

    /// Record a failed attempt: reschedule with linear backoff while
    /// attempts remain, otherwise go terminal
    pub async fn fail_attempt(
        &self,
        job: &mut Job,
        error: &str,
    ) -> Result<JobDisposition, EngineError> {
        if job.attempts_remaining() {
            let unit = ChronoDuration::from_std(self.config.retry_backoff)
                .unwrap_or_else(|_| ChronoDuration::seconds(30));
            let delay = unit * job.attempt as i32;
            job.reschedule(delay, error);
            self.jobs.save(job).await?;

            debug!(
                job_id = %job.id,
                attempt = job.attempt,
                max_attempts = job.max_attempts,
                "Job rescheduled after failure"
            );
            Ok(JobDisposition::Retried)
        } else {
            job.fail(error);
            self.jobs.save(job).await?;

            warn!(
                job_id = %job.id,
                attempts = job.attempt,
                error = %error,
                "Job failed permanently"
            );
            Ok(JobDisposition::Exhausted)
        }
    }

    /// Return jobs with expired leases to PENDING
    pub async fn reclaim_stale(&self) -> Result<Vec<JobId>, EngineError> {
        let threshold = ChronoDuration::from_std(self.config.lease_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let reclaimed = self.jobs.reclaim_stale(threshold, Utc::now()).await?;
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "Reclaimed jobs with stale leases");
        }
        Ok(reclaimed)
    }

    /// Purge terminal jobs past the retention window
    pub async fn purge_terminal(&self) -> Result<usize, EngineError> {
        let retention = ChronoDuration::from_std(self.config.retention)
            .unwrap_or_else(|_| ChronoDuration::days(7));
        self.jobs.purge_terminal_before(Utc::now() - retention).await
    }

    /// Poll sleep used by workers
    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }
}

/// One queue worker: polls, claims, dispatches
pub struct JobWorker {
    id: String,
    queue: Arc<JobQueueService>,
    coordinator: Arc<ExecutionCoordinator>,
    tsq: Arc<TsqController>,
    reversal: Arc<ReversalController>,
}

impl JobWorker {
    /// Create a worker with the given identity
    pub fn new(
        id: impl Into<String>,
        queue: Arc<JobQueueService>,
        coordinator: Arc<ExecutionCoordinator>,
        tsq: Arc<TsqController>,
        reversal: Arc<ReversalController>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            coordinator,
            tsq,
            reversal,
        }
    }

    /// Run until the shutdown signal flips; the in-flight batch is
    /// finished before exiting
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, "Job worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = match self.queue.claim(&self.id).await {
                Ok(batch) => batch,
                Err(error) => {
                    error!(worker = %self.id, %error, "Job claim failed");
                    Vec::new()
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.queue.poll_interval()) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for job in batch {
                self.process(job).await;
            }
        }

        info!(worker = %self.id, "Job worker stopped");
    }

    /// Process one claimed job end to end
    pub async fn process(&self, mut job: Job) {
        debug!(worker = %self.id, job_id = %job.id, job_type = ?job.job_type, "Processing job");

        match self.dispatch(&job).await {
            Ok(()) => {
                if let Err(error) = self.queue.complete(job, None).await {
                    error!(worker = %self.id, %error, "Failed to record job completion");
                }
            }
            Err(error) => {
                let message = error.to_string();
                let disposition = match self.queue.fail_attempt(&mut job, &message).await {
                    Ok(disposition) => disposition,
                    Err(save_error) => {
                        error!(worker = %self.id, %save_error, "Failed to record job failure");
                        return;
                    }
                };

                if disposition == JobDisposition::Exhausted {
                    self.reflect_exhaustion(&job, &message).await;
                }
            }
        }
    }

    async fn dispatch(&self, job: &Job) -> Result<(), EngineError> {
        match job.job_type {
            JobType::ExecuteFlow => {
                let instance_id = field(job, "instance_id")?;
                self.coordinator.execute(&InstanceId(instance_id)).await
            }
            JobType::ExecuteTsq => {
                let tsq_id = field(job, "tsq_id")?;
                self.tsq.execute(&TsqId(tsq_id)).await
            }
            JobType::ExecuteReversal => {
                let reversal_id = field(job, "reversal_id")?;
                self.reversal.execute(&ReversalId(reversal_id)).await
            }
        }
    }

    /// Reflect a permanently failed job onto the owning instance; job
    /// failures never die silently inside the queue
    async fn reflect_exhaustion(&self, job: &Job, error: &str) {
        let Some(instance_id) = job.payload.get_str("instance_id").map(str::to_string) else {
            warn!(job_id = %job.id, "Exhausted job carries no instance reference");
            return;
        };
        let instance_id = InstanceId(instance_id);
        let message = format!(
            "Job {} failed after {} attempts: {}",
            job.id, job.attempt, error
        );

        let outcome = match job.job_type {
            JobType::ExecuteReversal => {
                if let Some(reversal_id) = job.payload.get_str("reversal_id") {
                    let _ = self
                        .reversal
                        .mark_failed(&ReversalId(reversal_id.to_string()))
                        .await;
                }
                self.coordinator.finalize_reversed(&instance_id, false).await
            }
            _ => {
                self.coordinator
                    .finalize_external_failure(&instance_id, &message)
                    .await
            }
        };

        if let Err(reflect_error) = outcome {
            error!(
                job_id = %job.id,
                instance_id = %instance_id,
                %reflect_error,
                "Failed to reflect job exhaustion onto instance"
            );
        }
    }
}

fn field(job: &Job, name: &str) -> Result<String, EngineError> {
    job.payload
        .get_path(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            EngineError::ConfigurationError(format!("Job {} payload missing {}", job.id, name))
        })
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::*;
    use crate::domain::job::JobStatus;
    use crate::domain::repository::memory::MemoryJobRepository;
    use serde_json::json;

    fn queue() -> (Arc<MemoryJobRepository>, JobQueueService) {
        let repo = Arc::new(MemoryJobRepository::new());
        let service = JobQueueService::new(
            repo.clone(),
            JobQueueConfig {
                retry_backoff: Duration::from_secs(10),
                ..JobQueueConfig::default()
            },
        );
        (repo, service)
    }

    #[tokio::test]
    async fn test_enqueue_claim_complete() {
        let (repo, service) = queue();

        let id = service
            .enqueue(
                JobType::ExecuteFlow,
                Payload::new(json!({"instance_id": "inst-1"})),
                0,
            )
            .await
            .unwrap();

        let batch = service.claim("worker-1").await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);

        service
            .complete(batch.into_iter().next().unwrap(), None)
            .await
            .unwrap();
        let job = repo.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_linear_backoff_schedule() {
        let (repo, service) = queue();

        let id = service
            .enqueue(JobType::ExecuteFlow, Payload::empty(), 0)
            .await
            .unwrap();

        let mut job = service.claim("w").await.unwrap().remove(0);
        assert_eq!(job.attempt, 1);
        let before = Utc::now();
        let disposition = service.fail_attempt(&mut job, "boom").await.unwrap();
        assert_eq!(disposition, JobDisposition::Retried);

        let saved = repo.find_by_id(&id).await.unwrap().unwrap();
        // attempt 1: rescheduled one backoff unit out
        let delay = saved.scheduled_for - before;
        assert!(delay >= ChronoDuration::seconds(9) && delay <= ChronoDuration::seconds(11));
        assert_eq!(saved.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_exhaustion_goes_terminal() {
        let (repo, service) = queue();

        let id = service
            .enqueue(JobType::ExecuteFlow, Payload::empty(), 0)
            .await
            .unwrap();

        for attempt in 1..=3u32 {
            // Make the retried job due again immediately
            let mut job = repo.find_by_id(&id).await.unwrap().unwrap();
            job.scheduled_for = Utc::now();
            repo.save(&job).await.unwrap();

            let mut job = service.claim("w").await.unwrap().remove(0);
            assert_eq!(job.attempt, attempt);
            let disposition = service.fail_attempt(&mut job, "boom").await.unwrap();
            if attempt < 3 {
                assert_eq!(disposition, JobDisposition::Retried);
            } else {
                assert_eq!(disposition, JobDisposition::Exhausted);
            }
        }

        let job = repo.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        // Not re-enqueued
        assert!(service.claim("w").await.unwrap().is_empty());
    }
}
