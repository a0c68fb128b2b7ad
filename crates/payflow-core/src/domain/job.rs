//! Durable queued work
//!
//! A job is one unit of queued work driven by the lease-based queue.
//! The record shape (type, priority, payload, lease holder/timestamp,
//! attempt counters) is the external contract any worker implementation
//! consumes.

use crate::domain::ids::JobId;
use crate::types::Payload;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The kinds of work the queue carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Drive a flow instance's step loop
    ExecuteFlow,
    /// Issue a transaction status query
    ExecuteTsq,
    /// Issue a compensating reversal
    ExecuteReversal,
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Ready to be claimed once due
    Pending,
    /// Leased by a worker
    Processing,
    /// Terminal: done
    Completed,
    /// Terminal: attempts exhausted
    Failed,
    /// Terminal: cancelled
    Cancelled,
}

impl JobStatus {
    /// Whether the job will never run again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// One unit of queued work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier
    pub id: JobId,

    /// What kind of work this is
    pub job_type: JobType,

    /// Higher priorities are claimed first
    pub priority: i32,

    /// Work parameters (typically the target aggregate's ID)
    pub payload: Payload,

    /// Current status
    pub status: JobStatus,

    /// Attempts so far
    pub attempt: u32,

    /// Configured maximum attempts
    pub max_attempts: u32,

    /// Earliest time the job may be claimed
    pub scheduled_for: DateTime<Utc>,

    /// The worker currently holding the lease
    pub locked_by: Option<String>,

    /// When the lease was acquired
    pub locked_at: Option<DateTime<Utc>>,

    /// Most recent error message
    pub last_error: Option<String>,

    /// Result recorded on completion
    pub result: Option<Payload>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a job ready to run immediately
    pub fn new(job_type: JobType, payload: Payload, priority: i32, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            job_type,
            priority,
            payload,
            status: JobStatus::Pending,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            scheduled_for: now,
            locked_by: None,
            locked_at: None,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the job may be claimed at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }

    /// Take the lease for `worker_id`; part of the queue's atomic claim
    pub fn lease(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.attempt += 1;
        self.locked_by = Some(worker_id.to_string());
        self.locked_at = Some(now);
        self.touch();
    }

    /// Whether the lease has outlived the staleness threshold
    pub fn lease_is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self
                .locked_at
                .map(|at| now - at > threshold)
                .unwrap_or(true)
    }

    /// Mark the job done, storing its result
    pub fn complete(&mut self, result: Option<Payload>) {
        self.status = JobStatus::Completed;
        self.result = result;
        self.release_lock();
    }

    /// Reschedule after a failed attempt with the given delay
    pub fn reschedule(&mut self, delay: Duration, error: &str) {
        self.status = JobStatus::Pending;
        self.scheduled_for = Utc::now() + delay;
        self.last_error = Some(error.to_string());
        self.release_lock();
    }

    /// Mark the job permanently failed
    pub fn fail(&mut self, error: &str) {
        self.status = JobStatus::Failed;
        self.last_error = Some(error.to_string());
        self.release_lock();
    }

    /// Return a stale job to the queue, presuming its worker dead
    pub fn reclaim(&mut self) {
        self.status = JobStatus::Pending;
        self.release_lock();
    }

    fn release_lock(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
        self.touch();
    }

    /// Whether another attempt is permitted
    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }
}
