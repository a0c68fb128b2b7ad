//! Transaction status query (TSQ) requests
//!
//! The TSQ is the sole authority for resolving indeterminate outcomes:
//! callback timeouts and ambiguous response codes escalate here rather
//! than failing the instance directly.

use crate::domain::ids::{InstanceId, TsqId};
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TSQ request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TsqStatus {
    /// Waiting to be executed (or rescheduled)
    Pending,
    /// A query is in flight
    InProgress,
    /// The transaction was confirmed successful
    Success,
    /// The external system does not know the transaction
    NotFound,
    /// Terminal failure
    Failed,
}

/// One status-query cycle for one escalation reason
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsqRequest {
    /// Unique identifier
    pub id: TsqId,

    /// The instance whose outcome is being resolved
    pub instance_id: InstanceId,

    /// Why the query was needed
    pub reason: String,

    /// Current status
    pub status: TsqStatus,

    /// Queries issued so far
    pub attempt: u32,

    /// Configured maximum queries
    pub max_attempts: u32,

    /// When the next query is due; cleared once picked up
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Action code of the last response
    pub last_action_code: Option<String>,

    /// Approval code of the last response
    pub last_approval_code: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl TsqRequest {
    /// Create a new status query, due immediately
    pub fn new(instance_id: InstanceId, reason: String, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: TsqId::generate(),
            instance_id,
            reason,
            status: TsqStatus::Pending,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            next_retry_at: Some(now),
            last_action_code: None,
            last_approval_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Begin a query; guarded to PENDING and bounded by `max_attempts`
    pub fn begin_query(&mut self) -> Result<(), EngineError> {
        if self.status != TsqStatus::Pending {
            return Err(EngineError::TsqError(format!(
                "Cannot execute TSQ {} in state {:?}",
                self.id, self.status
            )));
        }
        if self.attempt >= self.max_attempts {
            return Err(EngineError::TsqError(format!(
                "TSQ {} exhausted its {} attempts",
                self.id, self.max_attempts
            )));
        }

        self.attempt += 1;
        self.status = TsqStatus::InProgress;
        self.next_retry_at = None;
        self.touch();
        Ok(())
    }

    /// Whether another query may still be issued
    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Record the codes of the response just classified
    pub fn record_response(&mut self, action_code: Option<&str>, approval_code: Option<&str>) {
        self.last_action_code = action_code.map(str::to_string);
        self.last_approval_code = approval_code.map(str::to_string);
        self.touch();
    }

    /// Schedule another query after the retry interval
    pub fn reschedule(&mut self, at: DateTime<Utc>) {
        self.status = TsqStatus::Pending;
        self.next_retry_at = Some(at);
        self.touch();
    }

    /// Leave the request PENDING without a due time; an operator must
    /// re-drive it
    pub fn park(&mut self) {
        self.status = TsqStatus::Pending;
        self.next_retry_at = None;
        self.touch();
    }

    /// Finalize the request
    pub fn finalize(&mut self, status: TsqStatus) {
        self.status = status;
        self.next_retry_at = None;
        self.touch();
    }

    /// Whether the request is due for execution at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TsqStatus::Pending
            && self.next_retry_at.map(|at| at <= now).unwrap_or(false)
    }
}
