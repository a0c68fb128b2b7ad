//! Expected and received callback records
//!
//! One `ExpectedCallback` is an outstanding wait; at most one may be
//! PENDING per instance. Every inbound notification is stored as a
//! `ReceivedCallback` whether or not it matches, as the audit trail.

use crate::domain::ids::{CallbackId, InstanceId, StepExecutionId};
use crate::types::Payload;
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The correlation fields an inbound callback is matched on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    /// Externally visible session identifier
    pub session_id: String,

    /// Externally visible tracking number
    pub tracking_number: String,
}

/// Expected callback status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectedCallbackStatus {
    /// Waiting for the external system
    Pending,
    /// A received callback resolved the wait
    Matched,
    /// The deadline passed unresolved
    Timeout,
}

/// One outstanding wait for an external callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedCallback {
    /// Unique identifier
    pub id: CallbackId,

    /// Owning instance
    pub instance_id: InstanceId,

    /// The waiting step execution
    pub step_execution_id: StepExecutionId,

    /// Correlation fields to match against
    pub key: CorrelationKey,

    /// Current status
    pub status: ExpectedCallbackStatus,

    /// Absolute deadline; must exceed creation time
    pub deadline: DateTime<Utc>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl ExpectedCallback {
    /// Register a new expectation
    pub fn new(
        instance_id: InstanceId,
        step_execution_id: StepExecutionId,
        key: CorrelationKey,
        deadline: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        let now = Utc::now();
        if deadline <= now {
            return Err(EngineError::CallbackError(format!(
                "Callback deadline {} is not in the future",
                deadline
            )));
        }

        Ok(Self {
            id: CallbackId::generate(),
            instance_id,
            step_execution_id,
            key,
            status: ExpectedCallbackStatus::Pending,
            deadline,
            created_at: now,
            updated_at: now,
        })
    }

    fn guard_pending(&self, action: &str) -> Result<(), EngineError> {
        if self.status != ExpectedCallbackStatus::Pending {
            return Err(EngineError::CallbackError(format!(
                "Cannot {} expectation {} in state {:?}",
                action, self.id, self.status
            )));
        }
        Ok(())
    }

    /// Resolve the wait
    pub fn mark_matched(&mut self) -> Result<(), EngineError> {
        self.guard_pending("match")?;
        self.status = ExpectedCallbackStatus::Matched;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark the wait expired
    pub fn mark_timeout(&mut self) -> Result<(), EngineError> {
        self.guard_pending("time out")?;
        self.status = ExpectedCallbackStatus::Timeout;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Whether the deadline has passed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ExpectedCallbackStatus::Pending && self.deadline <= now
    }
}

/// One inbound external notification, immutable once stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedCallback {
    /// Unique identifier
    pub id: CallbackId,

    /// Correlation fields extracted from the notification
    pub key: CorrelationKey,

    /// Raw notification payload
    pub payload: Payload,

    /// Whether this callback has resolved an expectation
    pub processed: bool,

    /// The expectation it resolved, if matched
    pub matched_expectation: Option<CallbackId>,

    /// When the callback arrived
    pub received_at: DateTime<Utc>,
}

impl ReceivedCallback {
    /// Store an inbound notification
    pub fn new(key: CorrelationKey, payload: Payload) -> Self {
        Self {
            id: CallbackId::generate(),
            key,
            payload,
            processed: false,
            matched_expectation: None,
            received_at: Utc::now(),
        }
    }

    /// Link the callback to the expectation it resolved
    pub fn mark_processed(&mut self, expectation: CallbackId) {
        self.processed = true;
        self.matched_expectation = Some(expectation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn key() -> CorrelationKey {
        CorrelationKey {
            session_id: "sess-1".to_string(),
            tracking_number: "trk-1".to_string(),
        }
    }

    fn expectation(deadline: DateTime<Utc>) -> Result<ExpectedCallback, EngineError> {
        ExpectedCallback::new(
            InstanceId("inst-1".to_string()),
            StepExecutionId("exec-1".to_string()),
            key(),
            deadline,
        )
    }

    #[test]
    fn test_deadline_must_be_future() {
        let past = Utc::now() - Duration::seconds(1);
        assert!(expectation(past).is_err());

        let future = Utc::now() + Duration::minutes(5);
        let exp = expectation(future).unwrap();
        assert_eq!(exp.status, ExpectedCallbackStatus::Pending);
        assert!(exp.deadline > exp.created_at);
    }

    #[test]
    fn test_match_then_timeout_rejected() {
        let mut exp = expectation(Utc::now() + Duration::minutes(5)).unwrap();
        exp.mark_matched().unwrap();
        assert_eq!(exp.status, ExpectedCallbackStatus::Matched);

        assert!(exp.mark_timeout().is_err());
        assert!(exp.mark_matched().is_err());
    }

    #[test]
    fn test_timeout_transition() {
        let mut exp = expectation(Utc::now() + Duration::minutes(5)).unwrap();
        exp.mark_timeout().unwrap();
        assert_eq!(exp.status, ExpectedCallbackStatus::Timeout);
    }

    #[test]
    fn test_expiry_check() {
        let exp = expectation(Utc::now() + Duration::minutes(5)).unwrap();
        assert!(!exp.is_expired(Utc::now()));
        assert!(exp.is_expired(Utc::now() + Duration::minutes(6)));

        let mut matched = expectation(Utc::now() + Duration::minutes(5)).unwrap();
        matched.mark_matched().unwrap();
        // Matched expectations never expire
        assert!(!matched.is_expired(Utc::now() + Duration::minutes(6)));
    }

    #[test]
    fn test_received_callback_processing() {
        let mut received = ReceivedCallback::new(key(), Payload::new(json!({"action_code": "000"})));
        assert!(!received.processed);
        assert!(received.matched_expectation.is_none());

        let expectation_id = CallbackId("exp-1".to_string());
        received.mark_processed(expectation_id.clone());
        assert!(received.processed);
        assert_eq!(received.matched_expectation, Some(expectation_id));
    }
}
