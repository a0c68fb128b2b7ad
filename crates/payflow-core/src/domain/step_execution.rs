use crate::domain::ids::{InstanceId, StepCode, StepExecutionId};
use crate::types::Payload;
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Step execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepExecutionStatus {
    /// Record created, attempt not yet started
    Pending,
    /// An attempt is in flight
    Running,
    /// Terminal: finished successfully
    Completed,
    /// Terminal: all attempts exhausted or failure was definite
    Failed,
    /// Suspended awaiting a callback or operator
    Waiting,
    /// Terminal: the wait's deadline passed
    Timeout,
    /// Terminal: skipped by branching
    Skipped,
}

impl StepExecutionStatus {
    /// Whether the record may no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepExecutionStatus::Completed
                | StepExecutionStatus::Failed
                | StepExecutionStatus::Timeout
                | StepExecutionStatus::Skipped
        )
    }
}

/// One attempt-tracked execution of one step within one instance
///
/// A retry re-enters RUNNING on the same record with an incremented
/// attempt; it never creates a second record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// Unique identifier
    pub id: StepExecutionId,

    /// Owning instance
    pub instance_id: InstanceId,

    /// The step being executed
    pub step_code: StepCode,

    /// Current status
    pub status: StepExecutionStatus,

    /// Payload at step entry
    pub input: Payload,

    /// Payload at step exit
    pub output: Option<Payload>,

    /// Payload after field mappings, for TRANSFORM steps
    pub transformed: Option<Payload>,

    /// Snapshot of the outbound external request, if any
    pub request_snapshot: Option<Value>,

    /// Snapshot of the external response, if any
    pub response_snapshot: Option<Value>,

    /// Current attempt, 1-based once running
    pub attempt: u32,

    /// Configured maximum attempts
    pub max_attempts: u32,

    /// Most recent error message
    pub error: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl StepExecution {
    /// Create a new execution record at step entry
    pub fn new(
        instance_id: InstanceId,
        step_code: StepCode,
        input: Payload,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: StepExecutionId::generate(),
            instance_id,
            step_code,
            status: StepExecutionStatus::Pending,
            input,
            output: None,
            transformed: None,
            request_snapshot: None,
            response_snapshot: None,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Begin the next attempt
    pub fn begin_attempt(&mut self) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::ExecutionError(format!(
                "Cannot re-run terminal step execution {}",
                self.id
            )));
        }
        if self.attempt >= self.max_attempts {
            return Err(EngineError::ExecutionError(format!(
                "Step execution {} exhausted its {} attempts",
                self.id, self.max_attempts
            )));
        }

        self.attempt += 1;
        self.status = StepExecutionStatus::Running;
        self.touch();
        Ok(())
    }

    /// Whether another attempt is permitted after a failure
    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Mark the execution completed with its output payload
    pub fn complete(&mut self, output: Payload) {
        self.status = StepExecutionStatus::Completed;
        self.output = Some(output);
        self.touch();
    }

    /// Mark the execution failed
    pub fn fail(&mut self, error: &str) {
        self.status = StepExecutionStatus::Failed;
        self.error = Some(error.to_string());
        self.touch();
    }

    /// Record an attempt error without going terminal
    pub fn record_attempt_error(&mut self, error: &str) {
        self.error = Some(error.to_string());
        self.touch();
    }

    /// Park the execution awaiting a callback or operator
    pub fn wait(&mut self) {
        self.status = StepExecutionStatus::Waiting;
        self.touch();
    }

    /// Mark a waiting execution timed out
    pub fn timeout(&mut self) -> Result<(), EngineError> {
        if self.status != StepExecutionStatus::Waiting {
            return Err(EngineError::ExecutionError(format!(
                "Cannot time out step execution {} in state {:?}",
                self.id, self.status
            )));
        }
        self.status = StepExecutionStatus::Timeout;
        self.touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution(max_attempts: u32) -> StepExecution {
        StepExecution::new(
            InstanceId("inst-1".to_string()),
            StepCode("DEBIT".to_string()),
            Payload::new(json!({"amount": 10})),
            max_attempts,
        )
    }

    #[test]
    fn test_attempt_lifecycle() {
        let mut exec = execution(3);
        assert_eq!(exec.status, StepExecutionStatus::Pending);
        assert_eq!(exec.attempt, 0);

        exec.begin_attempt().unwrap();
        assert_eq!(exec.status, StepExecutionStatus::Running);
        assert_eq!(exec.attempt, 1);

        exec.record_attempt_error("flaky");
        assert!(exec.attempts_remaining());

        // Retry re-enters RUNNING on the same record
        exec.begin_attempt().unwrap();
        assert_eq!(exec.attempt, 2);

        exec.complete(Payload::new(json!({"done": true})));
        assert_eq!(exec.status, StepExecutionStatus::Completed);
        assert!(exec.output.is_some());
    }

    #[test]
    fn test_attempts_bounded() {
        let mut exec = execution(2);
        exec.begin_attempt().unwrap();
        exec.begin_attempt().unwrap();
        assert!(!exec.attempts_remaining());
        assert!(exec.begin_attempt().is_err());
    }

    #[test]
    fn test_terminal_records_are_immutable() {
        let mut exec = execution(3);
        exec.begin_attempt().unwrap();
        exec.fail("hard decline");

        assert_eq!(exec.status, StepExecutionStatus::Failed);
        assert!(exec.begin_attempt().is_err());
    }

    #[test]
    fn test_timeout_requires_waiting() {
        let mut exec = execution(1);
        exec.begin_attempt().unwrap();
        assert!(exec.timeout().is_err());

        exec.wait();
        exec.timeout().unwrap();
        assert_eq!(exec.status, StepExecutionStatus::Timeout);
        assert!(exec.status.is_terminal());
    }

    #[test]
    fn test_zero_max_attempts_clamped() {
        let exec = execution(0);
        assert_eq!(exec.max_attempts, 1);
    }
}
