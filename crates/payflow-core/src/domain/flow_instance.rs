use crate::domain::events::{
    DomainEvent, InstanceCancelled, InstanceCompleted, InstanceCreated, InstanceFailed,
    InstanceResumed, InstanceReversed, InstanceSuspendedForCallback, InstanceSuspendedForManual,
};
use crate::domain::ids::{FlowId, InstanceId, StepCode};
use crate::types::Payload;
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Flow instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Created, not yet picked up
    Pending,

    /// A worker is driving the step loop
    Running,

    /// Parked awaiting an external callback or status-query resolution
    WaitingCallback,

    /// Parked awaiting an operator
    ManualIntervention,

    /// Terminal: finished successfully
    Completed,

    /// Terminal: failed
    Failed,

    /// Terminal: cancelled by the caller
    Cancelled,

    /// Terminal: timed out with no resolution
    Timeout,

    /// Terminal: compensated by a successful reversal
    Reversed,

    /// Terminal: the compensating reversal itself failed
    ReversalFailed,
}

impl InstanceStatus {
    /// Whether no further transitions are permitted
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed
                | InstanceStatus::Failed
                | InstanceStatus::Cancelled
                | InstanceStatus::Timeout
                | InstanceStatus::Reversed
                | InstanceStatus::ReversalFailed
        )
    }
}

/// Aggregate: one execution of a flow definition
#[derive(Debug, Serialize, Deserialize)]
pub struct FlowInstance {
    /// Unique identifier
    pub id: InstanceId,

    /// Flow definition ID
    pub flow_id: FlowId,

    /// Caller-supplied session identifier, unique per instance
    pub session_id: String,

    /// Caller-supplied tracking number, unique per instance
    pub tracking_number: String,

    /// Current status
    pub status: InstanceStatus,

    /// The step most recently entered
    pub current_step: Option<StepCode>,

    /// Mutable working data
    pub payload: Payload,

    /// Immutable snapshot of the triggering request
    pub original_request: Payload,

    /// Snapshot of the payload at completion
    pub final_response: Option<Payload>,

    /// Where the caller wants the result delivered
    pub callback_url: Option<String>,

    /// At-most-once marker for the result callback
    pub callback_sent: bool,

    /// Number of step errors recorded so far
    pub error_count: u32,

    /// Most recent error message
    pub last_error: Option<String>,

    /// Steps executed so far; bounded by the coordinator's ceiling
    pub step_count: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Domain events
    #[serde(skip)]
    pub events: Vec<Box<dyn DomainEvent>>,
}

// Manually implement Clone; domain events are not cloned
impl Clone for FlowInstance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            flow_id: self.flow_id.clone(),
            session_id: self.session_id.clone(),
            tracking_number: self.tracking_number.clone(),
            status: self.status,
            current_step: self.current_step.clone(),
            payload: self.payload.clone(),
            original_request: self.original_request.clone(),
            final_response: self.final_response.clone(),
            callback_url: self.callback_url.clone(),
            callback_sent: self.callback_sent,
            error_count: self.error_count,
            last_error: self.last_error.clone(),
            step_count: self.step_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
            events: Vec::new(),
        }
    }
}

impl FlowInstance {
    /// Create a new flow instance
    pub fn new(
        flow_id: FlowId,
        session_id: String,
        tracking_number: String,
        request: Payload,
        callback_url: Option<String>,
    ) -> Self {
        let id = InstanceId::generate();
        let now = Utc::now();

        let mut instance = Self {
            id: id.clone(),
            flow_id: flow_id.clone(),
            session_id,
            tracking_number,
            status: InstanceStatus::Pending,
            current_step: None,
            payload: request.clone(),
            original_request: request,
            final_response: None,
            callback_url,
            callback_sent: false,
            error_count: 0,
            last_error: None,
            step_count: 0,
            created_at: now,
            updated_at: now,
            events: Vec::with_capacity(8),
        };

        instance.record_event(Box::new(InstanceCreated {
            instance_id: id,
            flow_id,
            timestamp: now,
        }));

        instance
    }

    #[inline]
    fn update_timestamp(&mut self) {
        self.updated_at = Utc::now();
    }

    fn guard(&self, expected: &[InstanceStatus], action: &str) -> Result<(), EngineError> {
        if !expected.contains(&self.status) {
            return Err(EngineError::ExecutionError(format!(
                "Cannot {} instance {} in state: {:?}",
                action, self.id, self.status
            )));
        }
        Ok(())
    }

    /// Begin the step loop
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.guard(&[InstanceStatus::Pending], "start")?;
        self.status = InstanceStatus::Running;
        self.update_timestamp();
        Ok(())
    }

    /// Park the instance awaiting an external callback
    pub fn suspend_for_callback(&mut self, step: StepCode) -> Result<(), EngineError> {
        self.guard(&[InstanceStatus::Running], "suspend")?;
        self.status = InstanceStatus::WaitingCallback;
        self.current_step = Some(step.clone());

        self.record_event(Box::new(InstanceSuspendedForCallback {
            instance_id: self.id.clone(),
            step,
            timestamp: Utc::now(),
        }));

        self.update_timestamp();
        Ok(())
    }

    /// Park the instance for operator intervention
    pub fn suspend_for_manual(&mut self, step: StepCode, reason: String) -> Result<(), EngineError> {
        self.guard(
            &[InstanceStatus::Running, InstanceStatus::WaitingCallback],
            "suspend",
        )?;
        self.status = InstanceStatus::ManualIntervention;
        self.current_step = Some(step.clone());

        self.record_event(Box::new(InstanceSuspendedForManual {
            instance_id: self.id.clone(),
            step,
            reason,
            timestamp: Utc::now(),
        }));

        self.update_timestamp();
        Ok(())
    }

    /// Resume a parked instance
    pub fn resume(&mut self) -> Result<(), EngineError> {
        self.guard(
            &[
                InstanceStatus::WaitingCallback,
                InstanceStatus::ManualIntervention,
            ],
            "resume",
        )?;
        self.status = InstanceStatus::Running;

        self.record_event(Box::new(InstanceResumed {
            instance_id: self.id.clone(),
            timestamp: Utc::now(),
        }));

        self.update_timestamp();
        Ok(())
    }

    /// Complete the instance, snapshotting the final payload
    pub fn complete(&mut self) -> Result<(), EngineError> {
        self.guard(&[InstanceStatus::Running], "complete")?;
        self.status = InstanceStatus::Completed;
        self.final_response = Some(self.payload.clone());

        self.record_event(Box::new(InstanceCompleted {
            instance_id: self.id.clone(),
            timestamp: Utc::now(),
        }));

        self.update_timestamp();
        Ok(())
    }

    /// Fail the instance with a causing error
    pub fn fail(&mut self, error: String) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::ExecutionError(format!(
                "Cannot fail instance {} in state: {:?}",
                self.id, self.status
            )));
        }

        self.status = InstanceStatus::Failed;
        self.last_error = Some(error.clone());

        self.record_event(Box::new(InstanceFailed {
            instance_id: self.id.clone(),
            error,
            timestamp: Utc::now(),
        }));

        self.update_timestamp();
        Ok(())
    }

    /// Cancel the instance; permitted only while not terminal
    pub fn cancel(&mut self) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::ExecutionError(format!(
                "Cannot cancel instance {} in state: {:?}",
                self.id, self.status
            )));
        }

        self.status = InstanceStatus::Cancelled;

        self.record_event(Box::new(InstanceCancelled {
            instance_id: self.id.clone(),
            timestamp: Utc::now(),
        }));

        self.update_timestamp();
        Ok(())
    }

    /// Finalize after a concluded reversal
    pub fn finalize_reversal(&mut self, success: bool) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::ExecutionError(format!(
                "Cannot reverse instance {} in state: {:?}",
                self.id, self.status
            )));
        }

        self.status = if success {
            InstanceStatus::Reversed
        } else {
            InstanceStatus::ReversalFailed
        };

        self.record_event(Box::new(InstanceReversed {
            instance_id: self.id.clone(),
            success,
            timestamp: Utc::now(),
        }));

        self.update_timestamp();
        Ok(())
    }

    /// Record a step error without changing status
    pub fn record_error(&mut self, error: &str) {
        self.error_count += 1;
        self.last_error = Some(error.to_string());
        self.update_timestamp();
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.events.push(event);
    }

    /// Get and clear all domain events
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_instance() -> FlowInstance {
        let mut instance = FlowInstance::new(
            FlowId("flow-1".to_string()),
            "sess-1".to_string(),
            "trk-1".to_string(),
            Payload::new(json!({"amount": 100})),
            Some("https://caller.example/hook".to_string()),
        );
        instance.start().unwrap();
        instance.take_events();
        instance
    }

    #[test]
    fn test_creation() {
        let instance = FlowInstance::new(
            FlowId("flow-1".to_string()),
            "sess-1".to_string(),
            "trk-1".to_string(),
            Payload::new(json!({"amount": 100})),
            None,
        );

        assert_eq!(instance.status, InstanceStatus::Pending);
        assert!(!instance.callback_sent);
        assert_eq!(instance.error_count, 0);
        assert_eq!(instance.payload, instance.original_request);
        assert!(!instance.id.0.is_empty());
        assert_eq!(instance.events.len(), 1);
    }

    #[test]
    fn test_start_guard() {
        let mut instance = running_instance();
        // Already running
        assert!(instance.start().is_err());
    }

    #[test]
    fn test_suspend_and_resume_for_callback() {
        let mut instance = running_instance();
        let step = StepCode("DEBIT".to_string());

        instance.suspend_for_callback(step.clone()).unwrap();
        assert_eq!(instance.status, InstanceStatus::WaitingCallback);
        assert_eq!(instance.current_step, Some(step));
        assert!(!instance.events.is_empty());

        instance.resume().unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
    }

    #[test]
    fn test_suspend_for_manual() {
        let mut instance = running_instance();

        instance
            .suspend_for_manual(StepCode("HOLD".to_string()), "limit exceeded".to_string())
            .unwrap();
        assert_eq!(instance.status, InstanceStatus::ManualIntervention);

        instance.resume().unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
    }

    #[test]
    fn test_resume_requires_parked_state() {
        let mut instance = running_instance();
        assert!(instance.resume().is_err());
    }

    #[test]
    fn test_complete_snapshots_final_response() {
        let mut instance = running_instance();
        instance.payload.set_path("result", json!("ok"));

        instance.complete().unwrap();

        assert_eq!(instance.status, InstanceStatus::Completed);
        let final_response = instance.final_response.as_ref().unwrap();
        assert_eq!(final_response.get_str("result").unwrap(), "ok");
    }

    #[test]
    fn test_complete_requires_running() {
        let mut instance = running_instance();
        instance
            .suspend_for_callback(StepCode("S".to_string()))
            .unwrap();
        assert!(instance.complete().is_err());
    }

    #[test]
    fn test_fail_records_error() {
        let mut instance = running_instance();

        instance.fail("external decline".to_string()).unwrap();

        assert_eq!(instance.status, InstanceStatus::Failed);
        assert_eq!(instance.last_error.as_deref(), Some("external decline"));
    }

    #[test]
    fn test_fail_rejected_when_terminal() {
        let mut instance = running_instance();
        instance.complete().unwrap();

        assert!(instance.fail("too late".to_string()).is_err());
    }

    #[test]
    fn test_cancel_non_terminal_only() {
        let mut instance = running_instance();
        instance.cancel().unwrap();
        assert_eq!(instance.status, InstanceStatus::Cancelled);

        let mut done = running_instance();
        done.complete().unwrap();
        assert!(done.cancel().is_err());
    }

    #[test]
    fn test_finalize_reversal() {
        let mut instance = running_instance();
        instance.finalize_reversal(true).unwrap();
        assert_eq!(instance.status, InstanceStatus::Reversed);

        let mut failed = running_instance();
        failed.finalize_reversal(false).unwrap();
        assert_eq!(failed.status, InstanceStatus::ReversalFailed);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Reversed.is_terminal());
        assert!(InstanceStatus::ReversalFailed.is_terminal());
        assert!(!InstanceStatus::WaitingCallback.is_terminal());
        assert!(!InstanceStatus::ManualIntervention.is_terminal());
        assert!(!InstanceStatus::Pending.is_terminal());
    }

    #[test]
    fn test_clone_drops_events() {
        let mut instance = running_instance();
        instance.record_error("x");
        instance
            .suspend_for_callback(StepCode("S".to_string()))
            .unwrap();
        assert!(!instance.events.is_empty());

        let cloned = instance.clone();
        assert!(cloned.events.is_empty());
        assert_eq!(cloned.status, instance.status);
    }

    #[test]
    fn test_serialization_round_trip() {
        let instance = running_instance();
        let serialized = serde_json::to_string(&instance).unwrap();
        let deserialized: FlowInstance = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.id, instance.id);
        assert_eq!(deserialized.status, instance.status);
        assert_eq!(deserialized.session_id, instance.session_id);
    }
}
