//! The reversal controller
//!
//! When one leg of a multi-leg transfer succeeded and a later leg
//! definitively failed, the controller issues the swapped-leg
//! compensating transaction. A definite answer finalizes the original
//! instance immediately; a "processing" answer leaves the reversal
//! awaiting its own callback through the regular matching path.

use crate::application::coordinator::ExecutionCoordinator;
use crate::application::ports::{TransferGateway, TransferRequest};
use crate::application::rules::ActionCodeRules;
use crate::domain::callback::{CorrelationKey, ExpectedCallback};
use crate::domain::ids::{InstanceId, ReversalId, StepCode};
use crate::domain::repository::{
    CallbackRepository, FlowInstanceRepository, ReversalRepository, StepExecutionRepository,
};
use crate::domain::reversal::{ReversalRequest, ReversalStatus, ReversalType};
use crate::domain::step_execution::StepExecution;
use crate::types::Payload;
use crate::EngineError;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Step code recorded on the synthetic execution that tracks an
/// asynchronous reversal call
const REVERSAL_STEP: &str = "REVERSAL";

/// Reversal controller configuration
#[derive(Debug, Clone)]
pub struct ReversalConfig {
    /// Reversal endpoint
    pub endpoint: String,

    /// Outbound request timeout
    pub request_timeout: Duration,

    /// Deadline granted to a reversal awaiting its own callback
    pub callback_timeout: Duration,

    /// Action code meaning "accepted, result follows asynchronously"
    pub processing_code: String,
}

impl Default for ReversalConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://transfer.example/reversal".to_string(),
            request_timeout: Duration::from_secs(30),
            callback_timeout: Duration::from_secs(300),
            processing_code: "001".to_string(),
        }
    }
}

/// Issues compensating transactions and finalizes their instances
pub struct ReversalController {
    reversals: Arc<dyn ReversalRepository>,
    instances: Arc<dyn FlowInstanceRepository>,
    executions: Arc<dyn StepExecutionRepository>,
    callbacks: Arc<dyn CallbackRepository>,
    gateway: Arc<dyn TransferGateway>,
    coordinator: Arc<ExecutionCoordinator>,
    rules: ActionCodeRules,
    config: ReversalConfig,
}

impl ReversalController {
    /// Create a reversal controller
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reversals: Arc<dyn ReversalRepository>,
        instances: Arc<dyn FlowInstanceRepository>,
        executions: Arc<dyn StepExecutionRepository>,
        callbacks: Arc<dyn CallbackRepository>,
        gateway: Arc<dyn TransferGateway>,
        coordinator: Arc<ExecutionCoordinator>,
        rules: ActionCodeRules,
        config: ReversalConfig,
    ) -> Self {
        Self {
            reversals,
            instances,
            executions,
            callbacks,
            gateway,
            coordinator,
            rules,
            config,
        }
    }

    /// Raise a reversal for an instance by hand (operator path); the
    /// coordinator raises them automatically on partial failure
    pub async fn create(
        &self,
        instance_id: &InstanceId,
        reversal_type: ReversalType,
        reason: &str,
    ) -> Result<ReversalRequest, EngineError> {
        let instance = self
            .instances
            .find_by_id(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.0.clone()))?;

        let reversal = ReversalRequest::compensating(
            instance.id.clone(),
            &instance.payload,
            reversal_type,
            reason.to_string(),
        );
        self.reversals.save(&reversal).await?;

        info!(
            instance_id = %instance_id,
            reversal_id = %reversal.id,
            ?reversal_type,
            "Reversal created"
        );
        Ok(reversal)
    }

    /// Execute a PENDING reversal's compensating call
    pub async fn execute(&self, reversal_id: &ReversalId) -> Result<(), EngineError> {
        let mut reversal = self.load(reversal_id).await?;

        if reversal.status != ReversalStatus::Pending {
            debug!(
                reversal_id = %reversal_id,
                status = ?reversal.status,
                "Skipping reversal not in PENDING"
            );
            return Ok(());
        }

        let instance = self
            .instances
            .find_by_id(&reversal.instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(reversal.instance_id.0.clone()))?;

        if instance.status == crate::domain::flow_instance::InstanceStatus::Cancelled {
            reversal.cancel()?;
            self.reversals.save(&reversal).await?;
            return Ok(());
        }

        reversal.begin()?;
        self.reversals.save(&reversal).await?;

        let mut body = reversal.payload.clone();
        body.set_path(
            "session_id",
            serde_json::Value::String(instance.session_id.clone()),
        );
        body.set_path(
            "tracking_number",
            serde_json::Value::String(instance.tracking_number.clone()),
        );

        let request = TransferRequest::post(
            self.config.endpoint.clone(),
            body,
            self.config.request_timeout,
        );

        let response = match self.gateway.execute(request).await {
            Ok(response) => response,
            Err(error) => {
                // Back to PENDING so the job retry can re-drive it
                warn!(reversal_id = %reversal_id, %error, "Reversal call transport failure");
                reversal.reset_to_pending();
                self.reversals.save(&reversal).await?;
                return Err(error);
            }
        };

        let action_code = response.action_code();
        if action_code == Some(self.config.processing_code.as_str()) {
            // Accepted for asynchronous processing: the reversal now
            // awaits its own callback through the matcher
            self.await_reversal_callback(&reversal, &instance).await?;
            return Ok(());
        }

        let success = action_code
            .map(|code| self.rules.is_success(code))
            .unwrap_or(false);
        self.conclude(&mut reversal, success).await
    }

    /// Conclude an in-flight reversal from its matched callback
    pub async fn conclude_from_callback(
        &self,
        reversal_id: &ReversalId,
        callback_payload: &Payload,
    ) -> Result<(), EngineError> {
        let mut reversal = self.load(reversal_id).await?;
        if reversal.status != ReversalStatus::InProgress {
            debug!(
                reversal_id = %reversal_id,
                status = ?reversal.status,
                "Ignoring callback for reversal not in progress"
            );
            return Ok(());
        }

        let success = callback_payload
            .get_str("action_code")
            .map(|code| self.rules.is_success(code))
            .unwrap_or(false);
        self.conclude(&mut reversal, success).await
    }

    /// Mark a reversal permanently failed (job exhaustion path)
    pub async fn mark_failed(&self, reversal_id: &ReversalId) -> Result<(), EngineError> {
        let mut reversal = self.load(reversal_id).await?;
        if matches!(
            reversal.status,
            ReversalStatus::Success | ReversalStatus::Failed | ReversalStatus::Cancelled
        ) {
            return Ok(());
        }
        reversal.finalize(false);
        self.reversals.save(&reversal).await
    }

    /// Cancel a reversal; only permitted while PENDING
    pub async fn cancel(&self, reversal_id: &ReversalId) -> Result<(), EngineError> {
        let mut reversal = self.load(reversal_id).await?;
        reversal.cancel()?;
        self.reversals.save(&reversal).await
    }

    async fn conclude(
        &self,
        reversal: &mut ReversalRequest,
        success: bool,
    ) -> Result<(), EngineError> {
        reversal.finalize(success);
        self.reversals.save(reversal).await?;

        info!(
            reversal_id = %reversal.id,
            instance_id = %reversal.instance_id,
            success,
            "Reversal concluded"
        );

        self.coordinator
            .finalize_reversed(&reversal.instance_id, success)
            .await
    }

    async fn await_reversal_callback(
        &self,
        reversal: &ReversalRequest,
        instance: &crate::domain::flow_instance::FlowInstance,
    ) -> Result<(), EngineError> {
        // A synthetic execution record carries the wait so the matcher
        // has something to resolve
        let mut execution = StepExecution::new(
            instance.id.clone(),
            StepCode(REVERSAL_STEP.to_string()),
            reversal.payload.clone(),
            1,
        );
        execution.begin_attempt()?;
        execution.wait();
        self.executions.save(&execution).await?;

        let deadline = Utc::now()
            + ChronoDuration::from_std(self.config.callback_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let expected = ExpectedCallback::new(
            instance.id.clone(),
            execution.id.clone(),
            CorrelationKey {
                session_id: instance.session_id.clone(),
                tracking_number: instance.tracking_number.clone(),
            },
            deadline,
        )?;
        self.callbacks.save_expected(&expected).await?;

        debug!(
            reversal_id = %reversal.id,
            instance_id = %instance.id,
            %deadline,
            "Reversal awaiting its own callback"
        );
        Ok(())
    }

    async fn load(&self, reversal_id: &ReversalId) -> Result<ReversalRequest, EngineError> {
        self.reversals
            .find_by_id(reversal_id)
            .await?
            .ok_or_else(|| {
                EngineError::ReversalError(format!("Reversal not found: {}", reversal_id))
            })
    }
}
