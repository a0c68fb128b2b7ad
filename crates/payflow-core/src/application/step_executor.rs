//! Per-type step execution
//!
//! One execution path per step type, dispatched over the closed
//! `StepType` sum; adding a type is a compiler-enforced change. The
//! executor holds no per-instance state; retries and persistence belong
//! to the coordinator.

use crate::application::ports::{AlertSink, TransferGateway, TransferRequest};
use crate::application::rules::ActionCodeRules;
use crate::application::transform::{apply_field_mappings, apply_ops, project_field_mappings};
use crate::domain::flow_definition::{StepDefinition, StepType, TaskKind};
use crate::domain::flow_instance::FlowInstance;
use crate::domain::step_execution::StepExecution;
use crate::types::Payload;
use crate::EngineError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Payload flag set when an indeterminate response requires a status
/// query at finalization
pub const TSQ_REQUIRED_FLAG: &str = "tsq_required";

/// Control signal produced by executing one step
#[derive(Debug)]
pub enum StepOutcome {
    /// Proceed to the next step with the updated payload
    Continue { payload: Payload },

    /// Park the instance until a matching callback arrives or the
    /// deadline passes
    SuspendForCallback {
        payload: Payload,
        deadline: DateTime<Utc>,
    },

    /// Park the instance for an operator
    SuspendForManual { payload: Payload, reason: String },

    /// Step finished with nothing further to do; traversal continues
    Complete { payload: Payload },

    /// Definite business failure; terminal, never retried
    Fail { error: EngineError },
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct StepExecutorConfig {
    /// Default outbound request timeout
    pub default_request_timeout: Duration,

    /// Default callback deadline for suspending steps
    pub default_callback_timeout: Duration,

    /// Base URL injected as the callback address on outbound calls
    pub callback_base_url: Option<String>,
}

impl Default for StepExecutorConfig {
    fn default() -> Self {
        Self {
            default_request_timeout: Duration::from_secs(30),
            default_callback_timeout: Duration::from_secs(300),
            callback_base_url: None,
        }
    }
}

/// Executes one step of a given type against a payload
pub struct StepExecutor {
    gateway: Arc<dyn TransferGateway>,
    alerts: Arc<dyn AlertSink>,
    rules: ActionCodeRules,
    config: StepExecutorConfig,
}

impl StepExecutor {
    /// Create a new step executor
    pub fn new(
        gateway: Arc<dyn TransferGateway>,
        alerts: Arc<dyn AlertSink>,
        rules: ActionCodeRules,
        config: StepExecutorConfig,
    ) -> Self {
        Self {
            gateway,
            alerts,
            rules,
            config,
        }
    }

    /// Execute one step, recording request/response snapshots on the
    /// execution record
    pub async fn execute(
        &self,
        step: &StepDefinition,
        instance: &FlowInstance,
        execution: &mut StepExecution,
    ) -> Result<StepOutcome, EngineError> {
        debug!(
            instance_id = %instance.id,
            step = %step.code,
            step_type = ?step.step_type,
            attempt = execution.attempt,
            "Executing step"
        );

        match step.step_type {
            StepType::Start | StepType::End => Ok(StepOutcome::Complete {
                payload: instance.payload.clone(),
            }),
            StepType::Condition => Ok(StepOutcome::Continue {
                payload: instance.payload.clone(),
            }),
            StepType::Transform => self.execute_transform(step, instance, execution),
            StepType::ApiCall => self.execute_api_call(step, instance, execution).await,
            StepType::Callback => Ok(StepOutcome::SuspendForCallback {
                payload: instance.payload.clone(),
                deadline: self.callback_deadline(step),
            }),
            StepType::Manual => Ok(StepOutcome::SuspendForManual {
                payload: instance.payload.clone(),
                reason: step
                    .config
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("Manual intervention at step {}", step.code)),
            }),
            StepType::Alert => self.execute_alert(step, instance).await,
            StepType::Task => self.execute_task(step, instance).await,
        }
    }

    fn execute_transform(
        &self,
        step: &StepDefinition,
        instance: &FlowInstance,
        execution: &mut StepExecution,
    ) -> Result<StepOutcome, EngineError> {
        let mut payload = apply_field_mappings(&instance.payload, &step.config.mappings)?;
        apply_ops(&mut payload, &step.config.ops)?;

        execution.transformed = Some(payload.clone());
        Ok(StepOutcome::Continue { payload })
    }

    async fn execute_api_call(
        &self,
        step: &StepDefinition,
        instance: &FlowInstance,
        execution: &mut StepExecution,
    ) -> Result<StepOutcome, EngineError> {
        let endpoint = step.config.endpoint.as_ref().ok_or_else(|| {
            EngineError::ConfigurationError(format!(
                "API_CALL step {} has no endpoint configured",
                step.code
            ))
        })?;

        let mut body = if step.config.mappings.is_empty() {
            instance.payload.clone()
        } else {
            project_field_mappings(&instance.payload, &step.config.mappings)?
        };
        body.set_path("session_id", Value::String(instance.session_id.clone()));
        body.set_path(
            "tracking_number",
            Value::String(instance.tracking_number.clone()),
        );

        if step.config.await_callback {
            if let Some(base) = &self.config.callback_base_url {
                body.set_path(
                    "callback_url",
                    Value::String(format!("{}/callbacks/{}/{}", base, instance.id, execution.id)),
                );
            }
        }

        let timeout = step
            .config
            .request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_request_timeout);

        let request = TransferRequest {
            endpoint: endpoint.clone(),
            method: step
                .config
                .method
                .clone()
                .unwrap_or_else(|| "POST".to_string()),
            body,
            timeout,
        };
        execution.request_snapshot = Some(request.body.as_value().clone());

        let response = self.gateway.execute(request).await?;
        execution.response_snapshot = Some(response.body.as_value().clone());

        let mut payload = instance.payload.clone();
        // Non-null response fields overwrite; null or absent ones never
        // erase existing data
        payload.merge_non_null(&response.body);

        if let Some(leg) = step.config.leg {
            if let Some(code) = response.action_code() {
                payload.set_path(
                    &format!("leg{}_action_code", leg),
                    Value::String(code.to_string()),
                );
            }
        }

        if step.config.await_callback {
            return Ok(StepOutcome::SuspendForCallback {
                payload,
                deadline: self.callback_deadline(step),
            });
        }

        let action_code = response.action_code();
        if let Some(code) = action_code {
            if self.rules.is_hard_failure(code) {
                return Ok(StepOutcome::Fail {
                    error: EngineError::BusinessFailure(format!(
                        "Step {} declined with action code {}",
                        step.code, code
                    )),
                });
            }
        }

        if self.rules.needs_tsq(action_code) {
            debug!(
                instance_id = %instance.id,
                step = %step.code,
                action_code = ?action_code,
                "Indeterminate response, flagging for status query"
            );
            payload.set_path(TSQ_REQUIRED_FLAG, Value::Bool(true));
        }

        Ok(StepOutcome::Continue { payload })
    }

    async fn execute_alert(
        &self,
        step: &StepDefinition,
        instance: &FlowInstance,
    ) -> Result<StepOutcome, EngineError> {
        let message = step
            .config
            .reason
            .clone()
            .unwrap_or_else(|| format!("Alert raised by step {}", step.code));
        self.alerts.raise(&instance.id, &message).await?;

        Ok(StepOutcome::Continue {
            payload: instance.payload.clone(),
        })
    }

    async fn execute_task(
        &self,
        step: &StepDefinition,
        instance: &FlowInstance,
    ) -> Result<StepOutcome, EngineError> {
        let task = step.config.task.as_ref().ok_or_else(|| {
            EngineError::ConfigurationError(format!(
                "TASK step {} has no task configured",
                step.code
            ))
        })?;

        match task {
            TaskKind::Log { message } => {
                info!(instance_id = %instance.id, step = %step.code, "{}", message);
            }
            TaskKind::Delay { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            TaskKind::Validate { required } => {
                for path in required {
                    let present = instance
                        .payload
                        .get_path(path)
                        .map(|v| !v.is_null())
                        .unwrap_or(false);
                    if !present {
                        return Ok(StepOutcome::Fail {
                            error: EngineError::ValidationError(format!(
                                "Required field missing: {}",
                                path
                            )),
                        });
                    }
                }
            }
        }

        Ok(StepOutcome::Continue {
            payload: instance.payload.clone(),
        })
    }

    fn callback_deadline(&self, step: &StepDefinition) -> DateTime<Utc> {
        let timeout = step
            .config
            .callback_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_callback_timeout);
        Utc::now() + ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::seconds(300))
    }
}
