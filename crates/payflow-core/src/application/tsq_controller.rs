//! The transaction-status-query controller
//!
//! For timed-out or indeterminate outcomes the TSQ is the sole
//! authority: it polls the external system, classifies the answer, and
//! either finalizes the instance, schedules a bounded retry, or
//! escalates to an operator.

use crate::application::coordinator::ExecutionCoordinator;
use crate::application::ports::{TransferGateway, TransferRequest};
use crate::application::rules::{TsqClass, TsqRules};
use crate::domain::ids::TsqId;
use crate::domain::repository::{FlowInstanceRepository, TsqRepository};
use crate::domain::tsq::{TsqRequest, TsqStatus};
use crate::types::Payload;
use crate::EngineError;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// TSQ controller configuration
#[derive(Debug, Clone)]
pub struct TsqConfig {
    /// Status-query endpoint
    pub endpoint: String,

    /// Fixed functional code identifying a status query on the wire
    pub function_code: String,

    /// Outbound request timeout
    pub request_timeout: Duration,

    /// Fixed interval between query retries
    pub retry_interval: Duration,
}

impl Default for TsqConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://transfer.example/tsq".to_string(),
            function_code: "TSQ".to_string(),
            request_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(60),
        }
    }
}

/// Issues and classifies transaction status queries
pub struct TsqController {
    tsqs: Arc<dyn TsqRepository>,
    instances: Arc<dyn FlowInstanceRepository>,
    gateway: Arc<dyn TransferGateway>,
    coordinator: Arc<ExecutionCoordinator>,
    rules: TsqRules,
    config: TsqConfig,
}

impl TsqController {
    /// Create a TSQ controller
    pub fn new(
        tsqs: Arc<dyn TsqRepository>,
        instances: Arc<dyn FlowInstanceRepository>,
        gateway: Arc<dyn TransferGateway>,
        coordinator: Arc<ExecutionCoordinator>,
        rules: TsqRules,
        config: TsqConfig,
    ) -> Self {
        Self {
            tsqs,
            instances,
            gateway,
            coordinator,
            rules,
            config,
        }
    }

    /// Execute one query cycle for a TSQ request
    ///
    /// Guarded: only a PENDING request with attempts remaining issues a
    /// query; anything else is a no-op so replayed jobs stay harmless.
    pub async fn execute(&self, tsq_id: &TsqId) -> Result<(), EngineError> {
        let mut tsq = self
            .tsqs
            .find_by_id(tsq_id)
            .await?
            .ok_or_else(|| EngineError::TsqError(format!("TSQ not found: {}", tsq_id)))?;

        if tsq.status != TsqStatus::Pending {
            debug!(tsq_id = %tsq_id, status = ?tsq.status, "Skipping TSQ not in PENDING");
            return Ok(());
        }
        if !tsq.attempts_remaining() {
            debug!(tsq_id = %tsq_id, "Skipping TSQ with exhausted attempts");
            return Ok(());
        }

        let instance = self
            .instances
            .find_by_id(&tsq.instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(tsq.instance_id.0.clone()))?;

        if instance.status.is_terminal() {
            // The instance resolved some other way; the query is moot
            tsq.finalize(TsqStatus::Failed);
            self.tsqs.save(&tsq).await?;
            return Ok(());
        }

        tsq.begin_query()?;
        self.tsqs.save(&tsq).await?;

        let body = Payload::new(json!({
            "function_code": self.config.function_code,
            "session_id": instance.session_id,
            "tracking_number": instance.tracking_number,
        }));
        let request = TransferRequest::post(
            self.config.endpoint.clone(),
            body,
            self.config.request_timeout,
        );

        match self.gateway.execute(request).await {
            Ok(response) => {
                tsq.record_response(response.action_code(), response.approval_code.as_deref());
                let class = self.rules.classify(response.action_code());
                info!(
                    tsq_id = %tsq_id,
                    instance_id = %tsq.instance_id,
                    attempt = tsq.attempt,
                    action_code = ?response.action_code,
                    ?class,
                    "Status query classified"
                );
                self.apply(&mut tsq, class, &response.body).await
            }
            Err(error) => {
                // Transport failure during the query is itself a
                // retryable attempt
                warn!(tsq_id = %tsq_id, %error, "Status query transport failure");
                if tsq.attempts_remaining() {
                    tsq.reschedule(Utc::now() + self.retry_interval());
                    self.tsqs.save(&tsq).await
                } else {
                    tsq.finalize(TsqStatus::Failed);
                    self.tsqs.save(&tsq).await?;
                    self.coordinator
                        .finalize_external_failure(
                            &tsq.instance_id,
                            &format!(
                                "Status query failed after {} attempts: {}",
                                tsq.attempt, error
                            ),
                        )
                        .await
                }
            }
        }
    }

    async fn apply(
        &self,
        tsq: &mut TsqRequest,
        class: TsqClass,
        response_body: &Payload,
    ) -> Result<(), EngineError> {
        match class {
            TsqClass::Success => {
                tsq.finalize(TsqStatus::Success);
                self.tsqs.save(tsq).await?;
                self.coordinator
                    .finalize_external_success(&tsq.instance_id, response_body)
                    .await
            }
            TsqClass::NotFound => {
                if tsq.attempts_remaining() {
                    tsq.reschedule(Utc::now() + self.retry_interval());
                    self.tsqs.save(tsq).await
                } else {
                    tsq.finalize(TsqStatus::NotFound);
                    self.tsqs.save(tsq).await?;
                    self.coordinator
                        .finalize_external_failure(
                            &tsq.instance_id,
                            "Transaction not found by status query",
                        )
                        .await
                }
            }
            TsqClass::ValidationError => {
                // A malformed query will not improve with retries
                tsq.finalize(TsqStatus::Failed);
                self.tsqs.save(tsq).await?;
                self.coordinator
                    .flag_manual(&tsq.instance_id, "Status query rejected as malformed")
                    .await
            }
            TsqClass::StillPending => {
                if tsq.attempts_remaining() {
                    tsq.reschedule(Utc::now() + self.retry_interval());
                    self.tsqs.save(tsq).await
                } else {
                    // Deliberately left PENDING so an operator can
                    // re-drive it after checking
                    tsq.park();
                    self.tsqs.save(tsq).await?;
                    self.coordinator
                        .flag_manual(
                            &tsq.instance_id,
                            &format!(
                                "Outcome still pending after {} status queries",
                                tsq.attempt
                            ),
                        )
                        .await
                }
            }
            TsqClass::Other => {
                tsq.finalize(TsqStatus::Failed);
                self.tsqs.save(tsq).await?;
                self.coordinator
                    .finalize_external_failure(
                        &tsq.instance_id,
                        &format!(
                            "Status query returned failure code {}",
                            tsq.last_action_code.as_deref().unwrap_or("<none>")
                        ),
                    )
                    .await
            }
        }
    }

    fn retry_interval(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.retry_interval)
            .unwrap_or_else(|_| ChronoDuration::seconds(60))
    }
}
