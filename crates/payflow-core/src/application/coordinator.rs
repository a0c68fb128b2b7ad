//! The execution coordinator
//!
//! Drives a flow instance through successive steps via the flow graph
//! and step executor, persists every transition, applies per-step retry
//! policy, and stops the loop on suspension or a terminal state. The
//! coordinator is also the resume entry point for callbacks, status
//! queries, and reversals.

use crate::application::ports::{CallerNotifier, DomainEventHandler};
use crate::application::step_executor::{StepExecutor, StepOutcome, TSQ_REQUIRED_FLAG};
use crate::domain::events::{ReversalCreated, StepCompleted, StepFailed, StepStarted, TsqScheduled};
use crate::domain::flow_definition::{StepDefinition, StepType};
use crate::domain::flow_graph::FlowGraph;
use crate::domain::flow_instance::{FlowInstance, InstanceStatus};
use crate::domain::ids::{InstanceId, StepCode};
use crate::domain::job::{Job, JobType};
use crate::domain::callback::{CorrelationKey, ExpectedCallback};
use crate::domain::repository::{
    CallbackRepository, FlowDefinitionRepository, FlowInstanceRepository, JobRepository,
    ReversalRepository, StepExecutionRepository, TsqRepository,
};
use crate::domain::reversal::{ReversalRequest, ReversalType};
use crate::domain::step_execution::StepExecution;
use crate::domain::tsq::TsqRequest;
use crate::types::Payload;
use crate::EngineError;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Hard ceiling on steps per instance; a backstop against malformed
    /// graphs, not the primary cycle defense
    pub max_steps: u32,

    /// Attempts granted to jobs the coordinator enqueues
    pub job_max_attempts: u32,

    /// Attempts granted to status queries the coordinator raises
    pub tsq_max_attempts: u32,

    /// Response-code classification used for the reversal trigger
    pub rules: crate::application::rules::ActionCodeRules,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            job_max_attempts: 3,
            tsq_max_attempts: 3,
            rules: crate::application::rules::ActionCodeRules::default(),
        }
    }
}

/// Inbound trigger for a new instance
#[derive(Debug, Clone)]
pub struct CreateInstance {
    /// Flow code naming the definition to run
    pub flow_code: String,
    /// Caller-supplied session ID, unique per instance
    pub session_id: String,
    /// Caller-supplied tracking number, unique per instance
    pub tracking_number: String,
    /// Triggering payload
    pub payload: Payload,
    /// Where the caller wants the result delivered
    pub callback_url: Option<String>,
}

/// What creating an instance produced
#[derive(Debug)]
pub enum CreateOutcome {
    /// Asynchronous flow: enqueued for a worker
    Accepted { instance_id: InstanceId },
    /// Synchronous flow: executed inline to completion
    Completed {
        instance_id: InstanceId,
        response: Payload,
    },
}

/// Drives flow instances through their step loops
pub struct ExecutionCoordinator {
    definitions: Arc<dyn FlowDefinitionRepository>,
    instances: Arc<dyn FlowInstanceRepository>,
    executions: Arc<dyn StepExecutionRepository>,
    callbacks: Arc<dyn CallbackRepository>,
    tsqs: Arc<dyn TsqRepository>,
    reversals: Arc<dyn ReversalRepository>,
    jobs: Arc<dyn JobRepository>,
    executor: Arc<StepExecutor>,
    notifier: Arc<dyn CallerNotifier>,
    events: Arc<dyn DomainEventHandler>,
    config: CoordinatorConfig,
}

impl ExecutionCoordinator {
    /// Create a new coordinator
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        definitions: Arc<dyn FlowDefinitionRepository>,
        instances: Arc<dyn FlowInstanceRepository>,
        executions: Arc<dyn StepExecutionRepository>,
        callbacks: Arc<dyn CallbackRepository>,
        tsqs: Arc<dyn TsqRepository>,
        reversals: Arc<dyn ReversalRepository>,
        jobs: Arc<dyn JobRepository>,
        executor: Arc<StepExecutor>,
        notifier: Arc<dyn CallerNotifier>,
        events: Arc<dyn DomainEventHandler>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            definitions,
            instances,
            executions,
            callbacks,
            tsqs,
            reversals,
            jobs,
            executor,
            notifier,
            events,
            config,
        }
    }

    /// Create a flow instance from an inbound trigger
    ///
    /// Synchronous flows execute inline and return the final payload;
    /// asynchronous flows enqueue an EXECUTE_FLOW job and return
    /// `Accepted`.
    pub async fn create_instance(
        &self,
        request: CreateInstance,
    ) -> Result<CreateOutcome, EngineError> {
        let definition = self
            .definitions
            .find_by_code(&request.flow_code)
            .await?
            .ok_or_else(|| EngineError::FlowDefinitionNotFound(request.flow_code.clone()))?;

        let key = CorrelationKey {
            session_id: request.session_id.clone(),
            tracking_number: request.tracking_number.clone(),
        };
        if self.instances.find_by_key(&key).await?.is_some() {
            return Err(EngineError::ValidationError(format!(
                "Duplicate session/tracking pair: {}/{}",
                key.session_id, key.tracking_number
            )));
        }

        let mut instance = FlowInstance::new(
            definition.id.clone(),
            request.session_id,
            request.tracking_number,
            request.payload,
            request.callback_url,
        );
        let instance_id = instance.id.clone();
        self.save_instance(&mut instance).await?;

        info!(
            instance_id = %instance_id,
            flow = %definition.code,
            synchronous = definition.synchronous,
            "Flow instance created"
        );

        if definition.synchronous {
            self.execute(&instance_id).await?;

            let done = self.load_instance(&instance_id).await?;
            match done.status {
                InstanceStatus::Completed => Ok(CreateOutcome::Completed {
                    response: done.final_response.unwrap_or(done.payload),
                    instance_id,
                }),
                InstanceStatus::Failed => Err(EngineError::ExecutionError(
                    done.last_error
                        .unwrap_or_else(|| "Flow failed".to_string()),
                )),
                // A synchronous flow that parked anyway behaves like an
                // asynchronous one
                _ => Ok(CreateOutcome::Accepted { instance_id }),
            }
        } else {
            self.enqueue(
                JobType::ExecuteFlow,
                json!({ "instance_id": instance_id.0 }),
                0,
            )
            .await?;
            Ok(CreateOutcome::Accepted { instance_id })
        }
    }

    /// Drive an instance's step loop; the EXECUTE_FLOW job entry point
    pub async fn execute(&self, instance_id: &InstanceId) -> Result<(), EngineError> {
        let mut instance = self.load_instance(instance_id).await?;

        let (graph, synchronous) = self.graph_for(&instance).await?;

        let start_at = match instance.status {
            InstanceStatus::Pending => {
                instance.start()?;
                self.save_instance(&mut instance).await?;
                Some(graph.start_step()?.clone())
            }
            // A reclaimed job may land on an instance a dead worker left
            // RUNNING; continue after its last persisted step
            InstanceStatus::Running => match &instance.current_step {
                Some(current) => graph.resolve_next(current, &instance.payload).cloned(),
                None => Some(graph.start_step()?.clone()),
            },
            status => {
                warn!(
                    instance_id = %instance_id,
                    ?status,
                    "Skipping execution for instance not in a runnable state"
                );
                return Ok(());
            }
        };

        self.run_loop(&graph, &mut instance, start_at, synchronous)
            .await
    }

    /// Resume a parked instance with the resuming payload
    ///
    /// A cancelled instance must never resume; this is checked before
    /// acting on any resumption.
    pub async fn resume(
        &self,
        instance_id: &InstanceId,
        resume_payload: &Payload,
    ) -> Result<(), EngineError> {
        let mut instance = self.load_instance(instance_id).await?;

        if instance.status == InstanceStatus::Cancelled {
            warn!(instance_id = %instance_id, "Ignoring resume for cancelled instance");
            return Ok(());
        }
        if instance.status.is_terminal() {
            warn!(
                instance_id = %instance_id,
                status = ?instance.status,
                "Ignoring resume for terminal instance"
            );
            return Ok(());
        }

        instance.resume()?;
        // Resuming fields take precedence on key collision
        instance.payload.merge_overwrite(resume_payload);
        self.save_instance(&mut instance).await?;

        let (graph, synchronous) = self.graph_for(&instance).await?;
        let next = match &instance.current_step {
            Some(current) => graph.resolve_next(current, &instance.payload).cloned(),
            None => Some(graph.start_step()?.clone()),
        };

        self.run_loop(&graph, &mut instance, next, synchronous).await
    }

    /// Cancel an instance; permitted only while not terminal
    pub async fn cancel_instance(&self, instance_id: &InstanceId) -> Result<(), EngineError> {
        let mut instance = self.load_instance(instance_id).await?;
        instance.cancel()?;
        self.save_instance(&mut instance).await?;
        Ok(())
    }

    /// Finalize an instance whose outcome an external authority (TSQ)
    /// confirmed successful
    pub async fn finalize_external_success(
        &self,
        instance_id: &InstanceId,
        merge: &Payload,
    ) -> Result<(), EngineError> {
        let mut instance = self.load_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(());
        }

        if instance.status != InstanceStatus::Running {
            instance.resume()?;
        }
        instance.payload.merge_non_null(merge);
        instance.payload.remove_path(TSQ_REQUIRED_FLAG);
        instance.complete()?;
        self.save_instance(&mut instance).await?;
        self.deliver_result(&mut instance).await
    }

    /// Finalize an instance whose outcome is definitively failed
    pub async fn finalize_external_failure(
        &self,
        instance_id: &InstanceId,
        error: &str,
    ) -> Result<(), EngineError> {
        let mut instance = self.load_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(());
        }
        self.fail_instance(&mut instance, error.to_string()).await
    }

    /// Park an instance for an operator after an escalation gave up
    pub async fn flag_manual(
        &self,
        instance_id: &InstanceId,
        reason: &str,
    ) -> Result<(), EngineError> {
        let mut instance = self.load_instance(instance_id).await?;
        if instance.status.is_terminal()
            || instance.status == InstanceStatus::ManualIntervention
        {
            return Ok(());
        }

        let step = instance
            .current_step
            .clone()
            .unwrap_or_else(|| StepCode("ESCALATION".to_string()));
        instance.suspend_for_manual(step, reason.to_string())?;
        self.save_instance(&mut instance).await?;
        Ok(())
    }

    /// Finalize the original instance after its reversal concluded
    pub async fn finalize_reversed(
        &self,
        instance_id: &InstanceId,
        success: bool,
    ) -> Result<(), EngineError> {
        let mut instance = self.load_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(());
        }
        instance.finalize_reversal(success)?;
        self.save_instance(&mut instance).await?;
        self.deliver_result(&mut instance).await
    }

    /// Register an expected callback for a waiting step, enforcing the
    /// single-PENDING invariant at the storage layer
    pub async fn register_expectation(
        &self,
        instance: &FlowInstance,
        execution: &StepExecution,
        deadline: chrono::DateTime<Utc>,
    ) -> Result<ExpectedCallback, EngineError> {
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
        Ok(expected)
    }

    /// Escalate an instance to a status query; the entry point for the
    /// callback timeout sweep and indeterminate callback codes
    pub async fn escalate_tsq(
        &self,
        instance_id: &InstanceId,
        reason: &str,
    ) -> Result<(), EngineError> {
        let mut instance = self.load_instance(instance_id).await?;
        if instance.status.is_terminal() {
            warn!(
                instance_id = %instance_id,
                status = ?instance.status,
                "Ignoring TSQ escalation for terminal instance"
            );
            return Ok(());
        }
        self.schedule_tsq(&mut instance, reason).await?;
        self.save_instance(&mut instance).await?;
        Ok(())
    }

    /// Raise a status query for an instance and enqueue its execution
    pub async fn schedule_tsq(
        &self,
        instance: &mut FlowInstance,
        reason: &str,
    ) -> Result<TsqRequest, EngineError> {
        let mut tsq = TsqRequest::new(
            instance.id.clone(),
            reason.to_string(),
            self.config.tsq_max_attempts,
        );
        // The job drives it; keep the sweep from double-picking it
        tsq.next_retry_at = None;
        self.tsqs.save(&tsq).await?;

        instance.record_event(Box::new(TsqScheduled {
            instance_id: instance.id.clone(),
            tsq_id: tsq.id.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }));

        self.enqueue(
            JobType::ExecuteTsq,
            json!({ "tsq_id": tsq.id.0, "instance_id": instance.id.0 }),
            1,
        )
        .await?;
        Ok(tsq)
    }

    async fn run_loop(
        &self,
        graph: &FlowGraph,
        instance: &mut FlowInstance,
        start_at: Option<StepDefinition>,
        synchronous: bool,
    ) -> Result<(), EngineError> {
        let mut next = start_at;

        while let Some(step) = next {
            if instance.status != InstanceStatus::Running {
                return Ok(());
            }

            if instance.step_count >= self.config.max_steps {
                let message = format!(
                    "Step ceiling of {} exceeded at step {}",
                    self.config.max_steps, step.code
                );
                return self.fail_instance(instance, message).await;
            }

            instance.step_count += 1;
            instance.current_step = Some(step.code.clone());

            let mut execution = StepExecution::new(
                instance.id.clone(),
                step.code.clone(),
                instance.payload.clone(),
                step.retry.max_attempts,
            );

            let outcome = self
                .run_step_with_retry(&step, instance, &mut execution)
                .await;

            match outcome {
                Err(error) => {
                    let message = error.to_string();
                    execution.fail(&message);
                    self.executions.save(&execution).await?;
                    instance.record_event(Box::new(StepFailed {
                        instance_id: instance.id.clone(),
                        step: step.code.clone(),
                        error: message.clone(),
                        timestamp: Utc::now(),
                    }));
                    return self.fail_instance(instance, message).await;
                }
                Ok(StepOutcome::Fail { error }) => {
                    let message = error.to_string();
                    execution.fail(&message);
                    self.executions.save(&execution).await?;
                    instance.record_event(Box::new(StepFailed {
                        instance_id: instance.id.clone(),
                        step: step.code.clone(),
                        error: message.clone(),
                        timestamp: Utc::now(),
                    }));

                    // A definite failure on a later leg of a multi-leg
                    // transfer compensates the succeeded leg instead of
                    // stranding funds
                    if self.needs_reversal(&step, &instance.payload) {
                        return self.raise_reversal(instance, &step, message).await;
                    }

                    return self.fail_instance(instance, message).await;
                }
                Ok(StepOutcome::Continue { payload }) | Ok(StepOutcome::Complete { payload }) => {
                    execution.complete(payload.clone());
                    self.executions.save(&execution).await?;

                    instance.payload = payload;
                    instance.record_event(Box::new(StepCompleted {
                        instance_id: instance.id.clone(),
                        step: step.code.clone(),
                        timestamp: Utc::now(),
                    }));
                    self.save_instance(instance).await?;

                    if step.step_type == StepType::End {
                        return self.finalize(instance, synchronous).await;
                    }
                    next = graph.resolve_next(&step.code, &instance.payload).cloned();
                }
                Ok(StepOutcome::SuspendForCallback { payload, deadline }) => {
                    execution.wait();
                    self.executions.save(&execution).await?;

                    instance.payload = payload;
                    self.register_expectation(instance, &execution, deadline)
                        .await?;
                    instance.suspend_for_callback(step.code.clone())?;
                    self.save_instance(instance).await?;

                    debug!(
                        instance_id = %instance.id,
                        step = %step.code,
                        %deadline,
                        "Instance suspended awaiting callback"
                    );
                    return Ok(());
                }
                Ok(StepOutcome::SuspendForManual { payload, reason }) => {
                    execution.wait();
                    self.executions.save(&execution).await?;

                    instance.payload = payload;
                    instance.suspend_for_manual(step.code.clone(), reason)?;
                    self.save_instance(instance).await?;
                    return Ok(());
                }
            }
        }

        self.finalize(instance, synchronous).await
    }

    async fn run_step_with_retry(
        &self,
        step: &StepDefinition,
        instance: &mut FlowInstance,
        execution: &mut StepExecution,
    ) -> Result<StepOutcome, EngineError> {
        loop {
            execution.begin_attempt()?;
            self.executions.save(execution).await?;

            instance.record_event(Box::new(StepStarted {
                instance_id: instance.id.clone(),
                step: step.code.clone(),
                attempt: execution.attempt,
                timestamp: Utc::now(),
            }));

            match self.executor.execute(step, instance, execution).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    let message = error.to_string();
                    execution.record_attempt_error(&message);
                    instance.record_error(&message);
                    self.executions.save(execution).await?;

                    if !error.is_retryable() || !execution.attempts_remaining() {
                        return Err(error);
                    }

                    warn!(
                        instance_id = %instance.id,
                        step = %step.code,
                        attempt = execution.attempt,
                        max_attempts = execution.max_attempts,
                        error = %message,
                        "Step attempt failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(step.retry.retry_interval_ms)).await;
                }
            }
        }
    }

    /// Close out an instance that reached END (or ran out of steps)
    async fn finalize(
        &self,
        instance: &mut FlowInstance,
        synchronous: bool,
    ) -> Result<(), EngineError> {
        let tsq_required = instance
            .payload
            .get_path(TSQ_REQUIRED_FLAG)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if tsq_required {
            // An indeterminate leg means the outcome is not ours to
            // declare; the status query is the authority
            self.schedule_tsq(instance, "indeterminate response code")
                .await?;
            let step = instance
                .current_step
                .clone()
                .unwrap_or_else(|| StepCode("TSQ".to_string()));
            instance.suspend_for_callback(step)?;
            self.save_instance(instance).await?;
            return Ok(());
        }

        instance.complete()?;
        if synchronous {
            // The API response itself is the callback; no separate
            // notification is owed
            instance.callback_sent = true;
        }
        self.save_instance(instance).await?;

        info!(instance_id = %instance.id, "Flow instance completed");

        if !synchronous {
            self.deliver_result(instance).await?;
        }
        Ok(())
    }

    async fn fail_instance(
        &self,
        instance: &mut FlowInstance,
        error: String,
    ) -> Result<(), EngineError> {
        warn!(instance_id = %instance.id, error = %error, "Flow instance failed");
        instance.fail(error)?;
        self.save_instance(instance).await?;
        self.deliver_result(instance).await
    }

    fn needs_reversal(&self, failing_step: &StepDefinition, payload: &Payload) -> bool {
        let Some(failing_leg) = failing_step.config.leg else {
            return false;
        };
        (1..failing_leg).any(|leg| {
            payload
                .get_str(&format!("leg{}_action_code", leg))
                .map(|code| self.config.rules.is_success(code))
                .unwrap_or(false)
        })
    }

    async fn raise_reversal(
        &self,
        instance: &mut FlowInstance,
        failing_step: &StepDefinition,
        error: String,
    ) -> Result<(), EngineError> {
        let reversal_type = match failing_step.config.leg {
            Some(2) => ReversalType::DebitReversal,
            _ => ReversalType::Full,
        };

        let reversal = ReversalRequest::compensating(
            instance.id.clone(),
            &instance.payload,
            reversal_type,
            error.clone(),
        );
        self.reversals.save(&reversal).await?;

        info!(
            instance_id = %instance.id,
            reversal_id = %reversal.id,
            ?reversal_type,
            "Reversal raised for partial failure"
        );

        instance.record_error(&error);
        instance.record_event(Box::new(ReversalCreated {
            instance_id: instance.id.clone(),
            reversal_id: reversal.id.clone(),
            timestamp: Utc::now(),
        }));
        // Parked until the reversal concludes and finalizes the instance
        instance.suspend_for_callback(failing_step.code.clone())?;
        self.save_instance(instance).await?;

        self.enqueue(
            JobType::ExecuteReversal,
            json!({ "reversal_id": reversal.id.0, "instance_id": instance.id.0 }),
            1,
        )
        .await?;
        Ok(())
    }

    /// Deliver the result callback to the caller, deduplicated by
    /// `callback_sent` once the receiver acknowledges
    pub async fn deliver_result(&self, instance: &mut FlowInstance) -> Result<(), EngineError> {
        if instance.callback_sent {
            return Ok(());
        }
        let Some(url) = instance.callback_url.clone() else {
            // Nothing owed
            instance.callback_sent = true;
            self.instances.save(instance).await?;
            return Ok(());
        };

        let notification = self.build_notification(instance);
        match self.notifier.notify(&url, &notification).await {
            Ok(()) => {
                instance.callback_sent = true;
                self.instances.save(instance).await?;
                Ok(())
            }
            Err(error) => {
                // At-least-once: leave callback_sent unset so a later
                // pass can redeliver
                warn!(
                    instance_id = %instance.id,
                    error = %error,
                    "Result callback delivery failed"
                );
                Ok(())
            }
        }
    }

    fn build_notification(&self, instance: &FlowInstance) -> Payload {
        let mut notification = Payload::new(json!({
            "session_id": instance.session_id,
            "tracking_number": instance.tracking_number,
            "status": instance.status,
            "timestamp": Utc::now().to_rfc3339(),
        }));
        let result = instance
            .final_response
            .as_ref()
            .unwrap_or(&instance.payload);
        notification.merge_non_null(result);
        if let Some(error) = &instance.last_error {
            notification.set_path("error", Value::String(error.clone()));
        }
        notification
    }

    async fn graph_for(&self, instance: &FlowInstance) -> Result<(FlowGraph, bool), EngineError> {
        let definition = self
            .definitions
            .find_by_id(&instance.flow_id)
            .await?
            .ok_or_else(|| EngineError::FlowDefinitionNotFound(instance.flow_id.0.clone()))?;
        let graph = FlowGraph::build(&definition)?;
        Ok((graph, definition.synchronous))
    }

    async fn load_instance(&self, id: &InstanceId) -> Result<FlowInstance, EngineError> {
        self.instances
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(id.0.clone()))
    }

    /// Save the instance and drain its process-log events
    async fn save_instance(&self, instance: &mut FlowInstance) -> Result<(), EngineError> {
        self.instances.save(instance).await?;
        for event in instance.take_events() {
            self.events.handle(event).await?;
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        job_type: JobType,
        payload: Value,
        priority: i32,
    ) -> Result<(), EngineError> {
        let job = Job::new(
            job_type,
            Payload::new(payload),
            priority,
            self.config.job_max_attempts,
        );
        self.jobs.save(&job).await
    }
}

impl Clone for ExecutionCoordinator {
    fn clone(&self) -> Self {
        Self {
            definitions: self.definitions.clone(),
            instances: self.instances.clone(),
            executions: self.executions.clone(),
            callbacks: self.callbacks.clone(),
            tsqs: self.tsqs.clone(),
            reversals: self.reversals.clone(),
            jobs: self.jobs.clone(),
            executor: self.executor.clone(),
            notifier: self.notifier.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }
}
