//! Test doubles for the engine's outbound ports
//!
//! Compiled under the `testing` feature so unit tests, integration
//! tests, and downstream crates can script external behavior without a
//! network.

use crate::application::ports::{
    AlertSink, CallerNotifier, TransferGateway, TransferRequest, TransferResponse,
};
use crate::domain::ids::InstanceId;
use crate::types::Payload;
use crate::EngineError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;

/// Gateway that replays scripted responses in order and records every
/// request it sees
pub struct ScriptedGateway {
    responses: Mutex<Vec<Result<TransferResponse, EngineError>>>,
    /// Requests captured in call order
    pub requests: Mutex<Vec<TransferRequest>>,
}

impl ScriptedGateway {
    /// Script an explicit sequence of results
    pub fn new(responses: Vec<Result<TransferResponse, EngineError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Script a single successful response with the given action code
    pub fn respond_with(action_code: &str, body: Value) -> Self {
        Self::new(vec![Ok(response(action_code, body))])
    }

    /// Number of calls made so far
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// Build a gateway response with the given action code and body
pub fn response(action_code: &str, body: Value) -> TransferResponse {
    TransferResponse {
        action_code: Some(action_code.to_string()),
        approval_code: Some("APPROVED".to_string()),
        body: Payload::new(body),
    }
}

#[async_trait]
impl TransferGateway for ScriptedGateway {
    async fn execute(&self, request: TransferRequest) -> Result<TransferResponse, EngineError> {
        self.requests.lock().unwrap().push(request);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(EngineError::TransportError(
                "no scripted response left".to_string(),
            ));
        }
        responses.remove(0)
    }
}

/// Notifier that records deliveries instead of making HTTP calls
#[derive(Default)]
pub struct CollectingNotifier {
    /// Deliveries as (callback_url, notification) pairs
    pub deliveries: Mutex<Vec<(String, Payload)>>,
    /// When true, every delivery fails with a transport error
    pub fail: bool,
}

impl CollectingNotifier {
    /// A notifier that acknowledges every delivery
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose receiver never acknowledges
    pub fn failing() -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Number of acknowledged deliveries
    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

#[async_trait]
impl CallerNotifier for CollectingNotifier {
    async fn notify(
        &self,
        callback_url: &str,
        notification: &Payload,
    ) -> Result<(), EngineError> {
        if self.fail {
            return Err(EngineError::TransportError(
                "receiver unreachable".to_string(),
            ));
        }
        self.deliveries
            .lock()
            .unwrap()
            .push((callback_url.to_string(), notification.clone()));
        Ok(())
    }
}

/// Alert sink that collects raised messages
#[derive(Default)]
pub struct CollectingAlertSink {
    /// Raised alerts as (instance, message) pairs
    pub alerts: Mutex<Vec<(InstanceId, String)>>,
}

impl CollectingAlertSink {
    /// Create a collecting sink
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertSink for CollectingAlertSink {
    async fn raise(&self, instance_id: &InstanceId, message: &str) -> Result<(), EngineError> {
        self.alerts
            .lock()
            .unwrap()
            .push((instance_id.clone(), message.to_string()));
        Ok(())
    }
}

use crate::application::coordinator::{CoordinatorConfig, ExecutionCoordinator};
use crate::application::ports::TracingEventHandler;
use crate::application::rules::ActionCodeRules;
use crate::application::step_executor::{StepExecutor, StepExecutorConfig};
use crate::domain::flow_definition::{
    FlowDefinition, RetryPolicy, StepConfig, StepDefinition, StepType,
};
use crate::domain::ids::{FlowId, StepCode};
use crate::domain::repository::memory::{
    MemoryCallbackRepository, MemoryFlowDefinitionRepository, MemoryFlowInstanceRepository,
    MemoryJobRepository, MemoryReversalRepository, MemoryStepExecutionRepository,
    MemoryTsqRepository,
};
use std::sync::Arc;

/// A fully wired coordinator over in-memory repositories and a scripted
/// gateway
pub struct Harness {
    /// The coordinator under test
    pub coordinator: ExecutionCoordinator,
    /// Instance store
    pub instances: Arc<MemoryFlowInstanceRepository>,
    /// Definition store
    pub definitions: Arc<MemoryFlowDefinitionRepository>,
    /// Step execution store
    pub executions: Arc<MemoryStepExecutionRepository>,
    /// Callback store
    pub callbacks: Arc<MemoryCallbackRepository>,
    /// TSQ store
    pub tsqs: Arc<MemoryTsqRepository>,
    /// Reversal store
    pub reversals: Arc<MemoryReversalRepository>,
    /// Job store
    pub jobs: Arc<MemoryJobRepository>,
    /// Captured caller notifications
    pub notifier: Arc<CollectingNotifier>,
    /// Captured alerts
    pub alerts: Arc<CollectingAlertSink>,
    /// The scripted external gateway
    pub gateway: Arc<ScriptedGateway>,
}

/// Wire a coordinator harness around a scripted gateway
pub fn harness(gateway: ScriptedGateway) -> Harness {
    let gateway = Arc::new(gateway);
    let definitions = Arc::new(MemoryFlowDefinitionRepository::new());
    let instances = Arc::new(MemoryFlowInstanceRepository::new());
    let executions = Arc::new(MemoryStepExecutionRepository::new());
    let callbacks = Arc::new(MemoryCallbackRepository::new());
    let tsqs = Arc::new(MemoryTsqRepository::new());
    let reversals = Arc::new(MemoryReversalRepository::new());
    let jobs = Arc::new(MemoryJobRepository::new());
    let notifier = Arc::new(CollectingNotifier::new());
    let alerts = Arc::new(CollectingAlertSink::new());

    let executor = Arc::new(StepExecutor::new(
        gateway.clone(),
        alerts.clone(),
        ActionCodeRules::default(),
        StepExecutorConfig::default(),
    ));

    let coordinator = ExecutionCoordinator::new(
        definitions.clone(),
        instances.clone(),
        executions.clone(),
        callbacks.clone(),
        tsqs.clone(),
        reversals.clone(),
        jobs.clone(),
        executor,
        notifier.clone(),
        Arc::new(TracingEventHandler),
        CoordinatorConfig::default(),
    );

    Harness {
        coordinator,
        instances,
        definitions,
        executions,
        callbacks,
        tsqs,
        reversals,
        jobs,
        notifier,
        alerts,
        gateway,
    }
}

/// Build a step definition with the given config
pub fn step(code: &str, step_type: StepType, order: u32, config: StepConfig) -> StepDefinition {
    StepDefinition {
        code: StepCode(code.to_string()),
        name: code.to_string(),
        step_type,
        order_index: order,
        config,
        retry: RetryPolicy::default(),
    }
}

/// Build an API_CALL step pointing at the scripted gateway
pub fn api_call(code: &str, order: u32) -> StepDefinition {
    step(
        code,
        StepType::ApiCall,
        order,
        StepConfig {
            endpoint: Some("https://transfer.example/api".to_string()),
            ..StepConfig::default()
        },
    )
}

/// A START → API_CALL → END flow under the code `TRANSFER`
pub fn two_step_flow(synchronous: bool) -> FlowDefinition {
    FlowDefinition {
        id: FlowId("flow-1".to_string()),
        code: "TRANSFER".to_string(),
        version: 1,
        name: "Transfer".to_string(),
        description: None,
        synchronous,
        steps: vec![
            step("START", StepType::Start, 0, StepConfig::default()),
            api_call("SEND", 1),
            step("END", StepType::End, 2, StepConfig::default()),
        ],
        transitions: vec![],
    }
}
