//!
//! Payflow Core - the execution engine for the Payflow orchestration
//! platform
//!
//! Payment transactions are defined as directed flow graphs of steps;
//! this crate turns a flow definition into a running instance under
//! concurrent, crash-tolerant processing: the step-execution state
//! machine, the lease-based job queue that drives it, callback
//! matching with timeout detection, the transaction-status-query
//! retry machine, and the compensating-reversal controller.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - core business models, entities, and rules
pub mod domain;

/// Application services - the engine's moving parts
pub mod application;

/// Core types
pub mod types;

/// Error types
pub mod error;

// Re-export key types
pub use error::EngineError;
pub use types::Payload;

pub use domain::callback::{
    CorrelationKey, ExpectedCallback, ExpectedCallbackStatus, ReceivedCallback,
};
pub use domain::condition::Condition;
pub use domain::flow_definition::{
    FieldMapping, FlowDefinition, RetryPolicy, StepConfig, StepDefinition, StepType, TaskKind,
    TransformFn, TransformOp, Transition,
};
pub use domain::flow_graph::FlowGraph;
pub use domain::flow_instance::{FlowInstance, InstanceStatus};
pub use domain::ids::{
    CallbackId, FlowId, InstanceId, JobId, ReversalId, StepCode, StepExecutionId, TsqId,
};
pub use domain::job::{Job, JobStatus, JobType};
pub use domain::repository::{
    CallbackRepository, FlowDefinitionRepository, FlowInstanceRepository, JobRepository,
    ReversalRepository, StepExecutionRepository, TsqRepository,
};
pub use domain::reversal::{ReversalRequest, ReversalStatus, ReversalType};
pub use domain::step_execution::{StepExecution, StepExecutionStatus};
pub use domain::tsq::{TsqRequest, TsqStatus};

pub use application::callback_matcher::{CallbackMatcher, MatchOutcome};
pub use application::coordinator::{
    CoordinatorConfig, CreateInstance, CreateOutcome, ExecutionCoordinator,
};
pub use application::job_queue::{JobQueueConfig, JobQueueService, JobWorker};
pub use application::maintenance::{MaintenanceConfig, MaintenanceRunner};
pub use application::ports::{
    AlertSink, CallerNotifier, DomainEventHandler, TracingAlertSink, TracingEventHandler,
    TransferGateway, TransferRequest, TransferResponse,
};
pub use application::reversal_controller::{ReversalConfig, ReversalController};
pub use application::rules::{ActionCodeRules, TsqClass, TsqRules};
pub use application::step_executor::{StepExecutor, StepExecutorConfig, StepOutcome};
pub use application::tsq_controller::{TsqConfig, TsqController};
