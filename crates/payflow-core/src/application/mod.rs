//! Application services - the execution engine's moving parts

/// Callback correlation, retries, and timeout sweeps
pub mod callback_matcher;

/// The step-loop coordinator
pub mod coordinator;

/// The durable job queue and workers
pub mod job_queue;

/// Periodic maintenance sweeps
pub mod maintenance;

/// Outbound ports (gateway, notifier, alerts, events)
pub mod ports;

/// Compensating reversal controller
pub mod reversal_controller;

/// Response-code classification rules
pub mod rules;

/// Per-type step execution
pub mod step_executor;

/// Test doubles for the outbound ports
#[cfg(feature = "testing")]
pub mod testing;

/// The field-mapping engine
pub mod transform;

/// Transaction status query controller
pub mod tsq_controller;
