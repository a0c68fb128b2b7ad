//! Outbound ports of the engine
//!
//! The engine never performs I/O directly; gateways, notifiers, and
//! alert sinks are implemented by edge crates against these traits.

use crate::domain::events::DomainEvent;
use crate::domain::ids::InstanceId;
use crate::types::Payload;
use crate::EngineError;
use async_trait::async_trait;
use std::time::Duration;

/// An outbound request to the external transfer network
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Target endpoint
    pub endpoint: String,

    /// HTTP method
    pub method: String,

    /// Request body
    pub body: Payload,

    /// Bounded request timeout, distinct from any callback deadline
    pub timeout: Duration,
}

impl TransferRequest {
    /// A POST request with the given body and timeout
    pub fn post(endpoint: impl Into<String>, body: Payload, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: "POST".to_string(),
            body,
            timeout,
        }
    }
}

/// The external system's answer
#[derive(Debug, Clone)]
pub struct TransferResponse {
    /// Action code, when present
    pub action_code: Option<String>,

    /// Approval code, when present
    pub approval_code: Option<String>,

    /// Full response body
    pub body: Payload,
}

impl TransferResponse {
    /// Action code as a borrowed str
    pub fn action_code(&self) -> Option<&str> {
        self.action_code.as_deref()
    }
}

/// Issues outbound calls to external transfer systems
///
/// Implementations return `EngineError::TransportError` for timeouts,
/// connection failures, and 5xx answers; those are the retryable class.
#[async_trait]
pub trait TransferGateway: Send + Sync {
    /// Execute one outbound call
    async fn execute(&self, request: TransferRequest) -> Result<TransferResponse, EngineError>;
}

/// Delivers the flow result back to the originating caller
///
/// `Ok(())` means the receiver acknowledged the delivery (2xx);
/// at-least-once retry on transport failure is the implementation's
/// responsibility.
#[async_trait]
pub trait CallerNotifier: Send + Sync {
    /// POST the result notification to the caller's callback URL
    async fn notify(&self, callback_url: &str, notification: &Payload)
        -> Result<(), EngineError>;
}

/// Raises operator-facing alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Raise an alert for an instance
    async fn raise(&self, instance_id: &InstanceId, message: &str) -> Result<(), EngineError>;
}

/// Handler for drained domain events
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    async fn handle(&self, event: Box<dyn DomainEvent>) -> Result<(), EngineError>;
}

/// Event handler that writes the process log through `tracing`
#[derive(Debug, Default)]
pub struct TracingEventHandler;

#[async_trait]
impl DomainEventHandler for TracingEventHandler {
    async fn handle(&self, event: Box<dyn DomainEvent>) -> Result<(), EngineError> {
        tracing::info!(
            instance_id = %event.instance_id(),
            event = event.event_type(),
            "process log"
        );
        Ok(())
    }
}

/// Alert sink that logs at warn level; the default when no paging
/// integration is wired in
#[derive(Debug, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, instance_id: &InstanceId, message: &str) -> Result<(), EngineError> {
        tracing::warn!(instance_id = %instance_id, alert = message, "alert raised");
        Ok(())
    }
}
