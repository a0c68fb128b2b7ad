//! HTTP implementation of the engine's transfer gateway port

use async_trait::async_trait;
use payflow_core::{EngineError, Payload, TransferGateway, TransferRequest, TransferResponse};
use reqwest::{Client, Method};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Gateway that issues outbound transfer calls over HTTP
///
/// Timeouts, connection failures, and 5xx answers map to
/// `EngineError::TransportError`, the retryable class; everything else
/// is handed back for classification by action code.
#[derive(Debug, Clone)]
pub struct HttpTransferGateway {
    client: Client,
}

impl HttpTransferGateway {
    /// Create a gateway with its own connection pool
    pub fn new(connect_timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| EngineError::ConfigurationError(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TransferGateway for HttpTransferGateway {
    async fn execute(&self, request: TransferRequest) -> Result<TransferResponse, EngineError> {
        let method = Method::from_str(&request.method).map_err(|_| {
            EngineError::ConfigurationError(format!("Invalid HTTP method: {}", request.method))
        })?;

        debug!(endpoint = %request.endpoint, method = %method, "Issuing transfer call");

        let response = self
            .client
            .request(method, &request.endpoint)
            .timeout(request.timeout)
            .json(request.body.as_value())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::TransportError(format!(
                        "Request to {} timed out",
                        request.endpoint
                    ))
                } else {
                    EngineError::TransportError(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(EngineError::TransportError(format!(
                "Upstream answered {}",
                status
            )));
        }

        let body: Value = response.json().await.map_err(|e| {
            EngineError::SerializationError(format!("Unparseable response body: {}", e))
        })?;

        Ok(TransferResponse {
            action_code: string_field(&body, &["action_code", "actionCode"]),
            approval_code: string_field(&body, &["approval_code", "approvalCode"]),
            body: Payload::new(body),
        })
    }
}

/// First present string field among the given names; external systems
/// disagree on casing
fn string_field(body: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| body.get(name).and_then(Value::as_str))
        .map(str::to_string)
}
