use thiserror::Error;

/// Core error type for the Payflow engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Flow definition not found
    #[error("Flow definition not found: {0}")]
    FlowDefinitionNotFound(String),

    /// Flow instance not found
    #[error("Flow instance not found: {0}")]
    InstanceNotFound(String),

    /// Step not found in a flow definition
    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// Missing or invalid configuration; fatal to the instance, never retried
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Transient external failure (timeout, connection, 5xx); retryable
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Definite business failure reported by the external system
    #[error("Business failure: {0}")]
    BusinessFailure(String),

    /// Step execution error
    #[error("Step execution error: {0}")]
    StepExecutionError(String),

    /// Flow execution error (bad state transition, ceiling exceeded)
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Job queue error
    #[error("Job queue error: {0}")]
    JobQueueError(String),

    /// Callback correlation error
    #[error("Callback error: {0}")]
    CallbackError(String),

    /// Transaction status query error
    #[error("TSQ error: {0}")]
    TsqError(String),

    /// Reversal error
    #[error("Reversal error: {0}")]
    ReversalError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Whether a step or job hitting this error may be retried.
    ///
    /// Configuration and validation errors are fatal; a definite business
    /// "no" is terminal. Everything else is assumed transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            EngineError::ConfigurationError(_)
                | EngineError::ValidationError(_)
                | EngineError::BusinessFailure(_)
                | EngineError::FlowDefinitionNotFound(_)
                | EngineError::StepNotFound(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IOError(err.to_string())
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                EngineError::FlowDefinitionNotFound("transfer".to_string()),
                "Flow definition not found: transfer",
            ),
            (
                EngineError::InstanceNotFound("inst-1".to_string()),
                "Flow instance not found: inst-1",
            ),
            (
                EngineError::ConfigurationError("no endpoint".to_string()),
                "Configuration error: no endpoint",
            ),
            (
                EngineError::TransportError("timed out".to_string()),
                "Transport error: timed out",
            ),
            (
                EngineError::BusinessFailure("declined".to_string()),
                "Business failure: declined",
            ),
            (EngineError::Other("other".to_string()), "other"),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::TransportError("conn refused".into()).is_retryable());
        assert!(EngineError::StepExecutionError("boom".into()).is_retryable());
        assert!(!EngineError::ConfigurationError("missing url".into()).is_retryable());
        assert!(!EngineError::BusinessFailure("hard decline".into()).is_retryable());
        assert!(!EngineError::ValidationError("bad field".into()).is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let error: EngineError = json_error.into();

        match error {
            EngineError::SerializationError(msg) => assert!(msg.contains("expected")),
            _ => panic!("Expected SerializationError variant"),
        }
    }

    #[test]
    fn test_from_string() {
        let error: EngineError = "test message".into();
        match error {
            EngineError::Other(msg) => assert_eq!(msg, "test message"),
            _ => panic!("Expected Other variant"),
        }
    }
}
