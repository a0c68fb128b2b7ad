//! Configuration for the Payflow gateway
//!
//! Serde defaults layered with `PAYFLOW_*` environment overrides, the
//! same discipline as the engine deployment expects: every knob has a
//! working default, the environment wins.

use payflow_core::{ReversalConfig, StepExecutorConfig, TsqConfig};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

/// Gateway and worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Transfer network endpoint for API_CALL steps without their own
    #[serde(default = "default_transfer_endpoint")]
    pub transfer_endpoint: String,

    /// Status-query endpoint
    #[serde(default = "default_tsq_endpoint")]
    pub tsq_endpoint: String,

    /// Reversal endpoint
    #[serde(default = "default_reversal_endpoint")]
    pub reversal_endpoint: String,

    /// Public base URL injected as the callback address on outbound
    /// calls
    #[serde(default)]
    pub callback_base_url: Option<String>,

    /// Outbound request timeout, seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Callback deadline for suspending steps, seconds
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,

    /// Result-callback delivery attempts
    #[serde(default = "default_notify_attempts")]
    pub notify_max_attempts: u32,

    /// Linear delay between delivery attempts, milliseconds
    #[serde(default = "default_notify_delay")]
    pub notify_retry_delay_ms: u64,

    /// Queue workers to run
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

fn default_transfer_endpoint() -> String {
    "http://localhost:9000/transfer".to_string()
}

fn default_tsq_endpoint() -> String {
    "http://localhost:9000/tsq".to_string()
}

fn default_reversal_endpoint() -> String {
    "http://localhost:9000/reversal".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_callback_timeout() -> u64 {
    300
}

fn default_notify_attempts() -> u32 {
    3
}

fn default_notify_delay() -> u64 {
    2000
}

fn default_worker_count() -> usize {
    4
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            transfer_endpoint: default_transfer_endpoint(),
            tsq_endpoint: default_tsq_endpoint(),
            reversal_endpoint: default_reversal_endpoint(),
            callback_base_url: None,
            request_timeout_secs: default_request_timeout(),
            callback_timeout_secs: default_callback_timeout(),
            notify_max_attempts: default_notify_attempts(),
            notify_retry_delay_ms: default_notify_delay(),
            worker_count: default_worker_count(),
        }
    }
}

impl GatewaySettings {
    /// Load settings: defaults overridden by `PAYFLOW_*` environment
    /// variables
    pub fn load() -> Self {
        let mut settings = Self::default();

        if let Ok(endpoint) = env::var("PAYFLOW_TRANSFER_ENDPOINT") {
            settings.transfer_endpoint = endpoint;
        }
        if let Ok(endpoint) = env::var("PAYFLOW_TSQ_ENDPOINT") {
            settings.tsq_endpoint = endpoint;
        }
        if let Ok(endpoint) = env::var("PAYFLOW_REVERSAL_ENDPOINT") {
            settings.reversal_endpoint = endpoint;
        }
        if let Ok(url) = env::var("PAYFLOW_CALLBACK_BASE_URL") {
            settings.callback_base_url = Some(url);
        }
        if let Ok(value) = env::var("PAYFLOW_REQUEST_TIMEOUT_SECS") {
            match value.parse() {
                Ok(parsed) => settings.request_timeout_secs = parsed,
                Err(_) => warn!("Invalid PAYFLOW_REQUEST_TIMEOUT_SECS value: {}", value),
            }
        }
        if let Ok(value) = env::var("PAYFLOW_CALLBACK_TIMEOUT_SECS") {
            match value.parse() {
                Ok(parsed) => settings.callback_timeout_secs = parsed,
                Err(_) => warn!("Invalid PAYFLOW_CALLBACK_TIMEOUT_SECS value: {}", value),
            }
        }
        if let Ok(value) = env::var("PAYFLOW_WORKER_COUNT") {
            match value.parse() {
                Ok(parsed) => settings.worker_count = parsed,
                Err(_) => warn!("Invalid PAYFLOW_WORKER_COUNT value: {}", value),
            }
        }

        settings
    }

    /// Step executor configuration derived from these settings
    pub fn step_executor_config(&self) -> StepExecutorConfig {
        StepExecutorConfig {
            default_request_timeout: Duration::from_secs(self.request_timeout_secs),
            default_callback_timeout: Duration::from_secs(self.callback_timeout_secs),
            callback_base_url: self.callback_base_url.clone(),
        }
    }

    /// TSQ controller configuration derived from these settings
    pub fn tsq_config(&self) -> TsqConfig {
        TsqConfig {
            endpoint: self.tsq_endpoint.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..TsqConfig::default()
        }
    }

    /// Reversal controller configuration derived from these settings
    pub fn reversal_config(&self) -> ReversalConfig {
        ReversalConfig {
            endpoint: self.reversal_endpoint.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            callback_timeout: Duration::from_secs(self.callback_timeout_secs),
            ..ReversalConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.request_timeout_secs, 30);
        assert_eq!(settings.notify_max_attempts, 3);
        assert_eq!(settings.worker_count, 4);
        assert!(settings.callback_base_url.is_none());
    }

    #[test]
    fn test_derived_configs() {
        let mut settings = GatewaySettings::default();
        settings.tsq_endpoint = "https://net.example/tsq".to_string();
        settings.request_timeout_secs = 10;

        let tsq = settings.tsq_config();
        assert_eq!(tsq.endpoint, "https://net.example/tsq");
        assert_eq!(tsq.request_timeout, Duration::from_secs(10));

        let executor = settings.step_executor_config();
        assert_eq!(executor.default_request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_deserialization_with_partial_fields() {
        let settings: GatewaySettings =
            serde_json::from_str(r#"{"transfer_endpoint": "https://x.example/api"}"#).unwrap();
        assert_eq!(settings.transfer_endpoint, "https://x.example/api");
        // Everything else falls back to defaults
        assert_eq!(settings.worker_count, 4);
    }
}
