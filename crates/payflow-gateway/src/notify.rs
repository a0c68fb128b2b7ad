//! Result-callback delivery to the originating caller
//!
//! Delivery is at-least-once: transport failures and non-2xx answers
//! retry with a linear delay inside one notify call; the coordinator's
//! `callback_sent` flag dedupes across calls once a delivery is
//! acknowledged.

use async_trait::async_trait;
use payflow_core::{CallerNotifier, EngineError, Payload};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP caller notifier with bounded linear retry
#[derive(Debug, Clone)]
pub struct HttpCallerNotifier {
    client: Client,
    max_attempts: u32,
    retry_delay: Duration,
    request_timeout: Duration,
}

impl HttpCallerNotifier {
    /// Create a notifier
    pub fn new(
        max_attempts: u32,
        retry_delay: Duration,
        request_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = Client::builder()
            .build()
            .map_err(|e| EngineError::ConfigurationError(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            max_attempts: max_attempts.max(1),
            retry_delay,
            request_timeout,
        })
    }
}

#[async_trait]
impl CallerNotifier for HttpCallerNotifier {
    async fn notify(
        &self,
        callback_url: &str,
        notification: &Payload,
    ) -> Result<(), EngineError> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            let result = self
                .client
                .post(callback_url)
                .timeout(self.request_timeout)
                .json(notification.as_value())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %callback_url, attempt, "Result callback acknowledged");
                    return Ok(());
                }
                Ok(response) => {
                    last_error = format!("receiver answered {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            warn!(
                url = %callback_url,
                attempt,
                max_attempts = self.max_attempts,
                error = %last_error,
                "Result callback delivery attempt failed"
            );

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
        }

        Err(EngineError::TransportError(format!(
            "Result callback to {} failed after {} attempts: {}",
            callback_url, self.max_attempts, last_error
        )))
    }
}
