//! HTTP confirmation sender
//!
//! Posts the completion notification as JSON to the source system's
//! callback endpoint. 4xx responses are treated as retryable too: the
//! confirmation ceiling, not the status class, bounds the attempts.

use std::time::Duration;

use async_trait::async_trait;
use rc_common::{CoreError, Result};
use tracing::{debug, warn};

use crate::{Confirmation, ConfirmationSender};

#[derive(Debug, Clone)]
pub struct HttpSenderConfig {
    /// Callback endpoint of the source system
    pub target_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpSenderConfig {
    fn default() -> Self {
        Self {
            target_url: "http://localhost:8080/confirmations".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpConfirmationSender {
    config: HttpSenderConfig,
    client: reqwest::Client,
}

impl HttpConfirmationSender {
    pub fn new(config: HttpSenderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CoreError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ConfirmationSender for HttpConfirmationSender {
    async fn send(&self, confirmation: &Confirmation) -> Result<()> {
        debug!(
            correlation_id = %confirmation.correlation_id,
            url = %self.config.target_url,
            "Sending confirmation"
        );

        let response = self
            .client
            .post(&self.config.target_url)
            .json(confirmation)
            .send()
            .await
            .map_err(|e| CoreError::Integration(format!("confirmation request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(
                correlation_id = %confirmation.correlation_id,
                status = %status,
                "Confirmation rejected"
            );
            Err(CoreError::Integration(format!(
                "confirmation rejected with HTTP {}: {}",
                status, body
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_common::MsgState;

    #[test]
    fn test_confirmation_payload_shape() {
        let confirmation = Confirmation {
            correlation_id: "corr-1".to_string(),
            source_system: "crm".to_string(),
            service: "customer".to_string(),
            state: MsgState::Ok,
        };
        let json = serde_json::to_value(&confirmation).unwrap();
        assert_eq!(json["correlationId"], "corr-1");
        assert_eq!(json["sourceSystem"], "crm");
        assert_eq!(json["state"], "OK");
    }

    #[test]
    fn test_failed_state_serializes_in_state_vocabulary() {
        let confirmation = Confirmation {
            correlation_id: "corr-2".to_string(),
            source_system: "crm".to_string(),
            service: "customer".to_string(),
            state: MsgState::Failed,
        };
        let json = serde_json::to_value(&confirmation).unwrap();
        assert_eq!(json["state"], "FAILED");
    }

    #[test]
    fn test_sender_builds_from_default_config() {
        assert!(HttpConfirmationSender::new(HttpSenderConfig::default()).is_ok());
    }
}
