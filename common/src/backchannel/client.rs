// Back-channel client used by child processes

use super::messages::BackChannelMessage;
use crate::errors::BackChannelError;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends messages about one job run to the executor
#[derive(Debug, Clone)]
pub struct BackChannelClient {
    http: reqwest::Client,
    endpoint: reqwest::Url,
    correlation_id: Uuid,
}

impl BackChannelClient {
    pub fn new(base_url: &str, correlation_id: Uuid) -> Result<Self, BackChannelError> {
        let base = reqwest::Url::parse(base_url)
            .map_err(|e| BackChannelError::InvalidAddress(format!("{}: {}", base_url, e)))?;
        let endpoint = base
            .join(&format!("jobruns/{}/messages", correlation_id))
            .map_err(|e| BackChannelError::InvalidAddress(format!("{}: {}", base_url, e)))?;

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackChannelError::RequestFailed(e.to_string()))?;

        Ok(Self {
            http,
            endpoint,
            correlation_id,
        })
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    #[instrument(skip(self), fields(correlation_id = %self.correlation_id, kind = message.kind()))]
    pub async fn send(&self, message: BackChannelMessage) -> Result<(), BackChannelError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&message)
            .send()
            .await
            .map_err(|e| BackChannelError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackChannelError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        debug!(status = status.as_u16(), "Back-channel message delivered");
        Ok(())
    }

    pub async fn started(&self) -> Result<(), BackChannelError> {
        self.send(BackChannelMessage::Started).await
    }

    pub async fn progress(&self, percent: f64) -> Result<(), BackChannelError> {
        self.send(BackChannelMessage::Progress { percent }).await
    }

    pub async fn ended(&self, exit_code: i32) -> Result<(), BackChannelError> {
        self.send(BackChannelMessage::Ended { exit_code }).await
    }
}
