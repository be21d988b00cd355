//! Telemetry consumer and token provider: the external collaborators an
//! [`crate::poller::PollingAppCollector`] calls once per tick to fetch raw
//! container-level envelopes.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::metrics::ContainerEnvelope;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("telemetry endpoint returned status {0}")]
    Status(StatusCode),
}

/// Exposes the current access token presented to the telemetry consumer.
/// Refresh of the underlying token is out of scope for the core; this
/// trait only covers "what is the token right now".
pub trait TokenProvider: Send + Sync {
    fn current_token(&self) -> String;
}

/// A token provider backed by a single static token, the complete
/// implementation of the in-scope contract when refresh is handled
/// elsewhere in the process (or not needed at all, e.g. in tests).
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn current_token(&self) -> String {
        self.token.clone()
    }
}

#[async_trait::async_trait]
pub trait TelemetryConsumer: Send + Sync {
    async fn container_envelopes(
        &self,
        app_id: &str,
        bearer_token: &str,
    ) -> Result<Vec<ContainerEnvelope>, TelemetryError>;
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    instance_index: i32,
    value: String,
    unit: String,
}

pub struct HttpTelemetryConsumer {
    client: Client,
    base_url: String,
    metric_name: String,
}

impl HttpTelemetryConsumer {
    pub fn new(client: Client, base_url: impl Into<String>, metric_name: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            metric_name: metric_name.into(),
        }
    }
}

#[async_trait::async_trait]
impl TelemetryConsumer for HttpTelemetryConsumer {
    async fn container_envelopes(
        &self,
        app_id: &str,
        bearer_token: &str,
    ) -> Result<Vec<ContainerEnvelope>, TelemetryError> {
        let url = format!(
            "{}/v1/apps/{app_id}/metrics/{}",
            self.base_url.trim_end_matches('/'),
            self.metric_name
        );
        let response = self
            .client
            .get(url)
            .header("Authorization", bearer_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TelemetryError::Status(response.status()));
        }

        let envelopes: Vec<WireEnvelope> = response.json().await?;
        Ok(envelopes
            .into_iter()
            .map(|e| ContainerEnvelope {
                instance_index: e.instance_index,
                value: e.value,
                unit: e.unit,
            })
            .collect())
    }
}
