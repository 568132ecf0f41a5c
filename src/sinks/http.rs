//! HTTP ingestion sink (ThingSpeak-style update endpoint)
//!
//! Each publish is one GET carrying the channel write key and a single field.
//! Response status codes are logged but not interpreted.

use super::{PublishOutcome, Publisher};
use crate::config::Destination;
use crate::error::PublishError;
use crate::model::{format_value, Metric};
use std::time::Duration;

/// Channel field each metric is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlots {
    pub temperature: u8,
    pub humidity: u8,
}

impl FieldSlots {
    fn field(&self, metric: Metric) -> String {
        let slot = match metric {
            Metric::Temperature => self.temperature,
            Metric::Humidity => self.humidity,
        };
        format!("field{}", slot)
    }
}

pub struct HttpPublisher {
    client: reqwest::Client,
    url: String,
    slots: FieldSlots,
    timeout: Duration,
}

impl HttpPublisher {
    pub fn new(url: &str, slots: FieldSlots, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        tracing::info!("Publishing to {}", url);
        Ok(Self::with_client(client, url, slots, timeout))
    }

    pub fn with_client(
        client: reqwest::Client,
        url: &str,
        slots: FieldSlots,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            url: url.to_string(),
            slots,
            timeout,
        }
    }

    async fn send(&self, api_key: &str, metric: Metric, value: f32) -> Result<(), PublishError> {
        let field = self.slots.field(metric);
        let payload = format_value(value);

        let response = self
            .client
            .get(&self.url)
            .query(&[("api_key", api_key), (field.as_str(), payload.as_str())])
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(e))?;
        tracing::debug!(%status, body = body.trim(), "Ingestion endpoint replied");
        Ok(())
    }

    fn classify(&self, error: reqwest::Error) -> PublishError {
        if error.is_timeout() {
            PublishError::Timeout(self.timeout)
        } else {
            PublishError::Http(error)
        }
    }
}

impl Publisher for HttpPublisher {
    async fn publish(
        &mut self,
        destination: &Destination,
        metric: Metric,
        value: f32,
    ) -> PublishOutcome {
        match destination {
            Destination::Channel { api_key, .. } => self.send(api_key, metric, value).await.into(),
            Destination::Topic { .. } => PublishOutcome::Failed(
                PublishError::UnsupportedDestination(destination.to_string()),
            ),
        }
    }
}
