//! Telemetry sinks - one publish per metric, no retries

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "mqtt")]
pub mod mqtt;

use crate::config::{Config, Destination, SinkConfig};
use crate::error::PublishError;
use crate::model::Metric;

/// Result of a single publish attempt
#[derive(Debug)]
pub enum PublishOutcome {
    Delivered,
    Failed(PublishError),
}

impl PublishOutcome {
    #[cfg(test)]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

impl<E: Into<PublishError>> From<Result<(), E>> for PublishOutcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Delivered,
            Err(e) => Self::Failed(e.into()),
        }
    }
}

/// Delivers metric values to a sink.
///
/// Each call sends exactly one message or request and never retries.
#[allow(async_fn_in_trait)]
pub trait Publisher {
    async fn publish(
        &mut self,
        destination: &Destination,
        metric: Metric,
        value: f32,
    ) -> PublishOutcome;

    /// Release the sink connection
    async fn close(&mut self) {}
}

/// Sink selected by configuration
pub enum Sink {
    #[cfg(feature = "mqtt")]
    Mqtt(mqtt::MqttPublisher),
    #[cfg(feature = "http")]
    Http(http::HttpPublisher),
}

impl Sink {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let timeout = config.publish_timeout();
        match &config.sink {
            #[cfg(feature = "mqtt")]
            SinkConfig::Mqtt {
                host,
                port,
                client_id,
                keep_alive_secs,
            } => Ok(Self::Mqtt(mqtt::MqttPublisher::connect(
                host,
                *port,
                client_id,
                std::time::Duration::from_secs(*keep_alive_secs),
                timeout,
            ))),
            #[cfg(feature = "http")]
            SinkConfig::Http {
                url,
                temperature_field,
                humidity_field,
            } => Ok(Self::Http(http::HttpPublisher::new(
                url,
                http::FieldSlots {
                    temperature: *temperature_field,
                    humidity: *humidity_field,
                },
                timeout,
            )?)),
            #[allow(unreachable_patterns)]
            other => anyhow::bail!("sink {:?} is not enabled in this build", other),
        }
    }
}

impl Publisher for Sink {
    async fn publish(
        &mut self,
        destination: &Destination,
        metric: Metric,
        value: f32,
    ) -> PublishOutcome {
        match self {
            #[cfg(feature = "mqtt")]
            Self::Mqtt(p) => p.publish(destination, metric, value).await,
            #[cfg(feature = "http")]
            Self::Http(p) => p.publish(destination, metric, value).await,
            #[allow(unreachable_patterns)]
            _ => PublishOutcome::Failed(PublishError::UnsupportedDestination(
                destination.to_string(),
            )),
        }
    }

    async fn close(&mut self) {
        match self {
            #[cfg(feature = "mqtt")]
            Self::Mqtt(p) => p.close().await,
            #[cfg(feature = "http")]
            Self::Http(p) => p.close().await,
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_outcome_from_result() {
        let ok: Result<(), PublishError> = Ok(());
        assert!(PublishOutcome::from(ok).is_delivered());

        let failed: Result<(), PublishError> = Err(PublishError::Timeout(Duration::from_secs(10)));
        match PublishOutcome::from(failed) {
            PublishOutcome::Failed(PublishError::Timeout(t)) => {
                assert_eq!(t, Duration::from_secs(10))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
