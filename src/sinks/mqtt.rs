//! MQTT sink
//!
//! One client is kept for the life of the process. Its event loop runs on a
//! background task which owns the broker connection and reconnects after
//! errors; publishing only hands messages to that task.

use super::{PublishOutcome, Publisher};
use crate::config::Destination;
use crate::error::PublishError;
use crate::model::{format_value, Metric};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Messages the client buffers before publishing blocks
const QUEUE_CAPACITY: usize = 10;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub struct MqttPublisher {
    client: AsyncClient,
    driver: JoinHandle<()>,
    timeout: Duration,
}

impl MqttPublisher {
    /// Create the client and start its event loop; the connection itself is
    /// established (and re-established) in the background
    pub fn connect(
        host: &str,
        port: u16,
        client_id: &str,
        keep_alive: Duration,
        timeout: Duration,
    ) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(keep_alive);

        let (client, eventloop) = AsyncClient::new(options, QUEUE_CAPACITY);
        tracing::info!("Publishing to mqtt://{}:{}", host, port);
        Self {
            client,
            driver: tokio::spawn(drive(eventloop)),
            timeout,
        }
    }
}

async fn drive(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::info!("Connected to broker ({:?})", ack.code);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                tracing::debug!(pkid = ack.pkid, "Broker acknowledged publish");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!("Disconnected from broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Broker connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

impl Publisher for MqttPublisher {
    async fn publish(
        &mut self,
        destination: &Destination,
        metric: Metric,
        value: f32,
    ) -> PublishOutcome {
        let Some(topic) = destination.metric_topic(metric) else {
            return PublishOutcome::Failed(PublishError::UnsupportedDestination(
                destination.to_string(),
            ));
        };

        let send = self
            .client
            .publish(topic, QoS::AtLeastOnce, false, format_value(value));
        match tokio::time::timeout(self.timeout, send).await {
            Ok(result) => result.into(),
            Err(_) => PublishOutcome::Failed(PublishError::Timeout(self.timeout)),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!("Disconnect request not queued: {}", e);
        }
        if tokio::time::timeout(CLOSE_GRACE, &mut self.driver).await.is_err() {
            self.driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A local port nothing listens on; the client keeps failing to connect
    fn unreachable() -> MqttPublisher {
        MqttPublisher::connect(
            "127.0.0.1",
            1,
            "dht-telemetry-test",
            Duration::from_secs(60),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_publish_is_local_handoff() {
        let mut publisher = unreachable();
        let outcome = publisher
            .publish(&Destination::topic("home/garage"), Metric::Temperature, 21.5)
            .await;
        assert!(outcome.is_delivered(), "{:?}", outcome);
        publisher.close().await;
    }

    #[tokio::test]
    async fn test_invalid_topic_fails() {
        let mut publisher = unreachable();
        let outcome = publisher
            .publish(&Destination::topic("home/+"), Metric::Humidity, 55.0)
            .await;
        assert!(matches!(
            outcome,
            PublishOutcome::Failed(PublishError::Mqtt(_))
        ));
        publisher.close().await;
    }

    #[tokio::test]
    async fn test_channel_destination_is_rejected() {
        let mut publisher = unreachable();
        let destination = Destination::Channel {
            api_key: "KEY".into(),
            channel: None,
        };
        let outcome = publisher.publish(&destination, Metric::Humidity, 55.0).await;
        assert!(matches!(
            outcome,
            PublishOutcome::Failed(PublishError::UnsupportedDestination(_))
        ));
        publisher.close().await;
    }
}
