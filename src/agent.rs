//! The sampling loop: wait for a tick, read every sensor, publish each reading

use crate::config::Config;
use crate::model::{format_value, Metric, ReadingSet};
use crate::scheduler::{Clock, Scheduler, SystemClock};
use crate::sensors::{SensorAcquirer, SensorReader};
use crate::shared::format_duration;
use crate::sinks::{PublishOutcome, Publisher};
use std::sync::Arc;

/// What happened during one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub requested: usize,
    pub read: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct Agent<A, P, C = SystemClock> {
    config: Arc<Config>,
    reader: SensorReader<A>,
    publisher: P,
    scheduler: Scheduler<C>,
}

impl<A: SensorAcquirer, P: Publisher> Agent<A, P> {
    pub fn new(config: Arc<Config>, acquirer: A, publisher: P) -> Self {
        let scheduler = Scheduler::new(config.interval_minutes, config.poll_granularity());
        Self::with_scheduler(config, acquirer, publisher, scheduler)
    }
}

impl<A: SensorAcquirer, P: Publisher, C: Clock> Agent<A, P, C> {
    pub fn with_scheduler(
        config: Arc<Config>,
        acquirer: A,
        publisher: P,
        scheduler: Scheduler<C>,
    ) -> Self {
        let reader = SensorReader::new(
            acquirer,
            config.retries,
            config.acquisition.timeout_margin(),
        );
        Self {
            config,
            reader,
            publisher,
            scheduler,
        }
    }

    /// Run forever, one tick per interval
    pub async fn run(&mut self) {
        tracing::info!(
            "Sampling {} sensor(s) every {} minute(s), first tick at {} (in {})",
            self.config.sensors.len(),
            self.config.interval_minutes,
            self.scheduler.upcoming().format("%H:%M:%S"),
            format_duration(self.scheduler.time_to_next())
        );
        loop {
            let tick = self.scheduler.next_tick().await;
            tracing::info!("Tick {}", tick.format("%Y-%m-%d %H:%M:%S"));
            self.run_tick().await;
        }
    }

    /// Read all sensors once and publish every metric of every reading
    pub async fn run_tick(&mut self) -> TickReport {
        let sensors = self.config.sensor_ids();
        let readings = self.reader.read(&sensors).await;

        let mut report = TickReport {
            requested: sensors.len(),
            read: readings.len(),
            ..TickReport::default()
        };

        if readings.is_empty() && !sensors.is_empty() {
            tracing::warn!("No sensor could be read this tick");
        } else {
            for sensor in sensors.iter().filter(|s| !readings.contains(**s)) {
                tracing::warn!(pin = %sensor, "No reading this tick");
            }
        }

        self.publish_readings(&readings, &mut report).await;

        tracing::info!(
            "Tick done: {}/{} sensors read, {} delivered, {} failed",
            report.read,
            report.requested,
            report.delivered,
            report.failed
        );
        report
    }

    async fn publish_readings(&mut self, readings: &ReadingSet, report: &mut TickReport) {
        let destinations = self.config.destinations();
        for reading in readings.iter() {
            let Some(destination) = destinations.get(&reading.sensor) else {
                continue;
            };
            tracing::info!("{}", reading);

            for metric in Metric::ALL {
                let value = reading.value(metric);
                match self.publisher.publish(destination, metric, value).await {
                    PublishOutcome::Delivered => {
                        report.delivered += 1;
                        tracing::info!("{} {}: {}", destination, metric, format_value(value));
                    }
                    PublishOutcome::Failed(e) => {
                        report.failed += 1;
                        tracing::warn!(
                            code = e.code(),
                            "Failed to publish {} {}: {}",
                            destination,
                            metric,
                            e
                        );
                    }
                }
            }
        }
    }

    /// Release the sink connection
    pub async fn shutdown(&mut self) {
        self.publisher.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Destination, SensorConfig};
    use crate::error::PublishError;
    use crate::model::{SensorId, SensorStatus};
    use crate::scheduler::tests::TokioClock;
    use crate::sensors::tests::{failed, ok, FakeAcquirer};
    use chrono::TimeZone;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Records every publish as (topic, value); fails on chosen topics
    #[derive(Default)]
    struct RecordingPublisher {
        calls: Vec<(String, f32)>,
        stamps: Vec<Instant>,
        fail_on: Vec<String>,
        closed: bool,
    }

    impl Publisher for RecordingPublisher {
        async fn publish(
            &mut self,
            destination: &Destination,
            metric: Metric,
            value: f32,
        ) -> PublishOutcome {
            let topic = destination.metric_topic(metric).unwrap();
            self.calls.push((topic.clone(), value));
            self.stamps.push(Instant::now());
            if self.fail_on.contains(&topic) {
                PublishOutcome::Failed(PublishError::Timeout(Duration::from_secs(10)))
            } else {
                PublishOutcome::Delivered
            }
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    fn config(sensors: &[(u32, &str)]) -> Arc<Config> {
        Arc::new(Config {
            sensors: sensors
                .iter()
                .map(|(pin, topic)| SensorConfig {
                    pin: SensorId(*pin),
                    destination: Destination::topic(*topic),
                })
                .collect(),
            ..Config::default()
        })
    }

    fn agent(
        config: Arc<Config>,
        acquirer: FakeAcquirer,
        publisher: RecordingPublisher,
    ) -> Agent<FakeAcquirer, RecordingPublisher> {
        Agent::new(config, acquirer, publisher)
    }

    #[tokio::test]
    async fn test_two_publishes_per_reading() {
        let mut agent = agent(
            config(&[(4, "home/garage")]),
            FakeAcquirer::with(vec![ok(4, 21.5, 55.0)]),
            RecordingPublisher::default(),
        );

        let report = agent.run_tick().await;

        assert_eq!(
            agent.publisher.calls,
            vec![
                ("home/garage/temperature".to_string(), 21.5),
                ("home/garage/humidity".to_string(), 55.0),
            ]
        );
        assert_eq!(
            report,
            TickReport {
                requested: 1,
                read: 1,
                delivered: 2,
                failed: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stop_tick() {
        let publisher = RecordingPublisher {
            fail_on: vec!["home/garage/temperature".to_string()],
            ..RecordingPublisher::default()
        };
        let mut agent = agent(
            config(&[(4, "home/garage"), (17, "home/bedroom")]),
            FakeAcquirer::with(vec![ok(4, 21.5, 55.0), ok(17, 19.0, 61.0)]),
            publisher,
        );

        let report = agent.run_tick().await;

        let topics: Vec<&str> = agent.publisher.calls.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(
            topics,
            [
                "home/garage/temperature",
                "home/garage/humidity",
                "home/bedroom/temperature",
                "home/bedroom/humidity",
            ]
        );
        assert_eq!(report.delivered, 3);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_unread_sensor_is_skipped() {
        let mut agent = agent(
            config(&[(4, "home/garage"), (17, "home/bedroom")]),
            FakeAcquirer::with(vec![ok(4, 21.5, 55.0), failed(17, SensorStatus::Checksum)]),
            RecordingPublisher::default(),
        );

        let report = agent.run_tick().await;

        assert!(agent
            .publisher
            .calls
            .iter()
            .all(|(topic, _)| topic.starts_with("home/garage/")));
        assert_eq!(report.read, 1);
        assert_eq!(report.requested, 2);
    }

    #[tokio::test]
    async fn test_failed_batch_publishes_nothing() {
        let mut agent = agent(
            config(&[(4, "home/garage")]),
            FakeAcquirer::failing(),
            RecordingPublisher::default(),
        );

        let report = agent.run_tick().await;

        assert!(agent.publisher.calls.is_empty());
        assert_eq!(report.read, 0);
        // the next tick still runs
        agent.run_tick().await;
        assert_eq!(agent.reader_calls(), 2);
    }

    #[tokio::test]
    async fn test_no_sensors_no_publishes() {
        let mut agent = agent(
            config(&[]),
            FakeAcquirer::with(vec![ok(4, 21.5, 55.0)]),
            RecordingPublisher::default(),
        );

        let report = agent.run_tick().await;

        assert!(agent.publisher.calls.is_empty());
        assert_eq!(report, TickReport::default());
        assert_eq!(agent.reader_calls(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sink() {
        let mut agent = agent(
            config(&[(4, "home/garage")]),
            FakeAcquirer::with(vec![]),
            RecordingPublisher::default(),
        );
        agent.shutdown().await;
        assert!(agent.publisher.closed);
    }

    /// Agent whose clock starts at 09:55:30 local time and follows tokio's paused time
    fn clocked(
        config: Arc<Config>,
        acquirer: FakeAcquirer,
        publisher: RecordingPublisher,
    ) -> Agent<FakeAcquirer, RecordingPublisher, TokioClock> {
        let origin = chrono::Local
            .with_ymd_and_hms(2024, 6, 1, 9, 55, 30)
            .single()
            .unwrap();
        let scheduler = Scheduler::with_clock(
            TokioClock::at(origin),
            config.interval_minutes,
            config.poll_granularity(),
        );
        Agent::with_scheduler(config, acquirer, publisher, scheduler)
    }

    /// Let the agent loop run for `minutes` of paused time
    async fn run_for(
        agent: &mut Agent<FakeAcquirer, RecordingPublisher, TokioClock>,
        minutes: u64,
    ) {
        let stopped =
            tokio::time::timeout(Duration::from_secs(minutes * 60), agent.run()).await;
        assert!(stopped.is_err(), "the loop never returns on its own");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_on_each_boundary() {
        let started = Instant::now();
        let mut agent = clocked(
            config(&[(4, "home/garage")]),
            FakeAcquirer::with(vec![ok(4, 21.5, 55.0)]),
            RecordingPublisher::default(),
        );

        run_for(&mut agent, 25).await;

        // boundaries at 10:00, 10:10 and 10:20, two metrics each
        assert_eq!(agent.publisher.calls.len(), 6);
        assert_eq!(agent.reader_calls(), 3);
        let offsets: Vec<u64> = agent
            .publisher
            .stamps
            .iter()
            .step_by(2)
            .map(|at| (*at - started).as_secs())
            .collect();
        assert_eq!(offsets, [270, 870, 1470]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ticks_keep_the_loop_going() {
        let mut agent = clocked(
            config(&[(4, "home/garage")]),
            FakeAcquirer::failing(),
            RecordingPublisher::default(),
        );
        run_for(&mut agent, 25).await;
        assert!(agent.publisher.calls.is_empty());
        assert_eq!(agent.reader_calls(), 3);

        let publisher = RecordingPublisher {
            fail_on: vec![
                "home/garage/temperature".to_string(),
                "home/garage/humidity".to_string(),
            ],
            ..RecordingPublisher::default()
        };
        let mut agent = clocked(
            config(&[(4, "home/garage")]),
            FakeAcquirer::with(vec![ok(4, 21.5, 55.0)]),
            publisher,
        );
        run_for(&mut agent, 25).await;
        assert_eq!(agent.publisher.calls.len(), 6);
        assert_eq!(agent.reader_calls(), 3);
    }

    impl<C: Clock> Agent<FakeAcquirer, RecordingPublisher, C> {
        fn reader_calls(&self) -> usize {
            self.reader
                .acquirer()
                .calls
                .load(std::sync::atomic::Ordering::SeqCst)
        }
    }
}
