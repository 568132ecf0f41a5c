//! Configuration module for the sampling agent
//!
//! Reads configuration from ~/.config/dht-telemetry/config.toml

use crate::model::{Metric, SensorId};
use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent configuration, loaded once at startup and never mutated afterwards
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Minutes between ticks; must divide 60
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
    /// Read attempts per sensor within one acquisition call
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Sleep granularity while waiting for the next tick
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    /// Omitted entirely: the built-in table. Present but empty: no sensors.
    #[serde(default = "default_sensors")]
    pub sensors: Vec<SensorConfig>,
}

fn default_interval_minutes() -> u32 {
    10
}

fn default_retries() -> u32 {
    3
}

fn default_poll_secs() -> u64 {
    10
}

fn default_publish_timeout_secs() -> u64 {
    10
}

fn default_sensors() -> Vec<SensorConfig> {
    vec![SensorConfig {
        pin: SensorId(4),
        destination: Destination::topic("home/garage"),
    }]
}

/// How readings are obtained from the hardware
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AcquisitionConfig {
    /// Run an external program that prints JSON
    Subprocess {
        program: PathBuf,
        /// Arguments placed before `--json`, e.g. when `program` is `sudo`
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_timeout_margin_secs")]
        timeout_margin_secs: u64,
    },
    /// Call `process_sensors` in a shared library
    Library {
        path: PathBuf,
        #[serde(default = "default_timeout_margin_secs")]
        timeout_margin_secs: u64,
    },
}

fn default_timeout_margin_secs() -> u64 {
    5
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self::Subprocess {
            program: PathBuf::from("dht22"),
            args: Vec::new(),
            timeout_margin_secs: default_timeout_margin_secs(),
        }
    }
}

impl AcquisitionConfig {
    pub fn timeout_margin(&self) -> Duration {
        match self {
            Self::Subprocess {
                timeout_margin_secs,
                ..
            }
            | Self::Library {
                timeout_margin_secs,
                ..
            } => Duration::from_secs(*timeout_margin_secs),
        }
    }
}

/// Where readings are delivered
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    Mqtt {
        host: String,
        #[serde(default = "default_mqtt_port")]
        port: u16,
        #[serde(default = "default_client_id")]
        client_id: String,
        #[serde(default = "default_keep_alive_secs")]
        keep_alive_secs: u64,
    },
    Http {
        /// Update endpoint, e.g. https://api.thingspeak.com/update
        url: String,
        #[serde(default = "default_temperature_field")]
        temperature_field: u8,
        #[serde(default = "default_humidity_field")]
        humidity_field: u8,
    },
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "dht-telemetry".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_temperature_field() -> u8 {
    1
}

fn default_humidity_field() -> u8 {
    2
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self::Mqtt {
            host: "hass.lan".to_string(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl SinkConfig {
    fn name(&self) -> &'static str {
        match self {
            Self::Mqtt { .. } => "mqtt",
            Self::Http { .. } => "http",
        }
    }
}

/// One sensor and where its readings go
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorConfig {
    pub pin: SensorId,
    #[serde(flatten)]
    pub destination: Destination,
}

/// Sink-specific identifier for a sensor's readings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Destination {
    /// Base topic; each metric is published below it
    Topic { topic: String },
    /// Write key of a multi-field ingestion channel
    Channel {
        api_key: String,
        #[serde(default)]
        channel: Option<u64>,
    },
}

impl Destination {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self::Topic {
            topic: topic.into(),
        }
    }

    /// Topic a metric is published on, for pub/sub destinations
    pub fn metric_topic(&self, metric: Metric) -> Option<String> {
        match self {
            Self::Topic { topic } => {
                Some(format!("{}/{}", topic.trim_end_matches('/'), metric.name()))
            }
            Self::Channel { .. } => None,
        }
    }

    fn suits(&self, sink: &SinkConfig) -> bool {
        matches!(
            (self, sink),
            (Self::Topic { .. }, SinkConfig::Mqtt { .. })
                | (Self::Channel { .. }, SinkConfig::Http { .. })
        )
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic { topic } => write!(f, "{}", topic),
            // never print the write key
            Self::Channel {
                channel: Some(id), ..
            } => write!(f, "channel {}", id),
            Self::Channel { channel: None, .. } => write!(f, "channel"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            retries: default_retries(),
            poll_secs: default_poll_secs(),
            publish_timeout_secs: default_publish_timeout_secs(),
            acquisition: AcquisitionConfig::default(),
            sink: SinkConfig::default(),
            sensors: default_sensors(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("dht-telemetry").join("config.toml"))
    }

    /// Load config from an explicit path, or from the default location.
    ///
    /// A missing default file yields the built-in defaults; a missing explicit
    /// file and any parse or validation failure are errors.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let Some(path) = Self::path() else {
                    tracing::warn!("Could not determine config directory, using defaults");
                    return Ok(Self::default());
                };
                if !path.exists() {
                    tracing::warn!("No config file found at {:?}, using defaults", path);
                    return Ok(Self::default());
                }
                path
            }
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        tracing::info!("Loaded config from {:?}", path);
        if config.sensors.is_empty() {
            tracing::warn!("No sensors configured in {:?}, nothing will be sampled", path);
        }
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_minutes == 0 || 60 % self.interval_minutes != 0 {
            bail!(
                "interval_minutes must evenly divide 60, got {}",
                self.interval_minutes
            );
        }
        if self.retries == 0 {
            bail!("retries must be at least 1");
        }
        if self.poll_secs == 0 {
            bail!("poll_secs must be at least 1");
        }
        if self.publish_timeout_secs == 0 {
            bail!("publish_timeout_secs must be at least 1");
        }

        match &self.sink {
            SinkConfig::Mqtt {
                keep_alive_secs, ..
            } => {
                if *keep_alive_secs < 5 {
                    bail!("keep_alive_secs must be at least 5, got {}", keep_alive_secs);
                }
            }
            SinkConfig::Http {
                temperature_field,
                humidity_field,
                ..
            } => {
                for field in [temperature_field, humidity_field] {
                    if !(1..=8).contains(field) {
                        bail!("http field slots must be between 1 and 8, got {}", field);
                    }
                }
                if temperature_field == humidity_field {
                    bail!("temperature_field and humidity_field must differ");
                }
            }
        }

        let mut seen = HashSet::new();
        for sensor in &self.sensors {
            if !seen.insert(sensor.pin) {
                bail!("pin {} is configured more than once", sensor.pin);
            }
            if !sensor.destination.suits(&self.sink) {
                bail!(
                    "pin {} has destination {} which does not fit the {} sink",
                    sensor.pin,
                    sensor.destination,
                    self.sink.name()
                );
            }
        }
        Ok(())
    }

    /// Every configured sensor, in pin order
    pub fn sensor_ids(&self) -> Vec<SensorId> {
        let mut ids: Vec<SensorId> = self.sensors.iter().map(|s| s.pin).collect();
        ids.sort();
        ids
    }

    pub fn destinations(&self) -> BTreeMap<SensorId, Destination> {
        self.sensors
            .iter()
            .map(|s| (s.pin, s.destination.clone()))
            .collect()
    }

    pub fn poll_granularity(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}
