//! Reading types shared by the acquisition bindings, the agent and the sinks

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// GPIO pin a sensor's data line is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(pub u32);

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of reading one sensor, as reported by the acquisition mechanism
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorStatus {
    Ok,
    /// The sensor did not drive the line within the expected window
    Timeout,
    /// A bit period fell outside the valid 0/1 ranges
    Period,
    Checksum,
    /// The mechanism never touched the record
    Unset,
    Other(String),
}

impl SensorStatus {
    pub const CODE_OK: i32 = 0;
    pub const CODE_TIMEOUT: i32 = -1;
    pub const CODE_PERIOD: i32 = -2;
    pub const CODE_CHECKSUM: i32 = -3;
    /// Pre-set before handing records to the library; no real code uses it
    pub const CODE_UNSET: i32 = i32::MIN;

    /// Map a numeric status from the in-process binding
    pub fn from_code(code: i32) -> Self {
        match code {
            Self::CODE_OK => Self::Ok,
            Self::CODE_TIMEOUT => Self::Timeout,
            Self::CODE_PERIOD => Self::Period,
            Self::CODE_CHECKSUM => Self::Checksum,
            Self::CODE_UNSET => Self::Unset,
            other => Self::Other(format!("code {}", other)),
        }
    }

    /// Map a status label from the subprocess binding's JSON output
    pub fn from_label(label: &str) -> Self {
        // "OK" is matched exactly; only it counts as success
        if label == "OK" {
            return Self::Ok;
        }
        match label.to_ascii_uppercase().as_str() {
            "TIMEOUT" => Self::Timeout,
            "PERIOD" => Self::Period,
            "CHECKSUM" => Self::Checksum,
            "UNSET" => Self::Unset,
            _ => Self::Other(label.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Timeout => write!(f, "timeout"),
            Self::Period => write!(f, "bit period out of range"),
            Self::Checksum => write!(f, "checksum mismatch"),
            Self::Unset => write!(f, "not read"),
            Self::Other(label) => write!(f, "{}", label),
        }
    }
}

/// Raw per-sensor result before filtering
#[derive(Debug, Clone, PartialEq)]
pub struct SensorRecord {
    pub sensor: SensorId,
    pub status: SensorStatus,
    pub temperature: f32,
    pub humidity: f32,
}

/// A successful measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub sensor: SensorId,
    /// Degrees Celsius
    pub temperature: f32,
    /// Percent relative humidity
    pub humidity: f32,
}

impl Reading {
    pub fn value(&self, metric: Metric) -> f32 {
        match metric {
            Metric::Temperature => self.temperature,
            Metric::Humidity => self.humidity,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: Temp: {:.1} C, Humidity: {:.1} %",
            self.sensor, self.temperature, self.humidity
        )
    }
}

/// Sensors read successfully in one tick.
///
/// Only built from records whose status is OK, so a missing key always means
/// the sensor could not be read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingSet {
    readings: BTreeMap<SensorId, Reading>,
}

impl ReadingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the OK records, returning the set and the records that were dropped
    pub fn from_records(
        records: impl IntoIterator<Item = SensorRecord>,
    ) -> (Self, Vec<SensorRecord>) {
        let mut set = Self::new();
        let mut failed = Vec::new();
        for record in records {
            if record.status.is_ok() {
                set.readings.insert(
                    record.sensor,
                    Reading {
                        sensor: record.sensor,
                        temperature: record.temperature,
                        humidity: record.humidity,
                    },
                );
            } else {
                failed.push(record);
            }
        }
        (set, failed)
    }

    pub fn get(&self, sensor: SensorId) -> Option<&Reading> {
        self.readings.get(&sensor)
    }

    pub fn contains(&self, sensor: SensorId) -> bool {
        self.readings.contains_key(&sensor)
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    #[cfg(test)]
    pub fn sensors(&self) -> impl Iterator<Item = SensorId> + '_ {
        self.readings.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.readings.values()
    }

    /// Drop every reading whose sensor fails the predicate
    pub fn retain(&mut self, mut keep: impl FnMut(SensorId) -> bool) {
        self.readings.retain(|id, _| keep(*id));
    }
}

/// Quantity published for each reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Temperature,
    Humidity,
}

impl Metric {
    /// Publish order within a reading
    pub const ALL: [Metric; 2] = [Metric::Temperature, Metric::Humidity];

    pub fn name(self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload text for a metric value: the shortest text that parses back to
/// the same `f32`, always with a fractional part
pub fn format_value(value: f32) -> String {
    format!("{:?}", value)
}
