//! Sensor acquisition: the bindings to the external DHT22 reader and the
//! batch reader the agent calls once per tick

#[cfg(feature = "library")]
pub mod library;
pub mod subprocess;

use crate::config::AcquisitionConfig;
use crate::error::AcquisitionError;
use crate::model::{ReadingSet, SensorId};
use std::collections::BTreeSet;
use std::time::Duration;

/// Per-sensor share of the batch budget, for each retry
const SECONDS_PER_ATTEMPT: u64 = 2;

/// Transport to the mechanism that reads the sensors.
///
/// One call reads the whole batch, retrying each sensor up to `retries`
/// times internally, and must finish within `timeout`.
#[allow(async_fn_in_trait)]
pub trait SensorAcquirer {
    async fn acquire(
        &self,
        sensors: &[SensorId],
        retries: u32,
        timeout: Duration,
    ) -> Result<ReadingSet, AcquisitionError>;
}

/// Acquisition binding selected by configuration
pub enum Acquirer {
    Subprocess(subprocess::SubprocessAcquirer),
    #[cfg(feature = "library")]
    Library(library::LibraryAcquirer),
}

impl Acquirer {
    /// Build the configured binding, failing if it can never work
    pub fn from_config(config: &AcquisitionConfig) -> anyhow::Result<Self> {
        match config {
            AcquisitionConfig::Subprocess { program, args, .. } => Ok(Self::Subprocess(
                subprocess::SubprocessAcquirer::new(program, args.clone())?,
            )),
            #[cfg(feature = "library")]
            AcquisitionConfig::Library { path, .. } => {
                Ok(Self::Library(library::LibraryAcquirer::load(path)?))
            }
            #[cfg(not(feature = "library"))]
            AcquisitionConfig::Library { .. } => {
                anyhow::bail!("library acquisition requires the `library` feature")
            }
        }
    }
}

impl SensorAcquirer for Acquirer {
    async fn acquire(
        &self,
        sensors: &[SensorId],
        retries: u32,
        timeout: Duration,
    ) -> Result<ReadingSet, AcquisitionError> {
        match self {
            Self::Subprocess(a) => a.acquire(sensors, retries, timeout).await,
            #[cfg(feature = "library")]
            Self::Library(a) => a.acquire(sensors, retries, timeout).await,
        }
    }
}

/// Reads a batch of sensors with a budget scaled to the batch size
pub struct SensorReader<A> {
    acquirer: A,
    retries: u32,
    margin: Duration,
}

impl<A: SensorAcquirer> SensorReader<A> {
    pub fn new(acquirer: A, retries: u32, margin: Duration) -> Self {
        Self {
            acquirer,
            retries,
            margin,
        }
    }

    #[cfg(test)]
    pub(crate) fn acquirer(&self) -> &A {
        &self.acquirer
    }

    /// Time allowed for one batch: 2s per sensor per retry, plus the margin
    pub fn budget(&self, sensors: usize) -> Duration {
        let attempts = sensors as u64 * u64::from(self.retries);
        Duration::from_secs(SECONDS_PER_ATTEMPT * attempts) + self.margin
    }

    /// Read every sensor once, surfacing a failed batch as an error
    pub async fn try_read(&self, sensors: &[SensorId]) -> Result<ReadingSet, AcquisitionError> {
        let requested: BTreeSet<SensorId> = sensors.iter().copied().collect();
        if requested.is_empty() {
            return Ok(ReadingSet::new());
        }
        let ids: Vec<SensorId> = requested.iter().copied().collect();

        let budget = self.budget(ids.len());
        let mut readings = tokio::time::timeout(
            budget,
            self.acquirer.acquire(&ids, self.retries, budget),
        )
        .await
        .map_err(|_| AcquisitionError::Timeout(budget))??;
        readings.retain(|id| requested.contains(&id));
        Ok(readings)
    }

    /// Read every sensor once; a failed batch yields no readings
    pub async fn read(&self, sensors: &[SensorId]) -> ReadingSet {
        match self.try_read(sensors).await {
            Ok(readings) => readings,
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "Sensor acquisition is broken, no readings this tick");
                ReadingSet::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Sensor batch failed, no readings this tick");
                ReadingSet::new()
            }
        }
    }
}

/// Build a reading set from raw records, logging sensors that failed
fn collect_readings(records: Vec<crate::model::SensorRecord>) -> ReadingSet {
    let (readings, failed) = ReadingSet::from_records(records);
    for record in failed {
        tracing::debug!(pin = %record.sensor, status = %record.status, "Sensor read failed");
    }
    readings
}
