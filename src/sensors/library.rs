//! Acquisition through the native sensor library
//!
//! The library exports
//! `void process_sensors(int n, struct sensor *sensors, int retries)` and
//! fills each record in place.

use super::{collect_readings, SensorAcquirer};
use crate::error::AcquisitionError;
use crate::model::{ReadingSet, SensorId, SensorRecord, SensorStatus};
use libloading::{Library, Symbol};
use std::os::raw::{c_float, c_int};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ENTRY_POINT: &[u8] = b"process_sensors";

/// Mirrors `struct sensor` in the library
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawSensor {
    pub pin: c_int,
    pub status: c_int,
    pub temp: c_float,
    pub humidity: c_float,
}

impl RawSensor {
    pub fn unset(sensor: SensorId) -> Self {
        Self {
            pin: sensor.0 as c_int,
            status: SensorStatus::CODE_UNSET,
            temp: 0.0,
            humidity: 0.0,
        }
    }
}

impl From<RawSensor> for SensorRecord {
    fn from(raw: RawSensor) -> Self {
        SensorRecord {
            sensor: SensorId(raw.pin as u32),
            status: SensorStatus::from_code(raw.status),
            temperature: raw.temp,
            humidity: raw.humidity,
        }
    }
}

type ProcessSensors = unsafe extern "C" fn(c_int, *mut RawSensor, c_int);

/// Fills the records in place, blocking until every sensor has been tried
type EntryPoint = Box<dyn FnMut(&mut [RawSensor], u32) -> Result<(), libloading::Error> + Send>;

pub struct LibraryAcquirer {
    path: PathBuf,
    // held for the whole call so a call that outlived its budget never overlaps the next
    entry: Arc<Mutex<EntryPoint>>,
}

impl LibraryAcquirer {
    /// Load the library and check that it exports the entry point
    pub fn load(path: &Path) -> Result<Self, AcquisitionError> {
        let library_error = |source| AcquisitionError::Library {
            path: path.to_path_buf(),
            source,
        };

        // SAFETY: loading runs the library's initialisers; the configured
        // library is the sensor reader built for this host.
        let library = unsafe { Library::new(path) }.map_err(library_error)?;
        // SAFETY: only the presence of the symbol is checked here.
        unsafe { library.get::<ProcessSensors>(ENTRY_POINT) }.map_err(library_error)?;

        tracing::info!("Loaded sensor library {:?}", path);
        Ok(Self::with_entry(
            path.to_path_buf(),
            move |records: &mut [RawSensor], retries| process_sensors(&library, records, retries),
        ))
    }

    fn with_entry(
        path: PathBuf,
        entry: impl FnMut(&mut [RawSensor], u32) -> Result<(), libloading::Error> + Send + 'static,
    ) -> Self {
        Self {
            path,
            entry: Arc::new(Mutex::new(Box::new(entry))),
        }
    }
}

/// Run the entry point over `records`, blocking until the library returns
fn process_sensors(
    library: &Library,
    records: &mut [RawSensor],
    retries: u32,
) -> Result<(), libloading::Error> {
    // SAFETY: the signature matches the library's declaration and the slice
    // stays valid and exclusively borrowed for the duration of the call.
    unsafe {
        let entry: Symbol<ProcessSensors> = library.get(ENTRY_POINT)?;
        entry(
            records.len() as c_int,
            records.as_mut_ptr(),
            retries.min(c_int::MAX as u32) as c_int,
        );
    }
    Ok(())
}

impl SensorAcquirer for LibraryAcquirer {
    async fn acquire(
        &self,
        sensors: &[SensorId],
        retries: u32,
        timeout: Duration,
    ) -> Result<ReadingSet, AcquisitionError> {
        let entry = Arc::clone(&self.entry);
        let path = self.path.clone();
        let mut records: Vec<RawSensor> = sensors.iter().copied().map(RawSensor::unset).collect();

        let task = tokio::task::spawn_blocking(move || {
            let mut guard = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let process = &mut *guard;
            process(records.as_mut_slice(), retries)
                .map(|()| records)
                .map_err(|source| AcquisitionError::Library { path, source })
        });

        // a call that overruns keeps its blocking thread; only the tick gives up on it
        let records = match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined??,
            Err(_) => return Err(AcquisitionError::Timeout(timeout)),
        };

        Ok(collect_readings(
            records.into_iter().map(SensorRecord::from).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_missing_library_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = LibraryAcquirer::load(&dir.path().join("dht22.so"))
            .err()
            .unwrap();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("dht22.so"));
    }

    #[test]
    fn test_records_start_unset() {
        let raw = RawSensor::unset(SensorId(17));
        let record = SensorRecord::from(raw);
        assert_eq!(record.sensor, SensorId(17));
        assert_eq!(record.status, SensorStatus::Unset);
    }

    #[test]
    fn test_filled_records_map_to_readings() {
        let records = vec![
            RawSensor {
                pin: 4,
                status: SensorStatus::CODE_OK,
                temp: 21.5,
                humidity: 55.0,
            },
            RawSensor {
                pin: 17,
                status: SensorStatus::CODE_CHECKSUM,
                temp: 0.0,
                humidity: 0.0,
            },
            RawSensor::unset(SensorId(22)),
        ];
        let readings = collect_readings(records.into_iter().map(SensorRecord::from).collect());
        assert_eq!(readings.len(), 1);
        assert_eq!(readings.get(SensorId(4)).unwrap().humidity, 55.0);
    }

    #[tokio::test]
    async fn test_overrun_is_abandoned_and_next_call_waits() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let (a, p, c) = (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&calls));
        let acquirer = LibraryAcquirer::with_entry(
            PathBuf::from("dht22.so"),
            move |records: &mut [RawSensor], _retries| {
                let running = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(running, Ordering::SeqCst);
                c.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
                for record in records.iter_mut() {
                    record.status = SensorStatus::CODE_OK;
                    record.temp = 20.0;
                    record.humidity = 50.0;
                }
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            },
        );

        let started = Instant::now();
        let err = acquirer
            .acquire(&[SensorId(4)], 3, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(300));

        // the abandoned call still holds the library until it returns
        let readings = acquirer
            .acquire(&[SensorId(4)], 3, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(readings.len(), 1);
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
