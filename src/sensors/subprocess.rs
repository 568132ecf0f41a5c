//! Acquisition through an external program printing JSON
//!
//! The program is invoked as `<program> [args..] --json -n <retries> <pin>..`
//! and prints an array of `{"pin", "status", "temp", "humidity"}` objects.

use super::{collect_readings, SensorAcquirer};
use crate::error::AcquisitionError;
use crate::model::{ReadingSet, SensorId, SensorRecord, SensorStatus};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// One element of the program's output
#[derive(Debug, Deserialize)]
struct RawRecord {
    pin: SensorId,
    status: String,
    #[serde(default)]
    temp: f32,
    #[serde(default)]
    humidity: f32,
}

impl From<RawRecord> for SensorRecord {
    fn from(raw: RawRecord) -> Self {
        SensorRecord {
            sensor: raw.pin,
            status: SensorStatus::from_label(&raw.status),
            temperature: raw.temp,
            humidity: raw.humidity,
        }
    }
}

/// Parse the program's stdout into raw records
pub fn parse_output(stdout: &[u8]) -> Result<Vec<SensorRecord>, AcquisitionError> {
    let raw: Vec<RawRecord> = serde_json::from_slice(stdout)?;
    Ok(raw.into_iter().map(SensorRecord::from).collect())
}

#[derive(Debug)]
pub struct SubprocessAcquirer {
    program: PathBuf,
    args: Vec<String>,
}

impl SubprocessAcquirer {
    /// Resolve the program up front so a missing binary fails at startup
    pub fn new(program: &Path, args: Vec<String>) -> Result<Self, AcquisitionError> {
        let program = resolve_program(program)?;
        tracing::info!("Using acquisition program {:?}", program);
        Ok(Self { program, args })
    }

    fn command(&self, sensors: &[SensorId], retries: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--json")
            .arg("-n")
            .arg(retries.to_string())
            .args(sensors.iter().map(|s| s.to_string()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl SensorAcquirer for SubprocessAcquirer {
    async fn acquire(
        &self,
        sensors: &[SensorId],
        retries: u32,
        timeout: Duration,
    ) -> Result<ReadingSet, AcquisitionError> {
        let child = self
            .command(sensors, retries)
            .spawn()
            .map_err(|source| AcquisitionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // dropping the wait future on timeout kills the child
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| AcquisitionError::Spawn {
                program: self.program.clone(),
                source,
            })?,
            Err(_) => return Err(AcquisitionError::Timeout(timeout)),
        };

        if !output.status.success() {
            return Err(AcquisitionError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(collect_readings(parse_output(&output.stdout)?))
    }
}

fn resolve_program(program: &Path) -> Result<PathBuf, AcquisitionError> {
    let unavailable = |reason: &str| AcquisitionError::Unavailable {
        path: program.to_path_buf(),
        reason: reason.to_string(),
    };

    // bare names are looked up on PATH
    if program.components().count() == 1 && !program.is_absolute() {
        let path = std::env::var_os("PATH").unwrap_or_default();
        return std::env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
            .ok_or_else(|| unavailable("not found on PATH"));
    }

    if !program.exists() {
        return Err(unavailable("no such file"));
    }
    if !is_executable(program) {
        return Err(unavailable("not an executable file"));
    }
    Ok(program.to_path_buf())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
