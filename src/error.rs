//! Error types for acquisition and delivery

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// The acquisition program cannot be found or run at all
    #[error("acquisition program {path:?} is unavailable: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    #[cfg(feature = "library")]
    #[error("failed to load sensor library {path:?}: {source}")]
    Library {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("failed to start {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("acquisition did not finish within {0:?}")]
    Timeout(Duration),

    #[error("acquisition exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },

    #[error("malformed acquisition output: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("acquisition task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AcquisitionError {
    /// Whether the mechanism can never work, as opposed to one bad batch
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            #[cfg(feature = "library")]
            Self::Library { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish did not complete within {0:?}")]
    Timeout(Duration),

    #[cfg(feature = "mqtt")]
    #[error("mqtt client rejected the message: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[cfg(feature = "http")]
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("destination {0} cannot be delivered by this sink")]
    UnsupportedDestination(String),
}

impl PublishError {
    /// Short code for log lines
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            #[cfg(feature = "mqtt")]
            Self::Mqtt(_) => "mqtt-client",
            #[cfg(feature = "http")]
            Self::Http(e) if e.is_connect() => "http-connect",
            #[cfg(feature = "http")]
            Self::Http(_) => "http-transport",
            Self::UnsupportedDestination(_) => "destination",
        }
    }
}
