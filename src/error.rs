use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StationError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Homing timeout: home switch not found within {max_steps} steps")]
    HomingTimeout { max_steps: u32 },
    #[error("Hardware fault: {0}")]
    Hardware(String),
    #[error("Invalid spectrum: {0}")]
    InvalidSpectrum(String),
    #[error("Missing reference for {name}: {path:?} ({reason})")]
    MissingReference {
        name: String,
        path: PathBuf,
        reason: String,
    },
    #[error("Operation cancelled by shutdown request")]
    Cancelled,
    #[error("A scan is already in progress on this station")]
    ScanInProgress,
    #[error("Station is faulted, re-home required before scanning")]
    StationFaulted,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StationError {
    /// Errors that end the current scan, as opposed to per-position fit failures
    pub fn is_scan_fatal(&self) -> bool {
        !matches!(
            self,
            StationError::InvalidSpectrum(_) | StationError::MissingReference { .. }
        )
    }
}

impl From<config::ConfigError> for StationError {
    fn from(err: config::ConfigError) -> Self {
        StationError::Configuration(err.to_string())
    }
}

impl From<toml::ser::Error> for StationError {
    fn from(err: toml::ser::Error) -> Self {
        StationError::Configuration(format!("serialization failed: {err}"))
    }
}

impl From<toml::de::Error> for StationError {
    fn from(err: toml::de::Error) -> Self {
        StationError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for StationError {
    fn from(err: serde_json::Error) -> Self {
        StationError::Io(std::io::Error::other(err))
    }
}
