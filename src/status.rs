use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StationError;

pub const STATUS_FILE_NAME: &str = "status.json";

/// Operating status published for external monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StationStatus {
    /// Waiting for the operating window or between days
    Idle,
    /// Scanning
    Active,
    /// Home switch lost, re-home required
    Faulted,
    /// Last scan aborted by a hardware error
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub station_name: String,
    pub status: StationStatus,
    pub scan_number: u32,
}

/// `status.json` in the station's status directory, rewritten on every
/// status change
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
    station_name: String,
}

impl StatusFile {
    pub fn new(dir: &Path, station_name: impl Into<String>) -> Self {
        Self {
            path: dir.join(STATUS_FILE_NAME),
            station_name: station_name.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, status: StationStatus, scan_number: u32) -> Result<StatusReport, StationError> {
        let report = StatusReport {
            timestamp: Utc::now(),
            station_name: self.station_name.clone(),
            status,
            scan_number,
        };

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        // Readers never see a half-written file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&report)?)?;
        fs::rename(&tmp, &self.path)?;

        debug!("Status {:?} (scan {}) written", status, scan_number);
        Ok(report)
    }

    /// Write the status, logging instead of failing
    pub fn update(&self, status: StationStatus, scan_number: u32) {
        if let Err(e) = self.write(status, scan_number) {
            warn!(
                "Failed to write station status to {}: {}",
                self.path.display(),
                e
            );
        }
    }

    pub fn read(&self) -> Result<StatusReport, StationError> {
        let text = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusFile::new(&dir.path().join("Station"), "ETNA_NE");

        status.write(StationStatus::Active, 4).unwrap();
        let report = status.read().unwrap();
        assert_eq!(report.status, StationStatus::Active);
        assert_eq!(report.scan_number, 4);
        assert_eq!(report.station_name, "ETNA_NE");

        status.write(StationStatus::Idle, 4).unwrap();
        assert_eq!(status.read().unwrap().status, StationStatus::Idle);
        assert!(!dir.path().join("Station/status.json.tmp").exists());
    }

    #[test]
    fn test_update_survives_unwritable_location() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "not a directory").unwrap();
        let status = StatusFile::new(&blocker, "X");

        assert!(status.write(StationStatus::Error, 1).is_err());
        status.update(StationStatus::Error, 1);
    }
}
