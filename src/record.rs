use chrono::{DateTime, Utc};
use log::warn;
use std::sync::Arc;

use crate::config::FitParameterTable;
use crate::fit::{FitResult, FitStatus};
use crate::types::{RawSpectrum, ScanPosition};

/// How a scan ended
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Every position was acquired and the scanner returned home
    Complete,
    /// The scan was aborted; the record holds what was acquired before
    Partial { reason: String },
}

/// One acquired position with its retrieval
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub position: ScanPosition,
    pub spectrum: Arc<RawSpectrum>,
    pub fit: FitResult,
}

struct PendingEntry {
    position: ScanPosition,
    spectrum: Arc<RawSpectrum>,
    fit: Option<FitResult>,
}

/// Record of a scan in progress. Append-only, written by the session thread
/// alone; fits are attached by entry index as they come back.
pub struct OpenScanRecord {
    station_name: String,
    scan_number: u32,
    started_at: DateTime<Utc>,
    expected_positions: usize,
    entries: Vec<PendingEntry>,
}

impl OpenScanRecord {
    pub fn new(station_name: impl Into<String>, scan_number: u32, expected_positions: usize) -> Self {
        Self {
            station_name: station_name.into(),
            scan_number,
            started_at: Utc::now(),
            expected_positions,
            entries: Vec::with_capacity(expected_positions),
        }
    }

    /// Append an acquired position, returning its entry index
    pub fn push_spectrum(&mut self, position: ScanPosition, spectrum: Arc<RawSpectrum>) -> usize {
        self.entries.push(PendingEntry {
            position,
            spectrum,
            fit: None,
        });
        self.entries.len() - 1
    }

    /// Attach the fit of entry `index`. A second fit for the same entry is ignored.
    pub fn attach_fit(&mut self, index: usize, fit: FitResult) {
        match self.entries.get_mut(index) {
            Some(entry) if entry.fit.is_none() => entry.fit = Some(fit),
            Some(_) => warn!("Duplicate fit for position {} ignored", index),
            None => warn!("Fit for unknown position {} ignored", index),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_fits(&self) -> usize {
        self.entries.iter().filter(|e| e.fit.is_none()).count()
    }

    /// Freeze the record. Entries still without a fit are marked failed, with
    /// the initial values of `parameters`.
    pub fn close(self, completion: Completion, parameters: &FitParameterTable) -> ScanRecord {
        let entries = self
            .entries
            .into_iter()
            .map(|e| ScanEntry {
                position: e.position,
                spectrum: e.spectrum,
                fit: e
                    .fit
                    .unwrap_or_else(|| FitResult::failed(parameters, "fit did not complete")),
            })
            .collect();

        ScanRecord {
            station_name: self.station_name,
            scan_number: self.scan_number,
            started_at: self.started_at,
            finished_at: Utc::now(),
            expected_positions: self.expected_positions,
            completion,
            entries,
        }
    }
}

/// Closed, immutable record of one scan
#[derive(Debug, Clone)]
pub struct ScanRecord {
    station_name: String,
    scan_number: u32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    expected_positions: usize,
    completion: Completion,
    entries: Vec<ScanEntry>,
}

impl ScanRecord {
    pub fn station_name(&self) -> &str {
        &self.station_name
    }

    pub fn scan_number(&self) -> u32 {
        self.scan_number
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    pub fn is_complete(&self) -> bool {
        self.completion == Completion::Complete
    }

    pub fn expected_positions(&self) -> usize {
        self.expected_positions
    }

    pub fn entries(&self) -> &[ScanEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn valid_fits(&self) -> usize {
        self.entries.iter().filter(|e| e.fit.is_valid()).count()
    }

    pub fn failed_fits(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.fit.status, FitStatus::Failed { .. }))
            .count()
    }

    /// (angle, column density) of `species` over converged fits, in scan order
    pub fn column_profile(&self, species: &str) -> Vec<(f64, f64)> {
        self.entries
            .iter()
            .filter(|e| e.fit.is_valid())
            .filter_map(|e| {
                e.fit
                    .column_density(species)
                    .map(|value| (e.position.angle, value))
            })
            .collect()
    }

    /// Angle of the largest converged column density of `species`
    pub fn peak_angle(&self, species: &str) -> Option<(f64, f64)> {
        self.column_profile(species)
            .into_iter()
            .filter(|(_, v)| v.is_finite())
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FitParameterSpec, FitTerm};
    use crate::fit::FittedParameter;
    use ndarray::Array1;
    use std::path::PathBuf;

    fn table() -> FitParameterTable {
        FitParameterTable::new(vec![
            FitParameterSpec {
                name: "bg_poly0".to_string(),
                value: 1.0,
                vary: true,
                lo_bound: None,
                hi_bound: None,
                term: FitTerm::Background { order: 0 },
            },
            FitParameterSpec {
                name: "so2".to_string(),
                value: 1e16,
                vary: true,
                lo_bound: None,
                hi_bound: None,
                term: FitTerm::Absorber {
                    xpath: PathBuf::from("Ref/so2.txt"),
                },
            },
        ])
    }

    fn position(index: usize) -> ScanPosition {
        ScanPosition {
            index,
            step_offset: index as i64 - 2,
            angle: 178.0 + index as f64,
        }
    }

    fn spectrum() -> Arc<RawSpectrum> {
        Arc::new(RawSpectrum {
            intensities: Array1::from_elem(4, 100.0),
            integration_time_ms: 100,
            coadds: 1,
            angle: 0.0,
            acquired_at: Utc::now(),
        })
    }

    fn fit(status: FitStatus, so2: f64) -> FitResult {
        FitResult {
            status,
            parameters: vec![FittedParameter {
                name: "so2".to_string(),
                value: so2,
                uncertainty: 1e15,
                vary: true,
            }],
            rms_residual: 1e-3,
            iterations: 5,
        }
    }

    #[test]
    fn test_fits_attach_out_of_order() {
        let mut open = OpenScanRecord::new("TEST", 1, 3);
        for i in 0..3 {
            assert_eq!(open.push_spectrum(position(i), spectrum()), i);
        }
        open.attach_fit(2, fit(FitStatus::Converged, 3e17));
        open.attach_fit(0, fit(FitStatus::Converged, 1e17));
        assert_eq!(open.pending_fits(), 1);

        let record = open.close(Completion::Complete, &table());
        assert!(record.is_complete());
        assert_eq!(record.len(), 3);
        assert_eq!(record.valid_fits(), 2);
        assert_eq!(record.failed_fits(), 1);
        assert_eq!(record.entries()[1].position.index, 1);

        let unfitted = &record.entries()[1].fit;
        assert!(matches!(unfitted.status, FitStatus::Failed { .. }));
        let names: Vec<&str> = unfitted.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["bg_poly0", "so2"]);
        assert_eq!(unfitted.column_density("so2"), Some(1e16));
    }

    #[test]
    fn test_peak_angle_ignores_unconverged() {
        let mut open = OpenScanRecord::new("TEST", 7, 4);
        let values = [
            (FitStatus::Converged, 1e17),
            (FitStatus::NotConverged, 9e17),
            (FitStatus::Converged, 4e17),
            (FitStatus::Converged, 2e17),
        ];
        for (i, (status, so2)) in values.into_iter().enumerate() {
            let idx = open.push_spectrum(position(i), spectrum());
            open.attach_fit(idx, fit(status, so2));
        }
        let record = open.close(
            Completion::Partial {
                reason: "test".to_string(),
            },
            &table(),
        );
        assert!(!record.is_complete());
        assert_eq!(record.peak_angle("SO2"), Some((180.0, 4e17)));
        assert_eq!(record.column_profile("so2").len(), 3);
        assert_eq!(record.peak_angle("o3"), None);
    }

    #[test]
    fn test_duplicate_fit_ignored() {
        let mut open = OpenScanRecord::new("TEST", 1, 1);
        open.push_spectrum(position(0), spectrum());
        open.attach_fit(0, fit(FitStatus::Converged, 1.0));
        open.attach_fit(0, fit(FitStatus::Converged, 2.0));
        open.attach_fit(5, fit(FitStatus::Converged, 3.0));
        let record = open.close(Completion::Complete, &table());
        assert_eq!(record.entries()[0].fit.column_density("so2"), Some(1.0));
    }
}
