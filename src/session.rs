use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::config::{DailyTime, StationConfig};
use crate::error::StationError;
use crate::exposure::{ExposureAdjustment, ExposureController};
use crate::fit::{FitEngine, FitResult};
use crate::hardware::HardwareAdapter;
use crate::record::{Completion, OpenScanRecord, ScanRecord};
use crate::scanner::{AcquisitionHandler, ScanController};
use crate::types::{ExposureSetting, RawSpectrum, ScanPosition};

/// Fit of one record entry, sent back from a worker
type FitMessage = (usize, Result<FitResult, StationError>);

/// Runs fits on a dedicated thread pool so retrieval overlaps the next
/// acquisition. The engine is shared read-only between workers.
pub struct FitDispatcher {
    engine: Arc<FitEngine>,
    pool: rayon::ThreadPool,
    threads: usize,
}

impl FitDispatcher {
    pub fn new(engine: FitEngine, threads: usize) -> Result<Self, StationError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("fit-worker-{i}"))
            .build()
            .map_err(|e| StationError::Configuration(format!("fit thread pool: {e}")))?;
        Ok(Self {
            engine: Arc::new(engine),
            pool,
            threads,
        })
    }

    pub fn engine(&self) -> &FitEngine {
        &self.engine
    }

    /// Most fits allowed in flight at once
    pub fn capacity(&self) -> usize {
        self.threads
    }

    fn submit(&self, index: usize, spectrum: Arc<RawSpectrum>, results: Sender<FitMessage>) {
        let engine = Arc::clone(&self.engine);
        self.pool.spawn(move || {
            let outcome = engine.fit(&spectrum);
            // The session may have given up on this scan already
            let _ = results.send((index, outcome));
        });
    }
}

/// Result of asking the session to scan
#[derive(Debug)]
pub enum SessionOutcome {
    /// Current time is outside the operating window; nothing was done
    OutsideWindow,
    Completed(ScanRecord),
    /// The scan stopped early. The record keeps every acquired position.
    Aborted {
        record: ScanRecord,
        error: StationError,
    },
}

impl SessionOutcome {
    pub fn record(&self) -> Option<&ScanRecord> {
        match self {
            SessionOutcome::OutsideWindow => None,
            SessionOutcome::Completed(record) => Some(record),
            SessionOutcome::Aborted { record, .. } => Some(record),
        }
    }
}

/// One scan cycle: window check, scan, exposure feedback and fits, record.
pub struct ScanSession<'a, H: HardwareAdapter> {
    config: &'a StationConfig,
    controller: &'a mut ScanController<H>,
    exposure: &'a mut ExposureController,
    fits: &'a FitDispatcher,
    scan_number: u32,
}

impl<'a, H: HardwareAdapter> ScanSession<'a, H> {
    pub fn new(
        config: &'a StationConfig,
        controller: &'a mut ScanController<H>,
        exposure: &'a mut ExposureController,
        fits: &'a FitDispatcher,
        scan_number: u32,
    ) -> Self {
        Self {
            config,
            controller,
            exposure,
            fits,
            scan_number,
        }
    }

    pub fn run(self) -> Result<SessionOutcome, StationError> {
        self.run_at(Utc::now())
    }

    /// Run the session as if the current time were `now`.
    ///
    /// # Errors
    /// `StationFaulted` when the scanner needs a re-home; nothing is started
    /// in that case. Faults during the scan are reported as
    /// [`SessionOutcome::Aborted`].
    pub fn run_at(self, now: DateTime<Utc>) -> Result<SessionOutcome, StationError> {
        let (start, stop) = (self.config.start_time, self.config.stop_time);
        if !DailyTime::window_contains(start, stop, now.time()) {
            info!(
                "{} is outside the operating window {}-{}, scan not started",
                now.format("%H:%M"),
                start,
                stop
            );
            return Ok(SessionOutcome::OutsideWindow);
        }
        if self.controller.is_faulted() {
            return Err(StationError::StationFaulted);
        }

        info!(
            "Starting scan {} at {} ({})",
            self.scan_number,
            self.config.station_name,
            self.exposure.current()
        );

        let expected = self.config.specs_per_scan as usize;
        let (sender, receiver) = unbounded();
        let mut collector = ScanCollector {
            exposure: self.exposure,
            fits: self.fits,
            record: OpenScanRecord::new(
                self.config.station_name.clone(),
                self.scan_number,
                expected,
            ),
            sender,
            receiver,
            in_flight: 0,
        };

        let scan = self.controller.run_scan(&mut collector);
        collector.drain();
        let ScanCollector { record, .. } = collector;
        let table = self.fits.engine().parameters();

        let outcome = match scan {
            Ok(count) => {
                let record = record.close(Completion::Complete, table);
                info!(
                    "Scan {} complete: {} positions, {} valid fits, {} failed",
                    self.scan_number,
                    count,
                    record.valid_fits(),
                    record.failed_fits()
                );
                SessionOutcome::Completed(record)
            }
            Err(error) => {
                error!(
                    "Scan {} aborted after {}/{} positions: {}",
                    self.scan_number,
                    record.len(),
                    expected,
                    error
                );
                let record = record.close(
                    Completion::Partial {
                        reason: error.to_string(),
                    },
                    table,
                );
                SessionOutcome::Aborted { record, error }
            }
        };
        Ok(outcome)
    }
}

/// Session side of a running scan: steers exposure, hands spectra to the fit
/// workers and is the only writer of the open record.
struct ScanCollector<'a> {
    exposure: &'a mut ExposureController,
    fits: &'a FitDispatcher,
    record: OpenScanRecord,
    sender: Sender<FitMessage>,
    receiver: Receiver<FitMessage>,
    in_flight: usize,
}

impl ScanCollector<'_> {
    fn store(&mut self, (index, outcome): FitMessage) {
        self.in_flight -= 1;
        let fit = match outcome {
            Ok(fit) => {
                if !fit.is_valid() {
                    warn!("Fit at position {} did not converge", index);
                }
                fit
            }
            Err(err) => {
                warn!("Fit at position {} failed: {}", index, err);
                FitResult::failed(self.fits.engine().parameters(), err.to_string())
            }
        };
        self.record.attach_fit(index, fit);
    }

    /// Take in every fit that has already finished
    fn collect_ready(&mut self) {
        while let Ok(message) = self.receiver.try_recv() {
            self.store(message);
        }
    }

    /// Block until every submitted fit is back
    fn drain(&mut self) {
        while self.in_flight > 0 {
            match self.receiver.recv() {
                Ok(message) => self.store(message),
                Err(_) => break,
            }
        }
    }
}

impl AcquisitionHandler for ScanCollector<'_> {
    fn next_exposure(&mut self) -> ExposureSetting {
        self.exposure.current()
    }

    fn on_spectrum(&mut self, position: ScanPosition, spectrum: RawSpectrum) {
        if let ExposureAdjustment::Adjusted { to, .. } = self.exposure.update_from_spectrum(&spectrum)
        {
            debug!("Position {}: next exposure {}", position.index, to);
        }

        let spectrum = Arc::new(spectrum);
        let index = self.record.push_spectrum(position, Arc::clone(&spectrum));

        self.collect_ready();
        while self.in_flight >= self.fits.capacity() {
            match self.receiver.recv() {
                Ok(message) => self.store(message),
                Err(_) => break,
            }
        }

        self.fits.submit(index, spectrum, self.sender.clone());
        self.in_flight += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::FitControlConfig;
    use crate::fit::FitStatus;
    use crate::hardware::{SimulatedHardware, SimulatedScene};
    use crate::scanner::ScanGeometry;
    use chrono::TimeZone;
    use ndarray::Array1;

    fn config() -> StationConfig {
        let mut cfg = StationConfig::from_toml_str(SAMPLE).unwrap();
        cfg.specs_per_scan = 11;
        cfg.steps_to_start = 5;
        cfg
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
    }

    fn rig(
        cfg: &StationConfig,
        hw: SimulatedHardware,
    ) -> (
        ScanController<SimulatedHardware>,
        ExposureController,
        FitDispatcher,
    ) {
        let wl = Array1::linspace(300.0, 330.0, 301);
        // SAMPLE references do not exist, every fit fails individually
        let engine = FitEngine::new(&cfg.fit_parameters, wl, &FitControlConfig::default());
        (
            ScanController::new(hw, ScanGeometry::from_config(cfg)),
            ExposureController::new(cfg),
            FitDispatcher::new(engine, 2).unwrap(),
        )
    }

    fn hardware() -> SimulatedHardware {
        let wl = Array1::linspace(300.0, 330.0, 301);
        SimulatedHardware::new(SimulatedScene::clear_sky(wl, 200.0), 180.0, 0.9)
    }

    #[test]
    fn test_outside_window_touches_nothing() {
        let cfg = config();
        let (mut ctrl, mut exposure, fits) = rig(&cfg, hardware());
        let outcome = ScanSession::new(&cfg, &mut ctrl, &mut exposure, &fits, 1)
            .run_at(at(22, 0))
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::OutsideWindow));
        assert_eq!(ctrl.hardware().total_actions(), 0);
    }

    #[test]
    fn test_window_edges_are_inclusive() {
        let cfg = config();
        let (mut ctrl, mut exposure, fits) = rig(&cfg, hardware());
        let outcome = ScanSession::new(&cfg, &mut ctrl, &mut exposure, &fits, 1)
            .run_at(at(17, 45))
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::Completed(_)));
    }

    #[test]
    fn test_scan_feeds_exposure_and_records_failed_fits() {
        let cfg = config();
        let (mut ctrl, mut exposure, fits) = rig(&cfg, hardware());
        let outcome = ScanSession::new(&cfg, &mut ctrl, &mut exposure, &fits, 3)
            .run_at(at(12, 0))
            .unwrap();

        let SessionOutcome::Completed(record) = outcome else {
            panic!("expected a completed scan");
        };
        assert_eq!(record.len(), 11);
        assert_eq!(record.scan_number(), 3);
        // Missing references fail every fit, without stopping the scan
        assert_eq!(record.failed_fits(), 11);
        assert!(record.entries().iter().all(|e| matches!(
            &e.fit.status,
            FitStatus::Failed { reason } if reason.contains("ring")
        )));

        // First acquisition at the configured start, later ones steered
        let settings = &ctrl.hardware().acquisition_settings;
        assert_eq!(settings[0], (100, 1));
        assert_ne!(settings[1], (100, 1));
    }

    #[test]
    fn test_hardware_fault_keeps_partial_record() {
        let cfg = config();
        let (mut ctrl, mut exposure, fits) = rig(&cfg, hardware().with_acquisition_fault(4));
        let outcome = ScanSession::new(&cfg, &mut ctrl, &mut exposure, &fits, 1)
            .run_at(at(12, 0))
            .unwrap();

        match outcome {
            SessionOutcome::Aborted { record, error } => {
                assert!(matches!(error, StationError::Hardware(_)));
                assert_eq!(record.len(), 4);
                assert!(!record.is_complete());
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(ctrl.hardware().position(), 0);
    }

    #[test]
    fn test_faulted_controller_refuses_to_start() {
        let cfg = config();
        let (mut ctrl, mut exposure, fits) = rig(&cfg, hardware().with_broken_switch());
        let first = ScanSession::new(&cfg, &mut ctrl, &mut exposure, &fits, 1)
            .run_at(at(12, 0))
            .unwrap();
        assert!(matches!(
            first,
            SessionOutcome::Aborted {
                error: StationError::HomingTimeout { .. },
                ..
            }
        ));

        let second = ScanSession::new(&cfg, &mut ctrl, &mut exposure, &fits, 2).run_at(at(12, 5));
        assert!(matches!(second, Err(StationError::StationFaulted)));
    }
}
