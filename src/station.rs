use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{DailyTime, StationConfig};
use crate::error::StationError;
use crate::exposure::ExposureController;
use crate::fit::FitEngine;
use crate::hardware::HardwareAdapter;
use crate::record::ScanRecord;
use crate::scanner::{ScanController, ScanGeometry};
use crate::session::{FitDispatcher, ScanSession, SessionOutcome};
use crate::status::{StationStatus, StatusFile};

/// Aborted scans in a row after which the daily loop gives up
const MAX_CONSECUTIVE_ABORTS: u32 = 3;

/// Everything a scan mutates. Held behind the station's scan lock.
struct ScanRig<H: HardwareAdapter> {
    controller: ScanController<H>,
    exposure: ExposureController,
    scans_run: u32,
}

/// Options of the daily operating loop
#[derive(Debug, Clone)]
pub struct DailyRun {
    /// Stop after this many scans
    pub max_scans: Option<u32>,
    /// Scan regardless of the configured operating window
    pub ignore_window: bool,
    /// Wake-up interval while waiting for the window to open
    pub poll_interval: Duration,
}

impl Default for DailyRun {
    fn default() -> Self {
        Self {
            max_scans: None,
            ignore_window: false,
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// One scanning station: configuration, hardware, exposure state and fit
/// workers, with at most one scan running at a time.
pub struct Station<H: HardwareAdapter> {
    config: StationConfig,
    rig: Mutex<ScanRig<H>>,
    fits: FitDispatcher,
    status: StatusFile,
    shutdown: Arc<AtomicBool>,
}

impl<H: HardwareAdapter> Station<H> {
    /// Assemble the station. The wavelength calibration is read from the
    /// hardware once and fixes the fit window for the session.
    pub fn new(config: StationConfig, hardware: H) -> Result<Self, StationError> {
        config.validate()?;

        let mut controller = ScanController::new(hardware, ScanGeometry::from_config(&config));
        let wavelengths = controller.wavelengths()?;
        let engine = FitEngine::new(&config.fit_parameters, wavelengths, &config.fit_control);
        let fits = FitDispatcher::new(engine, config.fit_control.fit_threads)?;
        let status = StatusFile::new(&config.status_dir, config.station_name.clone());
        let exposure = ExposureController::new(&config);

        info!(
            "Station '{}' ready: {} positions per scan, window {}-{}",
            config.station_name, config.specs_per_scan, config.start_time, config.stop_time
        );

        Ok(Self {
            config,
            rig: Mutex::new(ScanRig {
                controller,
                exposure,
                scans_run: 0,
            }),
            fits,
            status,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share a shutdown flag, typically set from a Ctrl+C handler
    pub fn set_shutdown_flag(&mut self, flag: Arc<AtomicBool>) {
        self.rig
            .get_mut()
            .controller
            .set_shutdown_flag(Arc::clone(&flag));
        self.shutdown = flag;
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn status_file(&self) -> &StatusFile {
        &self.status
    }

    pub fn is_scanning(&self) -> bool {
        self.rig.is_locked()
    }

    pub fn scans_run(&self) -> u32 {
        self.rig.lock().scans_run
    }

    /// Inspect the hardware, waiting for a running scan to finish
    pub fn with_hardware<R>(&self, f: impl FnOnce(&H) -> R) -> R {
        f(self.rig.lock().controller.hardware())
    }

    pub fn scan(&self) -> Result<SessionOutcome, StationError> {
        self.scan_at(Utc::now())
    }

    /// Run one scan session as of `now`.
    ///
    /// # Errors
    /// `ScanInProgress` when another scan holds the station, `StationFaulted`
    /// when a re-home is required first
    pub fn scan_at(&self, now: DateTime<Utc>) -> Result<SessionOutcome, StationError> {
        let mut guard = self.rig.try_lock().ok_or(StationError::ScanInProgress)?;
        let rig = &mut *guard;
        let scan_number = rig.scans_run + 1;

        if DailyTime::window_contains(self.config.start_time, self.config.stop_time, now.time())
            && !rig.controller.is_faulted()
        {
            self.status.update(StationStatus::Active, scan_number);
        }

        let outcome = ScanSession::new(
            &self.config,
            &mut rig.controller,
            &mut rig.exposure,
            &self.fits,
            scan_number,
        )
        .run_at(now);

        match &outcome {
            Ok(SessionOutcome::OutsideWindow) => {}
            Ok(SessionOutcome::Completed(_)) => {
                rig.scans_run = scan_number;
                self.status.update(StationStatus::Idle, scan_number);
            }
            Ok(SessionOutcome::Aborted { error, .. }) => {
                rig.scans_run = scan_number;
                let status = if rig.controller.is_faulted() {
                    StationStatus::Faulted
                } else if matches!(error, StationError::Cancelled) {
                    StationStatus::Idle
                } else {
                    StationStatus::Error
                };
                self.status.update(status, scan_number);
            }
            Err(StationError::StationFaulted) => {
                self.status.update(StationStatus::Faulted, rig.scans_run);
            }
            Err(_) => self.status.update(StationStatus::Error, rig.scans_run),
        }
        outcome
    }

    /// Externally triggered re-home, clearing a homing fault on success
    pub fn rehome(&self) -> Result<u32, StationError> {
        let mut rig = self.rig.try_lock().ok_or(StationError::ScanInProgress)?;
        let scans_run = rig.scans_run;
        match rig.controller.rehome() {
            Ok(steps) => {
                self.status.update(StationStatus::Idle, scans_run);
                Ok(steps)
            }
            Err(e) => {
                let status = if rig.controller.is_faulted() {
                    StationStatus::Faulted
                } else {
                    StationStatus::Error
                };
                self.status.update(status, scans_run);
                Err(e)
            }
        }
    }

    /// De-energise the scanner motor
    pub fn release(&self) -> Result<(), StationError> {
        self.rig.lock().controller.release()
    }

    /// Daily operating loop.
    ///
    /// Waits for the operating window, then scans back to back until the
    /// window closes, `max_scans` is reached or shutdown is requested. The
    /// exposure setting carries over from one scan to the next. The motor is
    /// released on the way out.
    ///
    /// # Returns
    /// Number of scans run
    pub fn run_daily<F>(&self, run: &DailyRun, mut on_record: F) -> Result<u32, StationError>
    where
        F: FnMut(&ScanRecord),
    {
        let result = self.daily_loop(run, &mut on_record);

        if let Err(e) = self.release() {
            warn!("Failed to release motor: {}", e);
        }
        let scans_run = self.scans_run();
        match &result {
            Ok(_) => self.status.update(StationStatus::Idle, scans_run),
            Err(StationError::StationFaulted | StationError::HomingTimeout { .. }) => {
                self.status.update(StationStatus::Faulted, scans_run)
            }
            Err(_) => self.status.update(StationStatus::Error, scans_run),
        }
        result
    }

    fn daily_loop<F>(&self, run: &DailyRun, on_record: &mut F) -> Result<u32, StationError>
    where
        F: FnMut(&ScanRecord),
    {
        let (start, stop) = (self.config.start_time, self.config.stop_time);
        let mut scans = 0;
        let mut consecutive_aborts = 0;
        self.status.update(StationStatus::Idle, self.scans_run());

        loop {
            if self.shutdown_requested() {
                info!("Shutdown requested, leaving the operating loop");
                break;
            }
            if run.max_scans.is_some_and(|max| scans >= max) {
                break;
            }

            let now = Utc::now();
            let session_time = if run.ignore_window {
                // Any instant inside the window will do
                now.date_naive().and_time(start.time()).and_utc()
            } else if DailyTime::window_contains(start, stop, now.time()) {
                now
            } else if scans > 0 {
                info!("Operating window closed at {}", stop);
                break;
            } else {
                self.sleep(run.poll_interval);
                continue;
            };

            match self.scan_at(session_time)? {
                SessionOutcome::OutsideWindow => continue,
                SessionOutcome::Completed(record) => {
                    scans += 1;
                    consecutive_aborts = 0;
                    on_record(&record);
                }
                SessionOutcome::Aborted { record, error } => {
                    scans += 1;
                    on_record(&record);
                    match error {
                        StationError::Cancelled => break,
                        StationError::HomingTimeout { .. } => return Err(error),
                        _ => {
                            consecutive_aborts += 1;
                            if consecutive_aborts >= MAX_CONSECUTIVE_ABORTS {
                                error!("{} scans in a row aborted, stopping", consecutive_aborts);
                                return Err(error);
                            }
                        }
                    }
                }
            }
        }
        Ok(scans)
    }

    /// Sleep for `duration`, waking early on shutdown
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.shutdown_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(200)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::hardware::{SimulatedHardware, SimulatedScene};
    use crate::types::{MotorDirection, StepType};
    use chrono::TimeZone;
    use crossbeam_channel::{Receiver, Sender, bounded};
    use ndarray::Array1;
    use std::path::Path;

    fn config(status_dir: &Path) -> StationConfig {
        let mut cfg = StationConfig::from_toml_str(SAMPLE).unwrap();
        cfg.specs_per_scan = 11;
        cfg.steps_to_start = 5;
        cfg.status_dir = status_dir.to_path_buf();
        cfg
    }

    fn hardware() -> SimulatedHardware {
        let wl = Array1::linspace(300.0, 330.0, 301);
        SimulatedHardware::new(SimulatedScene::clear_sky(wl, 200.0), 180.0, 0.9)
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    /// Holds the first acquisition until the test lets it go
    struct GatedHardware {
        inner: SimulatedHardware,
        gate: Option<(Sender<()>, Receiver<()>)>,
    }

    impl HardwareAdapter for GatedHardware {
        fn step_motor(
            &mut self,
            direction: MotorDirection,
            step_type: StepType,
        ) -> Result<(), StationError> {
            self.inner.step_motor(direction, step_type)
        }

        fn read_home_switch(&mut self) -> Result<bool, StationError> {
            self.inner.read_home_switch()
        }

        fn release_motor(&mut self) -> Result<(), StationError> {
            self.inner.release_motor()
        }

        fn acquire_spectrum(
            &mut self,
            integration_time_ms: u32,
            coadds: u32,
        ) -> Result<Array1<f64>, StationError> {
            if let Some((started, release)) = self.gate.take() {
                let _ = started.send(());
                let _ = release.recv();
            }
            self.inner.acquire_spectrum(integration_time_ms, coadds)
        }

        fn wavelengths(&mut self) -> Result<Array1<f64>, StationError> {
            self.inner.wavelengths()
        }
    }

    #[test]
    fn test_outside_window_leaves_everything_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let station = Station::new(config(dir.path()), hardware()).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 6, 1, 23, 30, 0).unwrap();

        let outcome = station.scan_at(night).unwrap();
        assert!(matches!(outcome, SessionOutcome::OutsideWindow));
        assert_eq!(station.with_hardware(|hw| hw.total_actions()), 0);
        assert_eq!(station.scans_run(), 0);
        assert!(!station.status_file().path().exists());
    }

    #[test]
    fn test_scan_publishes_status() {
        let dir = tempfile::tempdir().unwrap();
        let station = Station::new(config(dir.path()), hardware()).unwrap();

        let outcome = station.scan_at(noon()).unwrap();
        let record = outcome.record().unwrap();
        assert!(record.is_complete());
        assert_eq!(record.len(), 11);
        assert_eq!(station.scans_run(), 1);

        let report = station.status_file().read().unwrap();
        assert_eq!(report.status, StationStatus::Idle);
        assert_eq!(report.scan_number, 1);
        assert_eq!(report.station_name, "ETNA_NE");
        assert_eq!(station.with_hardware(|hw| hw.position()), 0);
    }

    #[test]
    fn test_second_scan_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let (started_tx, started_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let gated = GatedHardware {
            inner: hardware(),
            gate: Some((started_tx, release_rx)),
        };
        let station = Station::new(config(dir.path()), gated).unwrap();

        thread::scope(|s| {
            let running = s.spawn(|| station.scan_at(noon()));
            started_rx.recv().unwrap();

            assert!(station.is_scanning());
            assert!(matches!(
                station.scan_at(noon()),
                Err(StationError::ScanInProgress)
            ));
            assert!(matches!(station.rehome(), Err(StationError::ScanInProgress)));
            assert_eq!(
                station.status_file().read().unwrap().status,
                StationStatus::Active
            );

            release_tx.send(()).unwrap();
            let outcome = running.join().unwrap().unwrap();
            assert!(matches!(outcome, SessionOutcome::Completed(_)));
        });
        assert!(!station.is_scanning());
        assert_eq!(station.scans_run(), 1);
    }

    #[test]
    fn test_daily_run_keeps_exposure_between_scans() {
        let dir = tempfile::tempdir().unwrap();
        let station = Station::new(config(dir.path()), hardware()).unwrap();
        let run = DailyRun {
            max_scans: Some(2),
            ignore_window: true,
            ..Default::default()
        };

        let mut numbers = Vec::new();
        let scans = station
            .run_daily(&run, |record| numbers.push(record.scan_number()))
            .unwrap();

        assert_eq!(scans, 2);
        assert_eq!(numbers, vec![1, 2]);
        let (settings, energised) = station.with_hardware(|hw| {
            (hw.acquisition_settings.clone(), hw.is_motor_energised())
        });
        assert_eq!(settings.len(), 22);
        assert_eq!(settings[0], (100, 1));
        // The second scan starts from where the first one left the exposure
        assert_ne!(settings[11], (100, 1));
        assert!(!energised);
        assert_eq!(
            station.status_file().read().unwrap().status,
            StationStatus::Idle
        );
    }

    #[test]
    fn test_daily_run_stops_on_homing_fault() {
        let dir = tempfile::tempdir().unwrap();
        let station = Station::new(config(dir.path()), hardware().with_broken_switch()).unwrap();
        let run = DailyRun {
            ignore_window: true,
            ..Default::default()
        };

        let result = station.run_daily(&run, |_| {});
        assert!(matches!(result, Err(StationError::HomingTimeout { .. })));
        assert_eq!(
            station.status_file().read().unwrap().status,
            StationStatus::Faulted
        );

        assert!(matches!(
            station.scan_at(noon()),
            Err(StationError::StationFaulted)
        ));
        assert!(matches!(
            station.rehome(),
            Err(StationError::HomingTimeout { .. })
        ));
    }

    #[test]
    fn test_shutdown_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut station = Station::new(config(dir.path()), hardware()).unwrap();
        station.set_shutdown_flag(Arc::new(AtomicBool::new(true)));

        let scans = station.run_daily(&DailyRun::default(), |_| {}).unwrap();
        assert_eq!(scans, 0);
        let (steps, acquisitions) =
            station.with_hardware(|hw| (hw.steps_issued, hw.acquisitions));
        assert_eq!((steps, acquisitions), (0, 0));
    }
}
