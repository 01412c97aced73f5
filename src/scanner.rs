use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::StationConfig;
use crate::error::StationError;
use crate::hardware::HardwareAdapter;
use crate::types::{ExposureSetting, MotorDirection, RawSpectrum, ScanPosition, StepType};

/// Direction the scanner travels when looking for the home switch from an
/// unknown position
const HOME_SEEK_DIRECTION: MotorDirection = MotorDirection::Backward;

/// Phase of the scan state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Homing,
    AtHome,
    /// Travelling from home to the first position
    Stepping(usize),
    Exposing(usize),
    /// Travelling to the given position from the previous one
    Advancing(usize),
    ReturnToHome,
    /// Home switch not found; scanning is refused until a re-home succeeds
    Faulted,
}

/// Fixed geometry of a scan, derived from the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ScanGeometry {
    pub home_angle: f64,
    pub angle_per_step: f64,
    pub steps_to_start: u32,
    pub steps_per_spec: u32,
    pub specs_per_scan: u32,
    pub max_steps_home: u32,
    pub step_type: StepType,
}

impl ScanGeometry {
    pub fn from_config(config: &StationConfig) -> Self {
        Self {
            home_angle: config.home_angle,
            angle_per_step: config.angle_per_step,
            steps_to_start: config.steps_to_start,
            steps_per_spec: config.steps_per_spec,
            specs_per_scan: config.specs_per_scan,
            max_steps_home: config.max_steps_home,
            step_type: config.step_type,
        }
    }

    /// Position `index` of the scan. The first position lies `steps_to_start`
    /// steps before home, subsequent ones `steps_per_spec` apart.
    pub fn position(&self, index: usize) -> ScanPosition {
        let step_offset =
            index as i64 * self.steps_per_spec as i64 - self.steps_to_start as i64;
        ScanPosition {
            index,
            step_offset,
            angle: self.angle_at(step_offset),
        }
    }

    pub fn positions(&self) -> impl Iterator<Item = ScanPosition> + '_ {
        (0..self.specs_per_scan as usize).map(|i| self.position(i))
    }

    /// Inferred angle in [0, 360) at a step offset from home
    pub fn angle_at(&self, step_offset: i64) -> f64 {
        (self.home_angle + step_offset as f64 * self.angle_per_step).rem_euclid(360.0)
    }
}

/// Receives the data of a running scan.
///
/// The controller asks for the exposure right before each acquisition, so a
/// handler that adapts exposure from the previous spectrum takes effect on
/// the very next position.
pub trait AcquisitionHandler {
    /// Exposure to use for the next acquisition
    fn next_exposure(&mut self) -> ExposureSetting;

    /// Called once per position, in position order
    fn on_spectrum(&mut self, position: ScanPosition, spectrum: RawSpectrum);
}

/// Drives one open-loop stepper scanner and its spectrometer through the
/// home / step / expose / return cycle.
///
/// Position is known only as a signed step count relative to the home switch.
/// The count is valid from a successful homing until the next fault; homing is
/// the only point where it is corrected against the hardware.
pub struct ScanController<H: HardwareAdapter> {
    hardware: H,
    geometry: ScanGeometry,
    state: ScanState,
    /// Logical steps from home, `None` while the position is unknown
    step_offset: Option<i64>,
    shutdown: Option<Arc<AtomicBool>>,
}

impl<H: HardwareAdapter> ScanController<H> {
    pub fn new(hardware: H, geometry: ScanGeometry) -> Self {
        Self {
            hardware,
            geometry,
            state: ScanState::Idle,
            step_offset: None,
            shutdown: None,
        }
    }

    /// Flag checked between motor steps; once set, motion stops and the
    /// running operation returns `Cancelled`
    pub fn set_shutdown_flag(&mut self, flag: Arc<AtomicBool>) {
        self.shutdown = Some(flag);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_faulted(&self) -> bool {
        self.state == ScanState::Faulted
    }

    pub fn step_offset(&self) -> Option<i64> {
        self.step_offset
    }

    pub fn current_angle(&self) -> Option<f64> {
        self.step_offset.map(|o| self.geometry.angle_at(o))
    }

    pub fn geometry(&self) -> &ScanGeometry {
        &self.geometry
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    pub fn into_hardware(self) -> H {
        self.hardware
    }

    /// Wavelength calibration of the attached spectrometer
    pub fn wavelengths(&mut self) -> Result<ndarray::Array1<f64>, StationError> {
        self.hardware.wavelengths()
    }

    /// Home the scanner from an unknown position.
    ///
    /// # Returns
    /// Number of steps taken before the switch closed
    ///
    /// # Errors
    /// `StationFaulted` if a previous homing timed out, `HomingTimeout` if the
    /// switch is not found within `max_steps_home` steps
    pub fn home(&mut self) -> Result<u32, StationError> {
        if self.is_faulted() {
            return Err(StationError::StationFaulted);
        }
        self.seek_home(HOME_SEEK_DIRECTION)
            .inspect_err(|e| self.settle_after_error(e))
    }

    /// Externally triggered re-home, the only way out of `Faulted`
    pub fn rehome(&mut self) -> Result<u32, StationError> {
        info!("Re-home requested from state {:?}", self.state);
        self.state = ScanState::Idle;
        self.home()
    }

    /// Run one full scan: home, step through every position acquiring one
    /// spectrum each, and return to home.
    ///
    /// # Returns
    /// Number of positions acquired
    ///
    /// # Errors
    /// Any hardware error, homing timeout or cancellation aborts the scan. A
    /// best-effort return to home is attempted before returning, except after
    /// a homing timeout which leaves the controller `Faulted`.
    pub fn run_scan<A: AcquisitionHandler>(
        &mut self,
        handler: &mut A,
    ) -> Result<usize, StationError> {
        if self.is_faulted() {
            return Err(StationError::StationFaulted);
        }

        match self.scan_sequence(handler) {
            Ok(count) => Ok(count),
            Err(err) => {
                self.recover(&err);
                Err(err)
            }
        }
    }

    /// De-energise the motor, typically at the end of the day
    pub fn release(&mut self) -> Result<(), StationError> {
        debug!("Releasing motor");
        self.hardware.release_motor()
    }

    fn scan_sequence<A: AcquisitionHandler>(
        &mut self,
        handler: &mut A,
    ) -> Result<usize, StationError> {
        let homing_steps = self.seek_home(HOME_SEEK_DIRECTION)?;
        info!("Scanner homed after {} steps", homing_steps);

        let count = self.geometry.specs_per_scan as usize;
        for index in 0..count {
            let position = self.geometry.position(index);

            self.state = if index == 0 {
                ScanState::Stepping(index)
            } else {
                ScanState::Advancing(index)
            };
            self.move_to(position.step_offset)?;

            self.state = ScanState::Exposing(index);
            let setting = handler.next_exposure();
            let intensities = self
                .hardware
                .acquire_spectrum(setting.integration_time_ms, setting.coadds)?;
            debug!(
                "Position {}/{} at {:.2} deg acquired ({})",
                index + 1,
                count,
                position.angle,
                setting
            );

            let spectrum = RawSpectrum {
                intensities,
                integration_time_ms: setting.integration_time_ms,
                coadds: setting.coadds,
                angle: position.angle,
                acquired_at: Utc::now(),
            };
            handler.on_spectrum(position, spectrum);
        }

        self.return_to_home()?;
        self.state = ScanState::Idle;
        Ok(count)
    }

    /// Step until the home switch closes, checking it before every step
    fn seek_home(&mut self, direction: MotorDirection) -> Result<u32, StationError> {
        self.state = ScanState::Homing;
        self.step_offset = None;

        if self.hardware.read_home_switch()? {
            self.mark_home();
            return Ok(0);
        }

        let max_steps = self.geometry.max_steps_home;
        for taken in 1..=max_steps {
            if self.shutdown_requested() {
                return Err(StationError::Cancelled);
            }
            self.hardware
                .step_motor(direction, self.geometry.step_type)?;
            if self.hardware.read_home_switch()? {
                self.mark_home();
                return Ok(taken);
            }
        }

        error!(
            "Home switch not found after {} steps {:?}",
            max_steps, direction
        );
        self.state = ScanState::Faulted;
        Err(StationError::HomingTimeout { max_steps })
    }

    fn mark_home(&mut self) {
        self.step_offset = Some(0);
        self.state = ScanState::AtHome;
    }

    /// Step to an absolute offset from home
    fn move_to(&mut self, target: i64) -> Result<(), StationError> {
        let current = self.step_offset.ok_or_else(|| {
            StationError::Hardware("scanner position unknown, homing required".to_string())
        })?;
        let delta = target - current;
        let direction = if delta >= 0 {
            MotorDirection::Forward
        } else {
            MotorDirection::Backward
        };

        for _ in 0..delta.unsigned_abs() {
            if self.shutdown_requested() {
                return Err(StationError::Cancelled);
            }
            self.hardware
                .step_motor(direction, self.geometry.step_type)?;
            self.step_offset = self.step_offset.map(|o| o + direction.sign());
        }
        Ok(())
    }

    /// Retrace the counted steps back to home
    fn return_to_home(&mut self) -> Result<(), StationError> {
        self.state = ScanState::ReturnToHome;
        self.move_to(0)?;
        if !self.hardware.read_home_switch()? {
            // Lost steps; the next homing corrects the count
            warn!("Home switch open after returning from scan");
        }
        Ok(())
    }

    /// Leave the controller in a defined state after `err` aborted an operation
    fn settle_after_error(&mut self, err: &StationError) {
        match err {
            StationError::HomingTimeout { .. } => self.state = ScanState::Faulted,
            _ => {
                if self.state != ScanState::Faulted {
                    self.state = ScanState::Idle;
                }
            }
        }
    }

    /// Best-effort return to home after an aborted scan
    fn recover(&mut self, err: &StationError) {
        match err {
            StationError::HomingTimeout { .. } => {
                self.state = ScanState::Faulted;
                return;
            }
            StationError::Cancelled => {
                info!("Scan cancelled, motor stopped between steps");
                self.state = ScanState::Idle;
                return;
            }
            _ => {}
        }

        let direction = match self.step_offset {
            Some(0) => {
                self.state = ScanState::Idle;
                return;
            }
            Some(offset) if offset > 0 => MotorDirection::Backward,
            Some(_) => MotorDirection::Forward,
            None => HOME_SEEK_DIRECTION,
        };

        warn!("Scan aborted ({}), attempting return to home", err);
        match self.seek_home(direction) {
            Ok(steps) => {
                info!("Recovered to home after {} steps", steps);
                self.state = ScanState::Idle;
            }
            Err(StationError::Cancelled) => {
                self.state = ScanState::Idle;
            }
            Err(recovery_err) => {
                error!("Recovery to home failed: {}", recovery_err);
                self.state = ScanState::Faulted;
            }
        }
    }
}
