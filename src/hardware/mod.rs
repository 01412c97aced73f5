pub mod simulated;

pub use simulated::{SimulatedHardware, SimulatedScene};

use ndarray::Array1;

use crate::error::StationError;
use crate::types::{MotorDirection, StepType};

/// Capability set of the station hardware: one stepper-driven scanner with a
/// home switch, and one spectrometer.
///
/// Implementations wrap the real device drivers. Every call is a blocking
/// hardware action; the scan controller never issues a step while an
/// acquisition is running or the other way round.
///
/// # Design Philosophy
/// - Motion is open loop: the adapter reports nothing about position except
///   the home switch
/// - Motor position and home status live in the caller, not in the adapter
/// - Enable testing through simulated implementations
pub trait HardwareAdapter: Send {
    // === Motion ===

    /// Issue exactly one logical step
    ///
    /// # Arguments
    /// * `direction` - `Forward` increases the scan angle
    /// * `step_type` - Drive mode used for the step
    fn step_motor(&mut self, direction: MotorDirection, step_type: StepType)
    -> Result<(), StationError>;

    /// Read the home switch
    ///
    /// # Returns
    /// `true` while the scanner sits at the home position
    fn read_home_switch(&mut self) -> Result<bool, StationError>;

    /// De-energise the motor coils
    fn release_motor(&mut self) -> Result<(), StationError>;

    // === Spectrometer ===

    /// Acquire one spectrum
    ///
    /// # Arguments
    /// * `integration_time_ms` - Single exposure time
    /// * `coadds` - Number of exposures summed before readout
    ///
    /// # Returns
    /// Pixel-indexed intensities summed over all coadds
    fn acquire_spectrum(
        &mut self,
        integration_time_ms: u32,
        coadds: u32,
    ) -> Result<Array1<f64>, StationError>;

    /// Wavelength calibration of the spectrometer in nm, one value per pixel
    fn wavelengths(&mut self) -> Result<Array1<f64>, StationError>;
}

impl<T: HardwareAdapter + ?Sized> HardwareAdapter for Box<T> {
    fn step_motor(
        &mut self,
        direction: MotorDirection,
        step_type: StepType,
    ) -> Result<(), StationError> {
        (**self).step_motor(direction, step_type)
    }

    fn read_home_switch(&mut self) -> Result<bool, StationError> {
        (**self).read_home_switch()
    }

    fn release_motor(&mut self) -> Result<(), StationError> {
        (**self).release_motor()
    }

    fn acquire_spectrum(
        &mut self,
        integration_time_ms: u32,
        coadds: u32,
    ) -> Result<Array1<f64>, StationError> {
        (**self).acquire_spectrum(integration_time_ms, coadds)
    }

    fn wavelengths(&mut self) -> Result<Array1<f64>, StationError> {
        (**self).wavelengths()
    }
}
