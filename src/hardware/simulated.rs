use ndarray::Array1;

use super::HardwareAdapter;
use crate::error::StationError;
use crate::types::{MotorDirection, StepType};

/// Synthetic sky seen by the simulated spectrometer
#[derive(Debug, Clone)]
pub struct SimulatedScene {
    pub wavelengths: Array1<f64>,
    /// Counts per ms of a single exposure, before absorption
    pub continuum: Array1<f64>,
    /// Cross-sections on `wavelengths` with their column density at the plume centre
    pub plume_absorbers: Vec<(Array1<f64>, f64)>,
    pub plume_centre_deg: f64,
    pub plume_width_deg: f64,
    /// Single-exposure full-well value
    pub saturation: f64,
}

impl SimulatedScene {
    /// Smooth continuum without any plume
    pub fn clear_sky(wavelengths: Array1<f64>, counts_per_ms: f64) -> Self {
        let lo = wavelengths.first().copied().unwrap_or(0.0);
        let hi = wavelengths.last().copied().unwrap_or(1.0);
        let span = (hi - lo).max(f64::EPSILON);
        let continuum = wavelengths.mapv(|wl| counts_per_ms * (0.6 + 0.4 * (wl - lo) / span));
        Self {
            wavelengths,
            continuum,
            plume_absorbers: Vec::new(),
            plume_centre_deg: 0.0,
            plume_width_deg: 10.0,
            saturation: 65535.0,
        }
    }

    pub fn with_plume(mut self, xsec: Array1<f64>, peak_column: f64, centre_deg: f64) -> Self {
        self.plume_absorbers.push((xsec, peak_column));
        self.plume_centre_deg = centre_deg;
        self
    }

    pub fn with_saturation(mut self, saturation: f64) -> Self {
        self.saturation = saturation;
        self
    }

    fn single_exposure(&self, angle: f64, integration_time_ms: u32) -> Array1<f64> {
        let distance = {
            let d = (angle - self.plume_centre_deg).rem_euclid(360.0);
            if d > 180.0 { d - 360.0 } else { d }
        };
        let weight = (-0.5 * (distance / self.plume_width_deg).powi(2)).exp();

        let mut optical_depth = Array1::<f64>::zeros(self.wavelengths.len());
        for (xsec, column) in &self.plume_absorbers {
            optical_depth.scaled_add(column * weight, xsec);
        }

        let t = integration_time_ms as f64;
        let saturation = self.saturation;
        let mut counts = &self.continuum * t;
        counts.zip_mut_with(&optical_depth, |c, od| {
            *c = (*c * (-od).exp()).min(saturation);
        });
        counts
    }
}

/// In-memory station used by tests and the `simulate` command.
///
/// The true motor position is tracked in logical steps from the home switch,
/// which closes only at position zero.
pub struct SimulatedHardware {
    scene: SimulatedScene,
    home_angle: f64,
    angle_per_step: f64,
    position: i64,
    switch_working: bool,
    fail_acquisition_at: Option<usize>,
    fail_step_at: Option<u64>,
    motor_energised: bool,

    // Action counters
    pub steps_issued: u64,
    pub acquisitions: usize,
    pub switch_reads: u64,
    pub releases: u32,
    /// True motor position at every acquisition
    pub acquisition_positions: Vec<i64>,
    /// Integration time and coadds of every acquisition
    pub acquisition_settings: Vec<(u32, u32)>,
}

impl SimulatedHardware {
    pub fn new(scene: SimulatedScene, home_angle: f64, angle_per_step: f64) -> Self {
        Self {
            scene,
            home_angle,
            angle_per_step,
            position: 0,
            switch_working: true,
            fail_acquisition_at: None,
            fail_step_at: None,
            motor_energised: false,
            steps_issued: 0,
            acquisitions: 0,
            switch_reads: 0,
            releases: 0,
            acquisition_positions: Vec::new(),
            acquisition_settings: Vec::new(),
        }
    }

    /// Place the scanner `steps` forward of home, so homing needs that many steps
    pub fn with_start_position(mut self, steps: i64) -> Self {
        self.position = steps;
        self
    }

    /// Simulate a broken or disconnected home switch
    pub fn with_broken_switch(mut self) -> Self {
        self.switch_working = false;
        self
    }

    /// Fail the `n`-th acquisition (0-based)
    pub fn with_acquisition_fault(mut self, n: usize) -> Self {
        self.fail_acquisition_at = Some(n);
        self
    }

    /// Fail the `n`-th motor step (0-based)
    pub fn with_step_fault(mut self, n: u64) -> Self {
        self.fail_step_at = Some(n);
        self
    }

    pub fn set_switch_working(&mut self, working: bool) {
        self.switch_working = working;
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn is_motor_energised(&self) -> bool {
        self.motor_energised
    }

    /// Total hardware actions issued so far
    pub fn total_actions(&self) -> u64 {
        self.steps_issued + self.acquisitions as u64 + self.switch_reads + self.releases as u64
    }

    pub fn scene_mut(&mut self) -> &mut SimulatedScene {
        &mut self.scene
    }

    fn angle(&self) -> f64 {
        (self.home_angle + self.position as f64 * self.angle_per_step).rem_euclid(360.0)
    }
}

impl HardwareAdapter for SimulatedHardware {
    fn step_motor(
        &mut self,
        direction: MotorDirection,
        _step_type: StepType,
    ) -> Result<(), StationError> {
        if self.fail_step_at == Some(self.steps_issued) {
            self.steps_issued += 1;
            return Err(StationError::Hardware(format!(
                "simulated motor driver fault at step {}",
                self.steps_issued - 1
            )));
        }
        self.steps_issued += 1;
        self.motor_energised = true;
        self.position += direction.sign();
        Ok(())
    }

    fn read_home_switch(&mut self) -> Result<bool, StationError> {
        self.switch_reads += 1;
        Ok(self.switch_working && self.position == 0)
    }

    fn release_motor(&mut self) -> Result<(), StationError> {
        self.releases += 1;
        self.motor_energised = false;
        Ok(())
    }

    fn acquire_spectrum(
        &mut self,
        integration_time_ms: u32,
        coadds: u32,
    ) -> Result<Array1<f64>, StationError> {
        let index = self.acquisitions;
        self.acquisitions += 1;
        if self.fail_acquisition_at == Some(index) {
            return Err(StationError::Hardware(format!(
                "simulated spectrometer readout failure on acquisition {index}"
            )));
        }

        self.acquisition_positions.push(self.position);
        self.acquisition_settings.push((integration_time_ms, coadds));

        let single = self.scene.single_exposure(self.angle(), integration_time_ms);
        Ok(single * coadds.max(1) as f64)
    }

    fn wavelengths(&mut self) -> Result<Array1<f64>, StationError> {
        Ok(self.scene.wavelengths.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hardware() -> SimulatedHardware {
        let wl = Array1::linspace(300.0, 330.0, 64);
        SimulatedHardware::new(SimulatedScene::clear_sky(wl, 100.0), 0.0, 1.0)
    }

    #[test]
    fn test_switch_closes_only_at_home() {
        let mut hw = hardware().with_start_position(2);
        assert!(!hw.read_home_switch().unwrap());
        hw.step_motor(MotorDirection::Backward, StepType::Full).unwrap();
        hw.step_motor(MotorDirection::Backward, StepType::Full).unwrap();
        assert!(hw.read_home_switch().unwrap());
        assert_eq!(hw.steps_issued, 2);
    }

    #[test]
    fn test_acquisition_scales_with_exposure_and_saturates() {
        let mut hw = hardware();
        let one = hw.acquire_spectrum(10, 1).unwrap();
        let three = hw.acquire_spectrum(10, 3).unwrap();
        assert!((three[5] - 3.0 * one[5]).abs() < 1e-9);

        let saturated = hw.acquire_spectrum(100_000, 2).unwrap();
        assert!(saturated.iter().all(|&v| v <= 2.0 * 65535.0));
        assert_eq!(hw.acquisition_settings, vec![(10, 1), (10, 3), (100_000, 2)]);
    }

    #[test]
    fn test_injected_faults() {
        let mut hw = hardware().with_acquisition_fault(1).with_step_fault(0);
        assert!(hw.step_motor(MotorDirection::Forward, StepType::Full).is_err());
        assert!(hw.acquire_spectrum(10, 1).is_ok());
        assert!(matches!(
            hw.acquire_spectrum(10, 1),
            Err(StationError::Hardware(_))
        ));
    }
}
