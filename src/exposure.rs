use log::{debug, info};

use crate::config::StationConfig;
use crate::types::{ExposureSetting, RawSpectrum};

/// Exposure reduction applied at least once the detector saturates
const SATURATION_BACKOFF: f64 = 0.5;

/// Intensity summary of one spectrum as seen by the exposure loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntensityReading {
    /// Peak summed intensity
    pub peak: f64,
    /// True if a single exposure reached the saturation level
    pub saturated: bool,
}

/// Outcome of one exposure update
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExposureAdjustment {
    /// Intensity inside the dead-zone, setting unchanged
    Held,
    /// Setting changed
    Adjusted {
        from: ExposureSetting,
        to: ExposureSetting,
    },
    /// A change was wanted but the bounds leave the setting where it was
    Limited,
}

/// Discrete feedback loop on integration time and coadds.
///
/// The correction is proportional, `t' = t·target/I`, snapped to the
/// integration time grid and clamped to the configured bounds. Exposure beyond
/// `max_int_time` is delivered as coadds. Intensities within `tolerance` of the
/// target leave the setting alone, and a reading with no light jumps straight
/// to the longest exposure.
#[derive(Debug, Clone)]
pub struct ExposureController {
    integration_time_ms: u32,
    coadds: u32,

    min_int_time: u32,
    /// Largest grid value not above `max_int_time`
    max_grid_time: u32,
    int_time_step: u32,
    target: f64,
    tolerance: f64,
    saturation_level: f64,
    max_coadds: u32,
}

impl ExposureController {
    pub fn new(config: &StationConfig) -> Self {
        let step = config.int_time_step.max(1);
        let span = config.max_int_time.saturating_sub(config.min_int_time);
        let max_grid_time = config.min_int_time + (span / step) * step;
        let control = &config.exposure_control;

        Self {
            integration_time_ms: config.start_int_time,
            coadds: config.start_coadds.max(1),
            min_int_time: config.min_int_time,
            max_grid_time,
            int_time_step: step,
            target: config.target_int as f64,
            tolerance: control.tolerance,
            saturation_level: control.saturation_level,
            max_coadds: control.max_coadds.max(1),
        }
    }

    pub fn current(&self) -> ExposureSetting {
        ExposureSetting::new(self.integration_time_ms, self.coadds)
    }

    pub fn integration_time_ms(&self) -> u32 {
        self.integration_time_ms
    }

    pub fn coadds(&self) -> u32 {
        self.coadds
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Representative intensity of `spectrum`
    pub fn read_intensity(&self, spectrum: &RawSpectrum) -> IntensityReading {
        let peak = spectrum.peak();
        let per_exposure = peak / spectrum.coadds.max(1) as f64;
        IntensityReading {
            peak,
            saturated: per_exposure >= self.saturation_level,
        }
    }

    /// Feed the latest spectrum back into the loop
    pub fn update_from_spectrum(&mut self, spectrum: &RawSpectrum) -> ExposureAdjustment {
        let reading = self.read_intensity(spectrum);
        self.update(reading)
    }

    /// Compute the next exposure from an intensity reading taken at the current setting
    pub fn update(&mut self, reading: IntensityReading) -> ExposureAdjustment {
        let from = self.current();
        let intensity = if reading.peak.is_finite() {
            reading.peak.max(0.0)
        } else {
            0.0
        };

        let wanted = if reading.saturated {
            from.total_ms() as f64 * (self.target / intensity).min(SATURATION_BACKOFF)
        } else if intensity > 0.0 {
            let relative_error = (intensity - self.target).abs() / self.target;
            if relative_error <= self.tolerance {
                debug!(
                    "Intensity {:.0} within {:.0}% of target, holding {}",
                    intensity,
                    self.tolerance * 100.0,
                    from
                );
                return ExposureAdjustment::Held;
            }
            from.total_ms() as f64 * self.target / intensity
        } else {
            // No light to scale from
            self.max_grid_time as f64 * self.max_coadds as f64
        };

        let (t, c) = self.quantise(wanted);
        self.integration_time_ms = t;
        self.coadds = c;

        let to = self.current();
        if to == from {
            debug!("Exposure pinned at {} (wanted {:.1} ms total)", from, wanted);
            ExposureAdjustment::Limited
        } else {
            info!(
                "Exposure {} -> {} (peak {:.0}, target {:.0}{})",
                from,
                to,
                intensity,
                self.target,
                if reading.saturated { ", saturated" } else { "" }
            );
            ExposureAdjustment::Adjusted { from, to }
        }
    }

    /// Map a desired total exposure onto the integration time grid and coadds
    fn quantise(&self, total_ms: f64) -> (u32, u32) {
        let max_t = self.max_grid_time as f64;
        if total_ms <= max_t {
            return (self.snap(total_ms), 1);
        }

        let coadds = (total_ms / max_t).round().clamp(1.0, self.max_coadds as f64) as u32;
        (self.max_grid_time, coadds)
    }

    /// Nearest grid value `min + k·step` inside the bounds
    fn snap(&self, t: f64) -> u32 {
        let step = self.int_time_step as f64;
        let k = ((t - self.min_int_time as f64) / step).round().max(0.0);
        let snapped = self.min_int_time as f64 + k * step;
        (snapped as u32).clamp(self.min_int_time, self.max_grid_time)
    }
}
