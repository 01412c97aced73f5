use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a logical motor step. `Forward` increases the scan angle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotorDirection {
    Forward,
    Backward,
}

impl MotorDirection {
    pub fn opposite(self) -> Self {
        match self {
            MotorDirection::Forward => MotorDirection::Backward,
            MotorDirection::Backward => MotorDirection::Forward,
        }
    }

    /// Signed change of the step counter for one step in this direction
    pub fn sign(self) -> i64 {
        match self {
            MotorDirection::Forward => 1,
            MotorDirection::Backward => -1,
        }
    }
}

/// Stepper drive mode. Affects torque and resolution at the driver, never the
/// step-counting contract: one logical step is always `angle_per_step` degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    #[default]
    #[serde(alias = "single")]
    Full,
    #[serde(alias = "interleave")]
    Half,
    Double,
    #[serde(alias = "microstep")]
    Micro,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepType::Full => "full",
            StepType::Half => "half",
            StepType::Double => "double",
            StepType::Micro => "micro",
        };
        write!(f, "{name}")
    }
}

/// Integration time and coadd count for one acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureSetting {
    pub integration_time_ms: u32,
    pub coadds: u32,
}

impl ExposureSetting {
    pub fn new(integration_time_ms: u32, coadds: u32) -> Self {
        Self {
            integration_time_ms,
            coadds,
        }
    }

    /// Total exposure in ms summed over all coadds
    pub fn total_ms(&self) -> u64 {
        self.integration_time_ms as u64 * self.coadds as u64
    }
}

impl fmt::Display for ExposureSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ms x {}", self.integration_time_ms, self.coadds)
    }
}

/// One scan position. The angle is inferred from the step count relative to
/// home and is only used to tag data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanPosition {
    pub index: usize,
    /// Signed logical steps from the home position
    pub step_offset: i64,
    /// Degrees in [0, 360)
    pub angle: f64,
}

impl ScanPosition {
    /// Signed angular distance from `reference`, wrapped into (-180, 180]
    pub fn offset_from(&self, reference: f64) -> f64 {
        let diff = (self.angle - reference).rem_euclid(360.0);
        if diff > 180.0 { diff - 360.0 } else { diff }
    }
}

/// Pixel-indexed spectrum as read out from the spectrometer. Intensities are
/// summed over `coadds` exposures.
#[derive(Debug, Clone)]
pub struct RawSpectrum {
    pub intensities: Array1<f64>,
    pub integration_time_ms: u32,
    pub coadds: u32,
    pub angle: f64,
    pub acquired_at: DateTime<Utc>,
}

impl RawSpectrum {
    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }

    /// Largest summed intensity, or 0 for an empty spectrum
    pub fn peak(&self) -> f64 {
        self.intensities
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(0.0, f64::max)
    }

    pub fn exposure(&self) -> ExposureSetting {
        ExposureSetting::new(self.integration_time_ms, self.coadds)
    }
}
