//! Per-spectrum retrieval of column densities.
//!
//! The measured spectrum is fitted in optical-density space over a wavelength
//! window: the residual is `ln I - ln M` with `M` the forward model of
//! [`model::ForwardModel`]. Minimisation is Levenberg-Marquardt on the free
//! parameters of the configured table. Wavelength shift terms are held at
//! their initial values until the other free parameters have settled, then
//! released with a bounded step.

mod model;
pub mod reference;
mod solver;

pub use reference::CrossSection;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, s};
use std::ops::Range;
use std::path::PathBuf;

use crate::config::{FitControlConfig, FitParameterSpec, FitParameterTable, FitTerm};
use crate::error::StationError;
use crate::types::RawSpectrum;
use model::{ForwardModel, Role};
use solver::{Bounds, LeastSquares, Solution, SolverSettings, levenberg_marquardt};

/// Largest wavelength change from one shift term in a single solver step,
/// in nm at the far end of the window
const MAX_SHIFT_STEP_NM: f64 = 0.1;

/// Quality of one retrieval
#[derive(Debug, Clone, PartialEq)]
pub enum FitStatus {
    Converged,
    /// Iteration cap reached, values are not a valid retrieval
    NotConverged,
    /// The fit could not be carried out for this position
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FittedParameter {
    pub name: String,
    pub value: f64,
    /// One standard deviation, 0 for fixed parameters and NaN when unavailable
    pub uncertainty: f64,
    pub vary: bool,
}

/// Outcome of fitting one spectrum. Parameters are in table order.
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    pub status: FitStatus,
    pub parameters: Vec<FittedParameter>,
    /// RMS of the optical-density residual over the fit window
    pub rms_residual: f64,
    pub iterations: u32,
}

impl FitResult {
    /// Result for a position whose fit could not run. Values are the initial
    /// ones from the table.
    pub fn failed(table: &FitParameterTable, reason: impl Into<String>) -> Self {
        Self {
            status: FitStatus::Failed {
                reason: reason.into(),
            },
            parameters: table
                .iter()
                .map(|p| FittedParameter {
                    name: p.name.clone(),
                    value: p.value,
                    uncertainty: f64::NAN,
                    vary: p.vary,
                })
                .collect(),
            rms_residual: f64::NAN,
            iterations: 0,
        }
    }

    /// True only for converged fits; anything else is not a retrieval
    pub fn is_valid(&self) -> bool {
        self.status == FitStatus::Converged
    }

    pub fn parameter(&self, name: &str) -> Option<&FittedParameter> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Retrieved column density of `species`, whatever the fit status
    pub fn column_density(&self, species: &str) -> Option<f64> {
        self.parameter(species).map(|p| p.value)
    }
}

struct LoadedReference {
    name: String,
    path: PathBuf,
    cross_section: Result<CrossSection, String>,
}

/// Retrieval engine for one session. Read-only once built, so it can be
/// shared between fit workers.
pub struct FitEngine {
    parameters: FitParameterTable,
    wavelengths: Array1<f64>,
    window: Range<usize>,
    roles: Vec<Role>,
    /// Absorber references in table order
    references: Vec<LoadedReference>,
    settings: SolverSettings,
}

impl FitEngine {
    /// Build the engine for a calibration and parameter table.
    ///
    /// Reference files are read here. A file that cannot be read does not
    /// fail construction; every fit reports it as `MissingReference` instead.
    pub fn new(
        parameters: &FitParameterTable,
        wavelengths: Array1<f64>,
        control: &FitControlConfig,
    ) -> Self {
        let mut roles = Vec::with_capacity(parameters.len());
        let mut references = Vec::new();

        for p in parameters {
            let role = match &p.term {
                FitTerm::Background { order } => Role::Background(*order as i32),
                FitTerm::Offset { order } => Role::Offset(*order as i32),
                FitTerm::Shift { order } => Role::Shift(*order as i32),
                FitTerm::Absorber { xpath } => {
                    let cross_section = CrossSection::load(xpath);
                    match &cross_section {
                        Ok(xs) => debug!(
                            "Loaded {} reference from {} ({} points)",
                            p.name,
                            xpath.display(),
                            xs.len()
                        ),
                        Err(reason) => warn!(
                            "Reference for {} unreadable at {}: {}",
                            p.name,
                            xpath.display(),
                            reason
                        ),
                    }
                    references.push(LoadedReference {
                        name: p.name.clone(),
                        path: xpath.clone(),
                        cross_section,
                    });
                    Role::Absorber(references.len() - 1)
                }
            };
            roles.push(role);
        }

        let [lo, hi] = control.fit_window;
        let inside: Vec<usize> = wavelengths
            .iter()
            .enumerate()
            .filter(|(_, wl)| (lo..=hi).contains(*wl))
            .map(|(i, _)| i)
            .collect();
        let window = match (inside.first(), inside.last()) {
            (Some(&first), Some(&last)) => first..last + 1,
            _ => 0..0,
        };
        debug!(
            "Fit window {:.1}-{:.1} nm covers pixels {:?}",
            lo, hi, window
        );

        Self {
            parameters: parameters.clone(),
            wavelengths,
            window,
            roles,
            references,
            settings: SolverSettings {
                max_iterations: control.max_iterations,
                tolerance: control.tolerance,
            },
        }
    }

    pub fn parameters(&self) -> &FitParameterTable {
        &self.parameters
    }

    /// Pixel range of the fit window
    pub fn window(&self) -> Range<usize> {
        self.window.clone()
    }

    /// Fit one spectrum.
    ///
    /// # Errors
    /// `InvalidSpectrum` for a spectrum that cannot be fitted (wrong length,
    /// non-positive or flat intensities in the window, fewer pixels than free
    /// parameters) and `MissingReference` when a reference file was
    /// unreadable. Non-convergence is not an error; it is reported through
    /// [`FitResult::status`].
    pub fn fit(&self, spectrum: &RawSpectrum) -> Result<FitResult, StationError> {
        if spectrum.len() != self.wavelengths.len() {
            return Err(StationError::InvalidSpectrum(format!(
                "{} pixels but the calibration has {}",
                spectrum.len(),
                self.wavelengths.len()
            )));
        }

        for reference in &self.references {
            if let Err(reason) = &reference.cross_section {
                return Err(StationError::MissingReference {
                    name: reference.name.clone(),
                    path: reference.path.clone(),
                    reason: reason.clone(),
                });
            }
        }

        let free: Vec<usize> = self
            .parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| p.vary)
            .map(|(i, _)| i)
            .collect();

        let (start, end) = (self.window.start, self.window.end);
        let measured = spectrum.intensities.slice(s![start..end]);
        if measured.len() <= free.len() {
            return Err(StationError::InvalidSpectrum(format!(
                "fit window holds {} pixels for {} free parameters",
                measured.len(),
                free.len()
            )));
        }
        if let Some(bad) = measured.iter().position(|v| !(v.is_finite() && *v > 0.0)) {
            return Err(StationError::InvalidSpectrum(format!(
                "non-positive intensity {} at pixel {}",
                measured[bad],
                start + bad
            )));
        }
        let (min, max) = measured
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if max - min <= f64::EPSILON * max {
            return Err(StationError::InvalidSpectrum(
                "zero variance across the fit window".to_string(),
            ));
        }

        let references: Vec<&CrossSection> = self
            .references
            .iter()
            .filter_map(|r| r.cross_section.as_ref().ok())
            .collect();
        let window_wavelengths = self.wavelengths.slice(s![start..end]);
        let span = window_wavelengths[window_wavelengths.len() - 1] - window_wavelengths[0];
        let model = ForwardModel::new(self.roles.clone(), references, window_wavelengths);
        let log_measured = measured.mapv(f64::ln);
        let mut base: Vec<f64> = self.parameters.iter().map(|p| p.value).collect();
        let mut settings = self.settings;
        let mut iterations = 0;

        // Shift terms are held at their initial values until the remaining
        // parameters have settled
        let settle: Vec<usize> = free
            .iter()
            .copied()
            .filter(|&i| !matches!(self.roles[i], Role::Shift(_)))
            .collect();
        if !settle.is_empty() && settle.len() < free.len() {
            let problem = WindowProblem {
                model: &model,
                log_measured: &log_measured,
                base: base.clone(),
                free: settle,
                max_step: None,
            };
            let solution = match self.solve(&problem, settings) {
                Ok(solution) => solution,
                Err(reason) => {
                    warn!("Fit at {:.2} deg failed: {}", spectrum.angle, reason);
                    return Ok(FitResult::failed(&self.parameters, reason));
                }
            };
            base = problem.full(&solution.params);
            iterations = solution.iterations;
            settings.max_iterations = settings.max_iterations.saturating_sub(iterations);
        }

        let max_step = DVector::from_iterator(
            free.len(),
            free.iter().map(|&i| match self.roles[i] {
                Role::Shift(order) if span > 0.0 => MAX_SHIFT_STEP_NM / span.powi(order),
                _ => f64::INFINITY,
            }),
        );
        let problem = WindowProblem {
            model: &model,
            log_measured: &log_measured,
            base,
            free: free.clone(),
            max_step: Some(max_step),
        };
        let solution = match self.solve(&problem, settings) {
            Ok(solution) => solution,
            Err(reason) => {
                warn!("Fit at {:.2} deg failed: {}", spectrum.angle, reason);
                return Ok(FitResult::failed(&self.parameters, reason));
            }
        };
        let iterations = iterations + solution.iterations;

        let full = problem.full(&solution.params);
        let parameters = self
            .parameters
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let uncertainty = match free.iter().position(|&f| f == i) {
                    Some(k) => solution
                        .covariance
                        .as_ref()
                        .map_or(f64::NAN, |cov| cov[(k, k)].max(0.0).sqrt()),
                    None => 0.0,
                };
                FittedParameter {
                    name: p.name.clone(),
                    value: full[i],
                    uncertainty,
                    vary: p.vary,
                }
            })
            .collect();

        let status = if solution.converged {
            FitStatus::Converged
        } else {
            FitStatus::NotConverged
        };
        debug!(
            "Fit at {:.2} deg: {:?} after {} iterations",
            spectrum.angle, status, iterations
        );

        Ok(FitResult {
            status,
            parameters,
            rms_residual: (solution.cost / solution.n_residuals as f64).sqrt(),
            iterations,
        })
    }

    /// Minimise over `problem.free`, starting from `problem.base`
    fn solve(&self, problem: &WindowProblem<'_>, settings: SolverSettings) -> Result<Solution, String> {
        let specs: Vec<&FitParameterSpec> = self.parameters.iter().collect();
        let bounds = Bounds {
            lower: DVector::from_iterator(
                problem.free.len(),
                problem
                    .free
                    .iter()
                    .map(|&i| specs[i].lo_bound.unwrap_or(f64::NEG_INFINITY)),
            ),
            upper: DVector::from_iterator(
                problem.free.len(),
                problem
                    .free
                    .iter()
                    .map(|&i| specs[i].hi_bound.unwrap_or(f64::INFINITY)),
            ),
        };
        let initial = DVector::from_iterator(
            problem.free.len(),
            problem.free.iter().map(|&i| problem.base[i]),
        );
        levenberg_marquardt(problem, initial, &bounds, settings)
    }
}

/// Optical-density residual over the fit window, in the free parameters only
struct WindowProblem<'a> {
    model: &'a ForwardModel<'a>,
    log_measured: &'a Array1<f64>,
    /// Full parameter vector holding the fixed values
    base: Vec<f64>,
    free: Vec<usize>,
    max_step: Option<DVector<f64>>,
}

impl WindowProblem<'_> {
    fn full(&self, params: &DVector<f64>) -> Vec<f64> {
        let mut theta = self.base.clone();
        for (k, &i) in self.free.iter().enumerate() {
            theta[i] = params[k];
        }
        theta
    }

    fn model_is_valid(model: &Array1<f64>) -> bool {
        model.iter().all(|m| m.is_finite() && *m > 0.0)
    }
}

impl LeastSquares for WindowProblem<'_> {
    fn n_params(&self) -> usize {
        self.free.len()
    }

    fn residuals(&self, params: &DVector<f64>) -> Option<DVector<f64>> {
        let model = self.model.evaluate(&self.full(params));
        if !Self::model_is_valid(&model) {
            return None;
        }
        Some(DVector::from_iterator(
            model.len(),
            self.log_measured
                .iter()
                .zip(model.iter())
                .map(|(l, m)| l - m.ln()),
        ))
    }

    fn jacobian(&self, params: &DVector<f64>) -> Option<(DVector<f64>, DMatrix<f64>)> {
        let (model, dm) = self.model.jacobian(&self.full(params));
        if !Self::model_is_valid(&model) {
            return None;
        }
        let residuals = DVector::from_iterator(
            model.len(),
            self.log_measured
                .iter()
                .zip(model.iter())
                .map(|(l, m)| l - m.ln()),
        );
        let jacobian = DMatrix::from_fn(model.len(), self.free.len(), |p, k| {
            -dm[(p, self.free[k])] / model[p]
        });
        Some((residuals, jacobian))
    }

    fn max_step(&self) -> Option<DVector<f64>> {
        self.max_step.clone()
    }
}
