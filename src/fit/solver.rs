use nalgebra::{DMatrix, DVector};

/// Largest cosine between the residual and a free Jacobian column at a
/// stationary point
const GRADIENT_TOLERANCE: f64 = 1e-6;
/// Initial damping relative to the largest diagonal entry of the scaled
/// normal matrix
const INITIAL_DAMPING_FACTOR: f64 = 1.0;
const MAX_DAMPING: f64 = 1e16;
const MIN_DAMPING: f64 = 1e-15;
/// Smallest Cholesky pivot of the scaled normal matrix for which every free
/// parameter counts as determined by the data
const MIN_PIVOT: f64 = 1e-12;

/// A nonlinear least-squares problem `min Σ r_i(p)²`
pub(crate) trait LeastSquares {
    fn n_params(&self) -> usize;

    /// Residual vector, `None` where the model is not defined
    fn residuals(&self, params: &DVector<f64>) -> Option<DVector<f64>>;

    /// Residuals and their Jacobian, one row per residual
    fn jacobian(&self, params: &DVector<f64>) -> Option<(DVector<f64>, DMatrix<f64>)>;

    /// Largest change of each parameter in one step. Longer steps are
    /// shortened along their direction.
    fn max_step(&self) -> Option<DVector<f64>> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SolverSettings {
    pub max_iterations: u32,
    /// Relative cost improvement of an accepted step below which the fit
    /// is considered converged
    pub tolerance: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct Solution {
    pub params: DVector<f64>,
    /// Parameter covariance scaled by the residual variance, `None` when the
    /// normal matrix is singular or there are no degrees of freedom
    pub covariance: Option<DMatrix<f64>>,
    /// Sum of squared residuals
    pub cost: f64,
    pub n_residuals: usize,
    pub iterations: u32,
    pub converged: bool,
}

/// Box constraints, projected onto after every step
#[derive(Debug, Clone)]
pub(crate) struct Bounds {
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

impl Bounds {
    #[cfg(test)]
    pub fn unbounded(n: usize) -> Self {
        Self {
            lower: DVector::from_element(n, f64::NEG_INFINITY),
            upper: DVector::from_element(n, f64::INFINITY),
        }
    }

    fn project(&self, params: &mut DVector<f64>) {
        for i in 0..params.len() {
            params[i] = params[i].max(self.lower[i]).min(self.upper[i]);
        }
    }
}

/// Jacobi scaling of the normal equations: `D = sqrt(diag(JᵀJ))`, with unit
/// scale for columns that carry no information
fn column_scales(normal: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_iterator(
        normal.nrows(),
        (0..normal.nrows()).map(|i| {
            let d = normal[(i, i)].sqrt();
            if d.is_finite() && d > 0.0 { d } else { 1.0 }
        }),
    )
}

fn scale_system(
    normal: &DMatrix<f64>,
    gradient: &DVector<f64>,
    scales: &DVector<f64>,
) -> (DMatrix<f64>, DVector<f64>) {
    let m = scales.len();
    let a_hat = DMatrix::from_fn(m, m, |i, j| normal[(i, j)] / (scales[i] * scales[j]));
    let g_hat = gradient.component_div(scales);
    (a_hat, g_hat)
}

/// Gradient with the components that push a parameter further into an
/// active bound set to zero
fn blocked_removed(gradient: &DVector<f64>, params: &DVector<f64>, bounds: &Bounds) -> DVector<f64> {
    DVector::from_iterator(
        gradient.len(),
        (0..gradient.len()).map(|i| {
            let g = gradient[i];
            // The step direction is -g
            let at_lower = params[i] <= bounds.lower[i] && g > 0.0;
            let at_upper = params[i] >= bounds.upper[i] && g < 0.0;
            if at_lower || at_upper { 0.0 } else { g }
        }),
    )
}

/// Shorten `step` so that no component exceeds its limit
fn limit_step(step: &mut DVector<f64>, limits: Option<&DVector<f64>>) {
    let Some(limits) = limits else {
        return;
    };
    let factor = step
        .iter()
        .zip(limits.iter())
        .filter(|(s, l)| s.abs() > **l)
        .map(|(s, l)| l / s.abs())
        .fold(1.0, f64::min);
    if factor < 1.0 {
        *step *= factor;
    }
}

/// True if every parameter is determined by the residuals: the scaled normal
/// matrix factorises with no pivot below [`MIN_PIVOT`]
fn identifiable(jacobian: &DMatrix<f64>) -> bool {
    let normal = jacobian.transpose() * jacobian;
    let m = normal.nrows();
    if (0..m).any(|i| !(normal[(i, i)] > 0.0 && normal[(i, i)].is_finite())) {
        return false;
    }
    let scales = column_scales(&normal);
    let a_hat = DMatrix::from_fn(m, m, |i, j| normal[(i, j)] / (scales[i] * scales[j]));
    match a_hat.cholesky() {
        Some(chol) => chol.l().diagonal().iter().all(|d| d * d >= MIN_PIVOT),
        None => false,
    }
}

/// Levenberg-Marquardt with Jacobi scaling.
///
/// Each iteration solves `(Â + λI) δ̂ = -ĝ` in scaled coordinates, starting
/// from `λ = max diag Â`. A step is accepted only if it lowers the cost; `λ`
/// then follows the ratio of actual to predicted reduction, otherwise it
/// grows and the step is retried.
///
/// The fit stops when an accepted step improves the cost by less than
/// `tolerance` relative, when the scaled gradient vanishes, or when no
/// damping can lower the cost any more. Any of these counts as converged
/// only if every parameter is determined by the data; a point where some
/// Jacobian column vanishes is a plateau, not a minimum.
pub(crate) fn levenberg_marquardt<P: LeastSquares>(
    problem: &P,
    initial: DVector<f64>,
    bounds: &Bounds,
    settings: SolverSettings,
) -> Result<Solution, String> {
    let m = problem.n_params();
    let limits = problem.max_step();
    let mut params = initial;
    bounds.project(&mut params);

    let (mut residuals, mut jacobian) = problem
        .jacobian(&params)
        .ok_or_else(|| "model undefined at the initial parameters".to_string())?;
    let n = residuals.len();
    let mut cost = residuals.norm_squared();
    if !cost.is_finite() {
        return Err("non-finite residuals at the initial parameters".to_string());
    }

    let mut damping: Option<f64> = None;
    let mut growth = 2.0;
    let mut iterations = 0;
    let mut stopped = false;

    while iterations < settings.max_iterations && !stopped {
        iterations += 1;

        let normal = jacobian.transpose() * &jacobian;
        let gradient = jacobian.transpose() * &residuals;
        let scales = column_scales(&normal);
        let (a_hat, g_hat) = scale_system(&normal, &gradient, &scales);
        let mut lambda = damping
            .unwrap_or_else(|| INITIAL_DAMPING_FACTOR * a_hat.diagonal().max().max(MIN_DAMPING));

        // |ĝ_i| / |r| is the cosine between the residual and column i
        let free_gradient = blocked_removed(&g_hat, &params, bounds);
        if cost == 0.0 || free_gradient.amax() <= GRADIENT_TOLERANCE * cost.sqrt() {
            stopped = true;
            break;
        }

        let mut accepted = false;
        while lambda <= MAX_DAMPING {
            let damped = &a_hat + DMatrix::identity(m, m) * lambda;
            let Some(chol) = damped.cholesky() else {
                lambda *= growth;
                growth *= 2.0;
                continue;
            };
            let mut step = chol.solve(&(-&g_hat)).component_div(&scales);
            limit_step(&mut step, limits.as_ref());

            let mut candidate = &params + step;
            bounds.project(&mut candidate);
            let taken = &candidate - &params;
            let predicted = cost - (&residuals + &jacobian * &taken).norm_squared();

            let new_cost = problem
                .residuals(&candidate)
                .map(|r| r.norm_squared())
                .filter(|c| c.is_finite());

            match new_cost {
                Some(new_cost) if new_cost < cost && predicted > 0.0 => {
                    let Some((r, j)) = problem.jacobian(&candidate) else {
                        lambda *= growth;
                        growth *= 2.0;
                        continue;
                    };
                    let gain = (cost - new_cost) / predicted;
                    let improvement = (cost - new_cost) / cost;
                    params = candidate;
                    residuals = r;
                    jacobian = j;
                    cost = new_cost;
                    lambda = (lambda * (1.0 / 3.0f64).max(1.0 - (2.0 * gain - 1.0).powi(3)))
                        .max(MIN_DAMPING);
                    growth = 2.0;
                    accepted = true;
                    if improvement < settings.tolerance {
                        stopped = true;
                    }
                    break;
                }
                _ => {
                    lambda *= growth;
                    growth *= 2.0;
                }
            }
        }
        damping = Some(lambda);

        if !accepted {
            // Not even a vanishing step lowers the cost
            stopped = true;
            break;
        }
    }

    let converged = stopped && identifiable(&jacobian);
    let covariance = covariance(&jacobian, cost, n, m);
    Ok(Solution {
        params,
        covariance,
        cost,
        n_residuals: n,
        iterations,
        converged,
    })
}

/// `D⁻¹ Â⁻¹ D⁻¹ · SSR / (n - m)`
fn covariance(jacobian: &DMatrix<f64>, cost: f64, n: usize, m: usize) -> Option<DMatrix<f64>> {
    if n <= m {
        return None;
    }
    let normal = jacobian.transpose() * jacobian;
    let scales = column_scales(&normal);
    let a_hat = DMatrix::from_fn(m, m, |i, j| normal[(i, j)] / (scales[i] * scales[j]));
    let inverse = a_hat.cholesky()?.inverse();
    let variance = cost / (n - m) as f64;
    Some(DMatrix::from_fn(m, m, |i, j| {
        inverse[(i, j)] / (scales[i] * scales[j]) * variance
    }))
}
