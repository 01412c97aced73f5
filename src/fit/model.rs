use ndarray::{Array1, Array2, ArrayView1};

use super::reference::CrossSection;

/// Role of one entry of the parameter vector in the forward model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Index into the model's reference list
    Absorber(usize),
    Background(i32),
    Offset(i32),
    Shift(i32),
}

/// Forward model of the measured intensity over the fit window:
///
/// ```text
/// M(p) = exp(P(x_p) - Σ_k a_k σ_k(λ'_p)) + O(x_p)
/// λ'_p = λ_p + Σ_n s_n (λ_p - λ_0)^n
/// ```
///
/// `P` and `O` are polynomials over the pixel index normalised to [0, 1]
/// across the window, `λ_0` is the first wavelength of the window.
pub(crate) struct ForwardModel<'a> {
    roles: Vec<Role>,
    references: Vec<&'a CrossSection>,
    wavelengths: ArrayView1<'a, f64>,
    x: Array1<f64>,
    lambda0: f64,
}

/// Intermediate values of one evaluation, reused by the Jacobian
struct Evaluation {
    model: Array1<f64>,
    /// exp(P - A), the multiplicative part of the model
    transmitted: Array1<f64>,
    /// Shifted wavelengths
    shifted: Array1<f64>,
}

impl<'a> ForwardModel<'a> {
    pub(crate) fn new(
        roles: Vec<Role>,
        references: Vec<&'a CrossSection>,
        wavelengths: ArrayView1<'a, f64>,
    ) -> Self {
        let n = wavelengths.len();
        let x = if n > 1 {
            Array1::from_iter((0..n).map(|i| i as f64 / (n - 1) as f64))
        } else {
            Array1::zeros(n)
        };
        let lambda0 = wavelengths.first().copied().unwrap_or(0.0);

        Self {
            roles,
            references,
            wavelengths,
            x,
            lambda0,
        }
    }

    pub(crate) fn n_pixels(&self) -> usize {
        self.wavelengths.len()
    }

    fn evaluate_parts(&self, theta: &[f64]) -> Evaluation {
        let n = self.n_pixels();
        let dl = &self.wavelengths - self.lambda0;

        let mut shifted = self.wavelengths.to_owned();
        let mut log_background = Array1::<f64>::zeros(n);
        let mut offset = Array1::<f64>::zeros(n);
        for (role, &value) in self.roles.iter().zip(theta) {
            match *role {
                Role::Shift(order) => shifted.scaled_add(value, &dl.mapv(|d| d.powi(order))),
                Role::Background(order) => {
                    log_background.scaled_add(value, &self.x.mapv(|x| x.powi(order)))
                }
                Role::Offset(order) => offset.scaled_add(value, &self.x.mapv(|x| x.powi(order))),
                Role::Absorber(_) => {}
            }
        }

        let mut absorbance = Array1::<f64>::zeros(n);
        for (role, &value) in self.roles.iter().zip(theta) {
            if let Role::Absorber(k) = *role {
                let xsec = self.references[k];
                absorbance.scaled_add(value, &shifted.mapv(|wl| xsec.value_at(wl)));
            }
        }

        let transmitted = (&log_background - &absorbance).mapv(f64::exp);
        let model = &transmitted + &offset;
        Evaluation {
            model,
            transmitted,
            shifted,
        }
    }

    pub(crate) fn evaluate(&self, theta: &[f64]) -> Array1<f64> {
        self.evaluate_parts(theta).model
    }

    /// Model and its derivative with respect to every parameter, one column
    /// per entry of `theta`
    pub(crate) fn jacobian(&self, theta: &[f64]) -> (Array1<f64>, Array2<f64>) {
        let parts = self.evaluate_parts(theta);
        let n = self.n_pixels();
        let mut jac = Array2::<f64>::zeros((n, self.roles.len()));

        // d(absorbance)/d(lambda') is needed by every shift column
        let needs_slope = self.roles.iter().any(|r| matches!(r, Role::Shift(_)));
        let absorbance_slope = if needs_slope {
            let mut slope = Array1::<f64>::zeros(n);
            for (role, &value) in self.roles.iter().zip(theta) {
                if let Role::Absorber(k) = *role {
                    let xsec = self.references[k];
                    slope.scaled_add(value, &parts.shifted.mapv(|wl| xsec.slope_at(wl)));
                }
            }
            slope
        } else {
            Array1::zeros(n)
        };

        for (col, role) in self.roles.iter().enumerate() {
            let mut column = jac.column_mut(col);
            match *role {
                Role::Background(order) => {
                    column.assign(&(&parts.transmitted * &self.x.mapv(|x| x.powi(order))));
                }
                Role::Offset(order) => {
                    column.assign(&self.x.mapv(|x| x.powi(order)));
                }
                Role::Absorber(k) => {
                    let xsec = self.references[k];
                    let sigma = parts.shifted.mapv(|wl| xsec.value_at(wl));
                    column.assign(&(-&parts.transmitted * &sigma));
                }
                Role::Shift(order) => {
                    let dl = (&self.wavelengths - self.lambda0).mapv(|d| d.powi(order));
                    column.assign(&(-&parts.transmitted * &absorbance_slope * &dl));
                }
            }
        }

        (parts.model, jac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn reference() -> CrossSection {
        let wl: Vec<f64> = (0..=200).map(|i| 300.0 + i as f64 * 0.1).collect();
        let xs: Vec<f64> = wl.iter().map(|w| 1e-19 * (1.5 + (w * 2.0).sin())).collect();
        CrossSection::from_points(wl, xs).unwrap()
    }

    #[test]
    fn test_pure_background_model() {
        let xs = reference();
        let wl = Array1::linspace(305.0, 310.0, 11);
        let model = ForwardModel::new(
            vec![Role::Background(0), Role::Background(1), Role::Offset(0)],
            vec![&xs],
            wl.view(),
        );
        let m = model.evaluate(&[2.0, 1.0, 5.0]);
        assert_relative_eq!(m[0], 2.0f64.exp() + 5.0, max_relative = 1e-12);
        assert_relative_eq!(m[10], 3.0f64.exp() + 5.0, max_relative = 1e-12);
    }

    #[test]
    fn test_jacobian_matches_finite_differences() {
        let xs = reference();
        let wl = Array1::linspace(305.03, 309.97, 40);
        let roles = vec![
            Role::Background(0),
            Role::Background(1),
            Role::Offset(0),
            Role::Shift(0),
            Role::Shift(1),
            Role::Absorber(0),
        ];
        let model = ForwardModel::new(roles, vec![&xs], wl.view());
        let theta = [3.0, -0.4, 2.0, 0.013, 0.002, 4e17];
        let (_, jac) = model.jacobian(&theta);

        for col in 0..theta.len() {
            let h = (theta[col].abs() * 1e-6).max(1e-9);
            let mut up = theta;
            let mut down = theta;
            up[col] += h;
            down[col] -= h;
            let numeric = (model.evaluate(&up) - model.evaluate(&down)) / (2.0 * h);
            let scale = numeric.iter().fold(0.0f64, |m, v| m.max(v.abs()));
            assert!(scale > 0.0, "column {col} vanishes");
            for p in 0..wl.len() {
                let diff = (jac[(p, col)] - numeric[p]).abs();
                assert!(diff <= 1e-5 * scale, "column {col}, pixel {p}: {diff}");
            }
        }
    }
}
