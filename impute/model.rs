//! Bayesian linear regression with weakly-informative priors.
//!
//! ```text
//! y      ~ Normal(X β, σ)
//! β_d    ~ Normal(0, 1)      independently for every column of X
//! σ      ~ Exponential(1)
//! ```
//!
//! The sampler works on the unconstrained vector `θ = (β, log σ)`, so the log
//! density carries the Jacobian term `log σ` of that transform. Constants that
//! do not depend on θ are dropped from the density but kept in the pointwise
//! log-likelihood, which feeds LOO.

use crate::hmc::LogDensity;
use crate::normalize::{NUM_FEATURES, NormalizedPartitions};
use ndarray::{Array1, Array2, ArrayView1};
use std::f64::consts::PI;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Data shape mismatch for '{name}': declared {declared}, found {actual}.")]
    DataShape {
        name: &'static str,
        declared: String,
        actual: String,
    },
    #[error("Invalid model specification: {0}")]
    Specification(String),
}

/// The model's data block: declared sizes plus the arrays that must agree
/// with them.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelData {
    pub n: usize,
    pub n_inc: usize,
    pub d: usize,
    pub y: Array1<f64>,
    pub x: Array2<f64>,
    pub x_inc: Array2<f64>,
}

impl ModelData {
    pub fn from_partitions(partitions: &NormalizedPartitions) -> Self {
        Self {
            n: partitions.complete.len(),
            n_inc: partitions.incomplete.len(),
            d: NUM_FEATURES,
            y: partitions.complete.response(),
            x: partitions.complete.design_matrix(),
            x_inc: partitions.incomplete.design_matrix(),
        }
    }

    /// Checks the declared dimensions against the arrays.
    pub fn validate_shapes(&self) -> Result<(), ModelError> {
        if self.y.len() != self.n {
            return Err(ModelError::DataShape {
                name: "y",
                declared: format!("[{}]", self.n),
                actual: format!("[{}]", self.y.len()),
            });
        }
        if self.x.dim() != (self.n, self.d) {
            return Err(ModelError::DataShape {
                name: "X",
                declared: format!("[{}, {}]", self.n, self.d),
                actual: format!("[{}, {}]", self.x.nrows(), self.x.ncols()),
            });
        }
        if self.x_inc.dim() != (self.n_inc, self.d) {
            return Err(ModelError::DataShape {
                name: "X_inc",
                declared: format!("[{}, {}]", self.n_inc, self.d),
                actual: format!("[{}, {}]", self.x_inc.nrows(), self.x_inc.ncols()),
            });
        }
        Ok(())
    }

    fn validate_values(&self) -> Result<(), ModelError> {
        if self.d == 0 {
            return Err(ModelError::Specification(
                "the model needs at least one coefficient (D = 0)".to_string(),
            ));
        }
        let arrays = [
            ("y", first_non_finite(self.y.iter())),
            ("X", first_non_finite(self.x.iter())),
            ("X_inc", first_non_finite(self.x_inc.iter())),
        ];
        for (name, position) in arrays {
            if let Some(idx) = position {
                return Err(ModelError::Specification(format!(
                    "non-finite value in {name} at flat index {idx}"
                )));
            }
        }
        Ok(())
    }
}

fn first_non_finite<'a>(values: impl Iterator<Item = &'a f64>) -> Option<usize> {
    values.into_iter().position(|v| !v.is_finite())
}

/// Prior hyperparameters. The families are fixed; only their scales live here.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Priors {
    /// Standard deviation of the zero-mean normal on every coefficient.
    pub coefficient_sd: f64,
    /// Rate of the exponential prior on σ.
    pub noise_rate: f64,
}

impl Default for Priors {
    fn default() -> Self {
        Self {
            coefficient_sd: 1.0,
            noise_rate: 1.0,
        }
    }
}

/// One point in parameter space, on the constrained scale.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameters {
    pub beta: Array1<f64>,
    pub sigma: f64,
}

pub fn normal_lpdf(y: f64, mu: f64, sigma: f64) -> f64 {
    let z = (y - mu) / sigma;
    -0.5 * (2.0 * PI).ln() - sigma.ln() - 0.5 * z * z
}

/// The fitted model. Data is behind an `Arc` so that cloning for chains never
/// duplicates the design matrices.
#[derive(Clone, Debug)]
pub struct LinearGaussianModel {
    data: Arc<ModelData>,
    priors: Priors,
}

impl LinearGaussianModel {
    /// Validates shapes, values and priors. Any failure is fatal: nothing is
    /// sampled from a model that did not build.
    pub fn build(data: ModelData, priors: Priors) -> Result<Self, ModelError> {
        data.validate_shapes()?;
        data.validate_values()?;
        if !(priors.coefficient_sd > 0.0 && priors.coefficient_sd.is_finite()) {
            return Err(ModelError::Specification(format!(
                "coefficient prior scale must be positive, got {}",
                priors.coefficient_sd
            )));
        }
        if !(priors.noise_rate > 0.0 && priors.noise_rate.is_finite()) {
            return Err(ModelError::Specification(format!(
                "noise prior rate must be positive, got {}",
                priors.noise_rate
            )));
        }
        log::debug!(
            "Built linear-Gaussian model: N={}, D={}, N_inc={}.",
            data.n,
            data.d,
            data.n_inc
        );
        Ok(Self {
            data: Arc::new(data),
            priors,
        })
    }

    pub fn data(&self) -> &ModelData {
        &self.data
    }

    pub fn num_coefficients(&self) -> usize {
        self.data.d
    }

    /// Labels of the unconstrained coordinates, in sampler order.
    pub fn parameter_names(&self) -> Vec<String> {
        (0..self.data.d)
            .map(|i| format!("beta[{i}]"))
            .chain(std::iter::once("sigma".to_string()))
            .collect()
    }

    pub fn constrain(&self, theta: ArrayView1<f64>) -> Parameters {
        let d = self.data.d;
        Parameters {
            beta: theta.slice(ndarray::s![..d]).to_owned(),
            sigma: theta[d].exp(),
        }
    }

    pub fn unconstrain(&self, params: &Parameters) -> Array1<f64> {
        let mut theta = Array1::zeros(self.data.d + 1);
        theta.slice_mut(ndarray::s![..self.data.d]).assign(&params.beta);
        theta[self.data.d] = params.sigma.ln();
        theta
    }

    /// Generated quantity: the linear prediction for every incomplete row.
    pub fn predict_incomplete(&self, beta: ArrayView1<f64>) -> Array1<f64> {
        self.data.x_inc.dot(&beta)
    }

    /// Generated quantity: `normal_lpdf(y[n] | X[n] β, σ)` for every complete row.
    pub fn pointwise_log_lik(&self, beta: ArrayView1<f64>, sigma: f64) -> Array1<f64> {
        let mu = self.data.x.dot(&beta);
        ndarray::Zip::from(&self.data.y)
            .and(&mu)
            .map_collect(|&y, &m| normal_lpdf(y, m, sigma))
    }

    /// Log posterior density (up to a constant) and its gradient with respect
    /// to `θ = (β, log σ)`.
    pub fn log_density_and_grad(&self, theta: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let d = self.data.d;
        let n = self.data.n as f64;
        let beta = theta.slice(ndarray::s![..d]);
        let log_sigma = theta[d];
        let sigma = log_sigma.exp();
        let inv_var = (-2.0 * log_sigma).exp();

        let residual = &self.data.y - &self.data.x.dot(&beta);
        let sum_sq = residual.dot(&residual);

        let prior_var = self.priors.coefficient_sd * self.priors.coefficient_sd;
        let rate = self.priors.noise_rate;

        let logp = -0.5 * sum_sq * inv_var - n * log_sigma - 0.5 * beta.dot(&beta) / prior_var
            - rate * sigma
            + log_sigma;

        let mut grad = Array1::zeros(d + 1);
        let grad_beta = self.data.x.t().dot(&residual) * inv_var - &beta / prior_var;
        grad.slice_mut(ndarray::s![..d]).assign(&grad_beta);
        grad[d] = sum_sq * inv_var - n - rate * sigma + 1.0;

        (logp, grad)
    }
}

impl LogDensity for LinearGaussianModel {
    fn dim(&self) -> usize {
        self.data.d + 1
    }

    fn logp_and_grad(&self, theta: ArrayView1<f64>) -> (f64, Array1<f64>) {
        self.log_density_and_grad(theta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn small_data() -> ModelData {
        ModelData {
            n: 3,
            n_inc: 2,
            d: 2,
            y: array![0.5, 0.8, 0.1],
            x: array![[0.0, 0.5], [0.3, 1.0], [0.9, 0.2]],
            x_inc: array![[0.1, 0.4], [1.0, 1.0]],
        }
    }

    #[test]
    fn shape_mismatch_is_reported_before_anything_else() {
        let mut data = small_data();
        data.n = 4;
        let err = LinearGaussianModel::build(data, Priors::default()).unwrap_err();
        assert!(matches!(err, ModelError::DataShape { name: "y", .. }), "{err}");

        let mut data = small_data();
        data.n_inc = 3;
        let err = LinearGaussianModel::build(data, Priors::default()).unwrap_err();
        assert!(matches!(err, ModelError::DataShape { name: "X_inc", .. }), "{err}");

        let mut data = small_data();
        data.x = array![[0.0, 0.5, 1.0], [0.3, 1.0, 1.0], [0.9, 0.2, 1.0]];
        let err = LinearGaussianModel::build(data, Priors::default()).unwrap_err();
        assert!(matches!(err, ModelError::DataShape { name: "X", .. }), "{err}");
    }

    #[test]
    fn invalid_specifications_do_not_build() {
        let mut data = small_data();
        data.y[1] = f64::NAN;
        assert!(matches!(
            LinearGaussianModel::build(data, Priors::default()),
            Err(ModelError::Specification(_))
        ));

        let priors = Priors {
            coefficient_sd: 0.0,
            noise_rate: 1.0,
        };
        assert!(matches!(
            LinearGaussianModel::build(small_data(), priors),
            Err(ModelError::Specification(_))
        ));

        let empty = ModelData {
            n: 0,
            n_inc: 0,
            d: 0,
            y: Array1::zeros(0),
            x: Array2::zeros((0, 0)),
            x_inc: Array2::zeros((0, 0)),
        };
        assert!(matches!(
            LinearGaussianModel::build(empty, Priors::default()),
            Err(ModelError::Specification(_))
        ));
    }

    #[test]
    fn log_density_at_origin_matches_hand_computation() {
        let model = LinearGaussianModel::build(small_data(), Priors::default()).unwrap();
        // β = 0, σ = 1: residuals are y, prior terms are 0 - 1 + 0.
        let (logp, grad) = model.log_density_and_grad(array![0.0, 0.0, 0.0].view());
        let sum_sq = 0.25 + 0.64 + 0.01;
        assert_abs_diff_eq!(logp, -0.5 * sum_sq - 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(grad[0], 0.3 * 0.8 + 0.9 * 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(grad[1], 0.5 * 0.5 + 0.8 + 0.2 * 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(grad[2], sum_sq - 3.0 - 1.0 + 1.0, epsilon = 1e-12);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let model = LinearGaussianModel::build(small_data(), Priors::default()).unwrap();
        let theta = array![0.4, -0.7, -1.3];
        let (_, grad) = model.log_density_and_grad(theta.view());

        let eps = 1e-6;
        for i in 0..theta.len() {
            let mut plus = theta.clone();
            let mut minus = theta.clone();
            plus[i] += eps;
            minus[i] -= eps;
            let (lp, _) = model.log_density_and_grad(plus.view());
            let (lm, _) = model.log_density_and_grad(minus.view());
            let fd = (lp - lm) / (2.0 * eps);
            assert!(
                (grad[i] - fd).abs() < 1e-5 * fd.abs().max(1.0),
                "Gradient mismatch at index {i}: analytical={}, fd={fd}",
                grad[i]
            );
        }
    }

    #[test]
    fn generated_quantities_follow_their_definitions() {
        let model = LinearGaussianModel::build(small_data(), Priors::default()).unwrap();
        let beta = array![2.0, -1.0];

        let predicted = model.predict_incomplete(beta.view());
        assert_abs_diff_eq!(predicted[0], 0.2 - 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(predicted[1], 1.0, epsilon = 1e-12);

        let ll = model.pointwise_log_lik(beta.view(), 0.5);
        let mu0 = -0.5;
        assert_abs_diff_eq!(ll[0], normal_lpdf(0.5, mu0, 0.5), epsilon = 1e-12);
        assert_abs_diff_eq!(
            normal_lpdf(0.0, 0.0, 1.0),
            -0.5 * (2.0 * PI).ln(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn constrain_and_unconstrain_are_inverse() {
        let model = LinearGaussianModel::build(small_data(), Priors::default()).unwrap();
        let params = Parameters {
            beta: array![1.5, -0.25],
            sigma: 0.3,
        };
        let theta = model.unconstrain(&params);
        let back = model.constrain(theta.view());
        assert_abs_diff_eq!(back.sigma, 0.3, epsilon = 1e-12);
        assert_eq!(back.beta, params.beta);
        assert_eq!(model.parameter_names(), vec!["beta[0]", "beta[1]", "sigma"]);
    }
}
