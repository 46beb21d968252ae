//! NUTS sampling using mini-mcmc.
//!
//! mini-mcmc runs the chains in parallel, tunes the step size during warm-up
//! and draws its own progress bars. This module supplies what it leaves to the
//! caller:
//!
//! - starting points, drawn uniformly on `(-init_radius, init_radius)` from the
//!   configured seed and retried until the density is finite;
//! - an adapter from an ndarray log density with an analytic gradient to the
//!   tensor interface of [`GradientTarget`];
//! - the reshaping of the `[chains, samples, dim]` output into one matrix per
//!   chain.
//!
//! mini-mcmc clones the target once per chain, so a [`LogDensity`] should keep
//! its data behind an `Arc`.

use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::tensor::TensorData;
use mini_mcmc::distributions::GradientTarget;
use mini_mcmc::nuts::NUTS;
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend type for NUTS - uses f64 for numerical precision
pub type NutsBackend = Autodiff<NdArray<f64>>;

/// A differentiable log density on an unconstrained space.
pub trait LogDensity: Clone + Send + Sync + 'static {
    fn dim(&self) -> usize;

    /// Log density (up to a constant) and its gradient at `theta`.
    fn logp_and_grad(&self, theta: ArrayView1<f64>) -> (f64, Array1<f64>);
}

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("Invalid sampler configuration: {0}")]
    InvalidConfig(String),
    #[error(
        "Chain {chain}: no initial point with a finite log density was found after {attempts} attempts."
    )]
    Initialization { chain: usize, attempts: usize },
    #[error("NUTS sampling failed: {0}")]
    Sampler(String),
    #[error("NUTS returned draws that do not fit {chains} chains x {samples} samples x {dim} parameters: {reason}")]
    Output {
        chains: usize,
        samples: usize,
        dim: usize,
        reason: String,
    },
}

/// Configuration for NUTS sampling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutsConfig {
    /// Number of draws kept per chain (after warm-up)
    pub n_samples: usize,
    /// Number of warm-up iterations per chain
    pub n_warmup: usize,
    /// Number of parallel chains
    pub n_chains: usize,
    /// Target acceptance probability (0.6-0.9 recommended)
    pub target_accept: f64,
    /// Seed for the starting points and the sampler. Must fit in a TOML
    /// integer, i.e. at most `i64::MAX`.
    pub seed: u64,
    /// Initial values are drawn uniformly from (-radius, radius) on the
    /// unconstrained scale
    pub init_radius: f64,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            n_samples: 1000,
            n_warmup: 1000,
            n_chains: 4,
            target_accept: 0.8,
            seed: 4444,
            init_radius: 2.0,
        }
    }
}

impl NutsConfig {
    pub fn validate(&self) -> Result<(), SamplingError> {
        if self.n_chains == 0 {
            return Err(SamplingError::InvalidConfig("at least one chain is required".into()));
        }
        if self.n_samples == 0 {
            return Err(SamplingError::InvalidConfig(
                "at least one post-warmup draw per chain is required".into(),
            ));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(SamplingError::InvalidConfig(format!(
                "target acceptance must lie in (0, 1), got {}",
                self.target_accept
            )));
        }
        if self.seed > i64::MAX as u64 {
            return Err(SamplingError::InvalidConfig(format!(
                "seed must be at most {} so the report can record it, got {}",
                i64::MAX,
                self.seed
            )));
        }
        if !(self.init_radius >= 0.0 && self.init_radius.is_finite()) {
            return Err(SamplingError::InvalidConfig(format!(
                "initialization radius must be finite and non-negative, got {}",
                self.init_radius
            )));
        }
        Ok(())
    }
}

/// Post-warmup draws of one chain, on the unconstrained scale.
#[derive(Clone, Debug)]
pub struct ChainDraws {
    pub chain: usize,
    /// Shape (n_samples, dim)
    pub draws: Array2<f64>,
}

/// Output of one sampler run.
#[derive(Clone, Debug)]
pub struct NutsRun {
    /// In chain order.
    pub chains: Vec<ChainDraws>,
    /// Sampler-reported R-hat, averaged over parameters.
    pub rhat_mean: f64,
    /// Sampler-reported effective sample size, averaged over parameters.
    pub ess_mean: f64,
}

const INIT_ATTEMPTS: usize = 100;

/// Presents a [`LogDensity`] to mini-mcmc.
#[derive(Clone)]
struct TensorTarget<T> {
    density: T,
}

impl<T: LogDensity> TensorTarget<T> {
    /// Evaluates the density at a position tensor. A position that cannot be
    /// read back, or has the wrong length, has zero density.
    fn evaluate(&self, z: Tensor<NutsBackend, 1>) -> (f64, Array1<f64>) {
        let dim = self.density.dim();
        match z.into_data().to_vec::<f64>() {
            Ok(values) if values.len() == dim => self.density.logp_and_grad(ArrayView1::from(&values[..])),
            _ => (f64::NEG_INFINITY, Array1::zeros(dim)),
        }
    }
}

impl<T: LogDensity> GradientTarget<f64, NutsBackend> for TensorTarget<T> {
    fn unnorm_logp(&self, z: Tensor<NutsBackend, 1>) -> Tensor<NutsBackend, 1> {
        let device = z.device();
        let (logp, _) = self.evaluate(z);
        Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![logp], [1]), &device)
    }

    fn unnorm_logp_and_grad(
        &self,
        z: Tensor<NutsBackend, 1>,
    ) -> (Tensor<NutsBackend, 1>, Tensor<NutsBackend, 1>) {
        let device = z.device();
        let (logp, grad) = self.evaluate(z);

        let logp_tensor = Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![logp], [1]), &device);
        let dim = grad.len();
        let grad_tensor = Tensor::<NutsBackend, 1>::from_data(TensorData::new(grad.to_vec(), [dim]), &device);

        (logp_tensor, grad_tensor)
    }
}

/// One starting point per chain, all drawn from a single RNG seeded with
/// `config.seed`.
fn initial_positions<T: LogDensity>(
    target: &T,
    config: &NutsConfig,
) -> Result<Vec<Vec<f64>>, SamplingError> {
    let dim = target.dim();
    let radius = config.init_radius;
    let mut rng = StdRng::seed_from_u64(config.seed);

    (0..config.n_chains)
        .map(|chain| {
            for _ in 0..INIT_ATTEMPTS {
                let point: Array1<f64> = (0..dim)
                    .map(|_| if radius > 0.0 { rng.gen_range(-radius..radius) } else { 0.0 })
                    .collect();
                let (logp, grad) = target.logp_and_grad(point.view());
                if logp.is_finite() && grad.iter().all(|g| g.is_finite()) {
                    return Ok(point.to_vec());
                }
            }
            Err(SamplingError::Initialization {
                chain,
                attempts: INIT_ATTEMPTS,
            })
        })
        .collect()
}

/// Splits the flat `[chains, samples, dim]` buffer into per-chain matrices.
fn split_by_chain(
    data: Vec<f64>,
    chains: usize,
    samples: usize,
    dim: usize,
) -> Result<Vec<ChainDraws>, SamplingError> {
    let output_error = |reason: String| SamplingError::Output {
        chains,
        samples,
        dim,
        reason,
    };
    if data.len() != chains * samples * dim {
        return Err(output_error(format!("buffer holds {} values", data.len())));
    }

    let per_chain = samples * dim;
    data.chunks(per_chain.max(1))
        .take(chains)
        .enumerate()
        .map(|(chain, block)| {
            Array2::from_shape_vec((samples, dim), block.to_vec())
                .map(|draws| ChainDraws { chain, draws })
                .map_err(|e| output_error(e.to_string()))
        })
        .collect()
}

/// Runs `config.n_chains` chains and returns their post-warmup draws.
pub fn run_chains<T: LogDensity>(target: &T, config: &NutsConfig) -> Result<NutsRun, SamplingError> {
    config.validate()?;
    let dim = target.dim();
    log::info!(
        "Sampling {} chains x {} draws ({} warm-up) over {} parameters with seed {}.",
        config.n_chains,
        config.n_samples,
        config.n_warmup,
        dim,
        config.seed
    );

    let initial_positions = initial_positions(target, config)?;
    let mut sampler = NUTS::<f64, NutsBackend, TensorTarget<T>>::new(
        TensorTarget {
            density: target.clone(),
        },
        initial_positions,
        config.target_accept,
    )
    .set_seed(config.seed);

    let (samples_tensor, run_stats) = sampler
        .run_progress(config.n_samples, config.n_warmup)
        .map_err(|e| SamplingError::Sampler(e.to_string()))?;
    log::info!("NUTS sampling complete: {}", run_stats);

    let shape = samples_tensor.dims();
    let (n_chains, n_samples) = (shape[0], shape[1]);
    let data = samples_tensor
        .into_data()
        .to_vec::<f64>()
        .map_err(|e| SamplingError::Output {
            chains: n_chains,
            samples: n_samples,
            dim,
            reason: format!("{e:?}"),
        })?;

    Ok(NutsRun {
        chains: split_by_chain(data, n_chains, n_samples, dim)?,
        rhat_mean: f64::from(run_stats.rhat.mean),
        ess_mean: f64::from(run_stats.ess.mean),
    })
}
