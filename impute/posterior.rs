//! Pooled posterior draws and their generated quantities.

use crate::diagnostics::{self, SamplerStats};
use crate::fence::percentile;
use crate::hmc::NutsRun;
use crate::model::LinearGaussianModel;
use crate::types::StatisticalWarning;
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip, s};
use serde::{Deserialize, Serialize};

/// All post-warmup draws of one fit, pooled chain-major: draw `i` belongs to
/// chain `i / draws_per_chain`. Built once after sampling and read-only
/// afterwards.
#[derive(Clone, Debug)]
pub struct PosteriorSampleSet {
    pub parameter_names: Vec<String>,
    /// Shape (draws, D)
    pub beta: Array2<f64>,
    pub sigma: Array1<f64>,
    /// Shape (draws, N_inc), normalized speed scale
    pub y_imputed: Array2<f64>,
    /// Shape (draws, N)
    pub log_lik: Array2<f64>,
    pub n_chains: usize,
    pub draws_per_chain: usize,
    pub sampler: SamplerStats,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub q5: f64,
    pub q50: f64,
    pub q95: f64,
    pub ess_bulk: f64,
    pub rhat: f64,
}

impl PosteriorSampleSet {
    /// Pools the chains and evaluates the generated quantities of every draw
    /// in parallel.
    pub fn from_run(model: &LinearGaussianModel, run: &NutsRun) -> Self {
        let chains = &run.chains;
        let data = model.data();
        let d = model.num_coefficients();
        let n_chains = chains.len();
        let draws_per_chain = chains.first().map_or(0, |c| c.draws.nrows());
        let total = n_chains * draws_per_chain;

        let mut theta = Array2::zeros((total, d + 1));
        for (c, chain) in chains.iter().enumerate() {
            theta
                .slice_mut(s![c * draws_per_chain..(c + 1) * draws_per_chain, ..])
                .assign(&chain.draws);
        }

        let mut beta = Array2::zeros((total, d));
        let mut sigma = Array1::zeros(total);
        let mut y_imputed = Array2::zeros((total, data.n_inc));
        let mut log_lik = Array2::zeros((total, data.n));

        Zip::from(theta.rows())
            .and(beta.rows_mut())
            .and(&mut sigma)
            .and(y_imputed.rows_mut())
            .and(log_lik.rows_mut())
            .par_for_each(|t, mut b, sd, mut y, mut ll| {
                let params = model.constrain(t);
                y.assign(&model.predict_incomplete(params.beta.view()));
                ll.assign(&model.pointwise_log_lik(params.beta.view(), params.sigma));
                b.assign(&params.beta);
                *sd = params.sigma;
            });

        Self {
            parameter_names: model.parameter_names(),
            beta,
            sigma,
            y_imputed,
            log_lik,
            n_chains,
            draws_per_chain,
            sampler: SamplerStats::from_run(run),
        }
    }

    pub fn num_draws(&self) -> usize {
        self.sigma.len()
    }

    /// Reshapes one pooled column into a `(chains, draws)` matrix.
    fn by_chain(&self, column: ArrayView1<f64>) -> Array2<f64> {
        let per_chain = self.draws_per_chain;
        Array2::from_shape_fn((self.n_chains, per_chain), |(c, j)| column[c * per_chain + j])
    }

    fn summarize_column(&self, name: &str, column: ArrayView1<f64>) -> ParameterSummary {
        let mut sorted = column.to_vec();
        sorted.sort_by(f64::total_cmp);
        let by_chain = self.by_chain(column);
        ParameterSummary {
            name: name.to_string(),
            mean: column.mean().unwrap_or(f64::NAN),
            sd: if column.len() > 1 {
                column.std(1.0)
            } else {
                f64::NAN
            },
            q5: percentile(&sorted, 0.05).unwrap_or(f64::NAN),
            q50: percentile(&sorted, 0.5).unwrap_or(f64::NAN),
            q95: percentile(&sorted, 0.95).unwrap_or(f64::NAN),
            ess_bulk: diagnostics::bulk_ess(by_chain.view()),
            rhat: diagnostics::split_rhat(by_chain.view()),
        }
    }

    /// Mean, sd, 5/50/95% quantiles, bulk ESS and split R-hat of every
    /// model parameter, in sampler order.
    pub fn summarize(&self) -> Vec<ParameterSummary> {
        let mut summaries: Vec<ParameterSummary> = self
            .beta
            .axis_iter(Axis(1))
            .zip(&self.parameter_names)
            .map(|(column, name)| self.summarize_column(name, column))
            .collect();
        summaries.push(self.summarize_column("sigma", self.sigma.view()));
        summaries
    }

    /// Posterior mean of the coefficient vector.
    pub fn beta_mean(&self) -> Array1<f64> {
        self.beta
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.beta.ncols()))
    }

    /// Relative efficiency of the pooled draws: mean ESS over the model
    /// parameters divided by the number of draws. Clamped to (0, 1].
    pub fn relative_efficiency(&self) -> f64 {
        let mut columns: Vec<Array2<f64>> = self
            .beta
            .axis_iter(Axis(1))
            .map(|column| self.by_chain(column))
            .collect();
        columns.push(self.by_chain(self.sigma.view()));

        let ess: Vec<f64> = columns
            .iter()
            .map(|c| diagnostics::effective_sample_size(c.view()))
            .filter(|e| e.is_finite())
            .collect();
        if ess.is_empty() || self.num_draws() == 0 {
            return 1.0;
        }
        let mean_ess = ess.iter().sum::<f64>() / ess.len() as f64;
        (mean_ess / self.num_draws() as f64).clamp(f64::MIN_POSITIVE, 1.0)
    }

    pub fn convergence_warnings(&self, summaries: &[ParameterSummary]) -> Vec<StatisticalWarning> {
        summaries
            .iter()
            .flat_map(|summary| {
                diagnostics::parameter_warnings(&summary.name, summary.rhat, summary.ess_bulk, self.n_chains)
            })
            .collect()
    }
}
