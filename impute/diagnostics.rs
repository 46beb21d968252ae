//! Convergence diagnostics over multi-chain draws.
//!
//! Every function takes one parameter's draws as a `(chains, draws)` matrix.
//! Chains are split in half before comparison, so trends inside a single chain
//! show up as disagreement between its halves.

use crate::hmc::NutsRun;
use crate::types::StatisticalWarning;
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc_inv;
use std::f64::consts::SQRT_2;

/// Split R-hat above this value is reported as poor mixing.
pub const RHAT_THRESHOLD: f64 = 1.01;
/// Bulk ESS below this many draws per chain is reported as too small.
pub const MIN_ESS_PER_CHAIN: f64 = 100.0;

/// Splits every chain into its first and second half. Odd-length chains
/// lose their middle draw.
pub fn split_chains(draws: ArrayView2<f64>) -> Array2<f64> {
    let (chains, n) = draws.dim();
    let half = n / 2;
    let mut split = Array2::zeros((2 * chains, half));
    for (c, chain) in draws.rows().into_iter().enumerate() {
        split.row_mut(2 * c).assign(&chain.slice(s![..half]));
        split.row_mut(2 * c + 1).assign(&chain.slice(s![n - half..]));
    }
    split
}

/// Potential scale reduction on split chains. `NaN` when fewer than four
/// draws per chain are available.
pub fn split_rhat(draws: ArrayView2<f64>) -> f64 {
    if draws.ncols() < 4 {
        return f64::NAN;
    }
    let split = split_chains(draws);
    let n = split.ncols() as f64;

    let means = split.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(0));
    let within = split.var_axis(Axis(1), 1.0).mean().unwrap_or(f64::NAN);
    let between = n * means.var(1.0);

    if within == 0.0 {
        return if between == 0.0 { 1.0 } else { f64::INFINITY };
    }
    let var_plus = (n - 1.0) / n * within + between / n;
    (var_plus / within).sqrt()
}

/// Geyer initial-monotone-sequence ESS of already-split chains.
fn geyer_ess(chains: ArrayView2<f64>) -> f64 {
    let (m, n) = chains.dim();
    if n < 4 {
        return f64::NAN;
    }
    let nf = n as f64;

    let means = chains.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(m));
    let centered: Vec<Array1<f64>> = chains
        .rows()
        .into_iter()
        .zip(means.iter())
        .map(|(row, &mean)| row.mapv(|x| x - mean))
        .collect();
    let autocov = |lag: usize| -> f64 {
        centered
            .iter()
            .map(|c| c.slice(s![..n - lag]).dot(&c.slice(s![lag..])) / nf)
            .sum::<f64>()
            / m as f64
    };

    let mean_var = autocov(0) * nf / (nf - 1.0);
    if !(mean_var > 0.0) {
        return f64::NAN;
    }
    let mut var_plus = mean_var * (nf - 1.0) / nf;
    if m > 1 {
        var_plus += means.var(1.0);
    }
    let rho = |lag: usize| 1.0 - (mean_var - autocov(lag)) / var_plus;

    let mut rho_hat = vec![0.0; n];
    let mut rho_even = 1.0;
    let mut rho_odd = rho(1);
    rho_hat[0] = rho_even;
    rho_hat[1] = rho_odd;

    let mut t = 0;
    while t + 5 < n && rho_even + rho_odd > 0.0 {
        t += 2;
        rho_even = rho(t);
        rho_odd = rho(t + 1);
        if rho_even + rho_odd >= 0.0 {
            rho_hat[t] = rho_even;
            rho_hat[t + 1] = rho_odd;
        }
    }
    let max_t = t;
    if rho_even > 0.0 {
        rho_hat[max_t + 1] = rho_even;
    }

    // Enforce a monotone decreasing sequence of paired sums.
    let mut t = 0;
    while t + 4 <= max_t {
        t += 2;
        if rho_hat[t] + rho_hat[t + 1] > rho_hat[t - 2] + rho_hat[t - 1] {
            rho_hat[t] = (rho_hat[t - 2] + rho_hat[t - 1]) / 2.0;
            rho_hat[t + 1] = rho_hat[t];
        }
    }

    let total = (m * n) as f64;
    let tau = -1.0 + 2.0 * rho_hat[..max_t].iter().sum::<f64>() + rho_hat[max_t + 1];
    total / tau.max(1.0 / total.log10())
}

/// ESS of the raw split chains.
pub fn effective_sample_size(draws: ArrayView2<f64>) -> f64 {
    geyer_ess(split_chains(draws).view())
}

/// Replaces every draw by the normal score of its pooled rank (average rank
/// for ties), using the Blom offset `(r - 3/8) / (S + 1/4)`.
pub fn rank_normalize(draws: ArrayView2<f64>) -> Array2<f64> {
    let values: Vec<f64> = draws.iter().copied().collect();
    let total = values.len();
    let mut order: Vec<usize> = (0..total).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; total];
    let mut start = 0;
    while start < total {
        let mut end = start + 1;
        while end < total && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let average = (start + 1 + end) as f64 / 2.0;
        for &index in &order[start..end] {
            ranks[index] = average;
        }
        start = end;
    }

    let scale = total as f64 + 0.25;
    let scores: Vec<f64> = ranks
        .into_iter()
        .map(|r| -SQRT_2 * erfc_inv(2.0 * (r - 0.375) / scale))
        .collect();
    Array2::from_shape_vec(draws.raw_dim(), scores).unwrap_or_else(|_| Array2::zeros(draws.raw_dim()))
}

/// ESS of the rank-normalized split chains, robust to heavy tails.
pub fn bulk_ess(draws: ArrayView2<f64>) -> f64 {
    let split = split_chains(draws);
    geyer_ess(rank_normalize(split.view()).view())
}

/// Run-level figures of one sampler call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplerStats {
    pub chains: usize,
    /// Post-warmup transitions over all chains.
    pub transitions: usize,
    /// R-hat reported by the sampler, averaged over parameters.
    pub rhat_mean: f64,
    /// ESS reported by the sampler, averaged over parameters.
    pub ess_mean: f64,
}

impl SamplerStats {
    pub fn from_run(run: &NutsRun) -> Self {
        Self {
            chains: run.chains.len(),
            transitions: run.chains.iter().map(|c| c.draws.nrows()).sum(),
            rhat_mean: run.rhat_mean,
            ess_mean: run.ess_mean,
        }
    }
}

/// Mixing and ESS warnings for one parameter.
pub fn parameter_warnings(name: &str, rhat: f64, ess: f64, n_chains: usize) -> Vec<StatisticalWarning> {
    let mut warnings = Vec::new();
    if !(rhat <= RHAT_THRESHOLD) {
        warnings.push(StatisticalWarning::PoorMixing {
            parameter: name.to_string(),
            rhat,
        });
    }
    if !(ess >= MIN_ESS_PER_CHAIN * n_chains as f64) {
        warnings.push(StatisticalWarning::LowEffectiveSampleSize {
            parameter: name.to_string(),
            ess,
        });
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmc::ChainDraws;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn iid_chains(chains: usize, draws: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((chains, draws), |_| rng.sample::<f64, _>(StandardNormal))
    }

    #[test]
    fn split_drops_the_middle_of_odd_chains() {
        let draws = array![[1.0, 2.0, 3.0, 4.0, 5.0]];
        let split = split_chains(draws.view());
        assert_eq!(split, array![[1.0, 2.0], [4.0, 5.0]]);
    }

    #[test]
    fn rhat_is_near_one_for_well_mixed_chains() {
        let draws = iid_chains(4, 1000, 1);
        let rhat = split_rhat(draws.view());
        assert!((rhat - 1.0).abs() < 0.01, "rhat = {rhat}");
    }

    #[test]
    fn rhat_detects_chains_stuck_in_different_places() {
        let mut draws = iid_chains(4, 500, 2);
        draws.row_mut(3).mapv_inplace(|x| x + 5.0);
        let rhat = split_rhat(draws.view());
        assert!(rhat > 1.5, "rhat = {rhat}");
        assert!(!parameter_warnings("beta[0]", rhat, 2000.0, 4).is_empty());
    }

    #[test]
    fn rhat_detects_drift_within_a_single_chain() {
        let draws = Array2::from_shape_fn((1, 400), |(_, i)| i as f64);
        assert!(split_rhat(draws.view()) > 1.5);
    }

    #[test]
    fn ess_of_independent_draws_is_close_to_the_draw_count() {
        let draws = iid_chains(4, 1000, 3);
        let ess = effective_sample_size(draws.view());
        assert!(ess > 3000.0 && ess < 5000.0, "ess = {ess}");
        let bulk = bulk_ess(draws.view());
        assert!(bulk > 3000.0 && bulk < 5000.0, "bulk ess = {bulk}");
    }

    #[test]
    fn ess_shrinks_under_autocorrelation() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut draws = Array2::zeros((4, 1000));
        for mut chain in draws.rows_mut() {
            let mut x = 0.0;
            for value in chain.iter_mut() {
                x = 0.9 * x + rng.sample::<f64, _>(StandardNormal);
                *value = x;
            }
        }
        // An AR(1) with phi = 0.9 has tau = (1 + phi) / (1 - phi) = 19.
        let ess = effective_sample_size(draws.view());
        assert!(ess > 100.0 && ess < 400.0, "ess = {ess}");
    }

    #[test]
    fn rank_normalization_is_symmetric_and_handles_ties() {
        let draws = array![[1.0, 2.0, 2.0, 10.0]];
        let z = rank_normalize(draws.view());
        assert_eq!(z[[0, 1]], z[[0, 2]]);
        assert!((z[[0, 0]] + z[[0, 3]]).abs() < 1e-9);
        assert!(z[[0, 0]] < 0.0 && z[[0, 3]] > 0.0);
    }

    #[test]
    fn short_chains_yield_nan() {
        let draws = array![[1.0, 2.0, 3.0]];
        assert!(split_rhat(draws.view()).is_nan());
        assert!(effective_sample_size(draws.view()).is_nan());
    }

    #[test]
    fn sampler_stats_count_transitions_over_chains() {
        let run = NutsRun {
            chains: (0..3)
                .map(|chain| ChainDraws {
                    chain,
                    draws: Array2::zeros((50, 2)),
                })
                .collect(),
            rhat_mean: 1.002,
            ess_mean: 140.0,
        };
        let stats = SamplerStats::from_run(&run);
        assert_eq!(stats.chains, 3);
        assert_eq!(stats.transitions, 150);
        assert_eq!(stats.rhat_mean, 1.002);
    }
}
