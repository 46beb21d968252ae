//! Posterior predictive distributions for the sites that were fenced out.
//!
//! Each incomplete site gets the draw-wise sequence of its linear prediction.
//! Summaries are given on the normalized scale the model was fitted on and on
//! the patients-per-month scale recovered through the complete partition's
//! maximum speed.

use crate::fence::percentile;
use crate::normalize::{Partition, ScalingConstants};
use crate::posterior::PosteriorSampleSet;
use crate::types::SiteKey;
use itertools::{Itertools, MinMaxResult};
use ndarray::{ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputationOptions {
    pub histogram_bins: usize,
    /// Probability mass of the reported central interval.
    pub interval_mass: f64,
}

impl Default for ImputationOptions {
    fn default() -> Self {
        Self {
            histogram_bins: 20,
            interval_mass: 0.9,
        }
    }
}

/// Equal-width histogram over the range of the draws.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// `counts.len() + 1` ascending bin edges.
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
}

impl Histogram {
    pub fn from_values(values: &[f64], bins: usize) -> Self {
        let bins = bins.max(1);
        let (lo, hi) = match values.iter().copied().minmax_by(f64::total_cmp) {
            MinMaxResult::NoElements => {
                return Self {
                    edges: Vec::new(),
                    counts: Vec::new(),
                };
            }
            MinMaxResult::OneElement(v) => (v, v),
            MinMaxResult::MinMax(lo, hi) => (lo, hi),
        };
        if lo == hi {
            return Self {
                edges: vec![lo, hi],
                counts: vec![values.len()],
            };
        }

        let width = (hi - lo) / bins as f64;
        let edges: Vec<f64> = (0..=bins).map(|i| lo + width * i as f64).collect();
        let mut counts = vec![0; bins];
        for &v in values {
            let bin = (((v - lo) / width) as usize).min(bins - 1);
            counts[bin] += 1;
        }
        Self { edges, counts }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictiveSummary {
    pub mean: f64,
    pub sd: f64,
    pub q5: f64,
    pub q50: f64,
    pub q95: f64,
    pub lower: f64,
    pub upper: f64,
}

impl PredictiveSummary {
    fn from_sorted(sorted: &[f64], interval_mass: f64) -> Self {
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let sd = if sorted.len() > 1 {
            (sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            f64::NAN
        };
        let tail = (1.0 - interval_mass) / 2.0;
        let q = |p: f64| percentile(sorted, p).unwrap_or(f64::NAN);
        Self {
            mean,
            sd,
            q5: q(0.05),
            q50: q(0.5),
            q95: q(0.95),
            lower: q(tail),
            upper: q(1.0 - tail),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictiveDistribution {
    pub interval_mass: f64,
    pub key: SiteKey,
    /// Normalized scale (fraction of the complete partition's maximum speed).
    pub normalized: PredictiveSummary,
    /// Patients per month.
    pub patients_per_month: PredictiveSummary,
    /// Histogram of the patients-per-month draws.
    pub histogram: Histogram,
    #[serde(skip)]
    pub draws: Vec<f64>,
}

impl PredictiveDistribution {
    pub fn from_draws(
        key: SiteKey,
        draws: ArrayView1<f64>,
        scaling: &ScalingConstants,
        options: &ImputationOptions,
    ) -> Self {
        let draws = draws.to_vec();
        let mut sorted = draws.clone();
        sorted.sort_by(f64::total_cmp);
        let mut restored: Vec<f64> = sorted.iter().map(|&v| scaling.restore_speed(v)).collect();
        restored.sort_by(f64::total_cmp);

        Self {
            key,
            normalized: PredictiveSummary::from_sorted(&sorted, options.interval_mass),
            patients_per_month: PredictiveSummary::from_sorted(&restored, options.interval_mass),
            interval_mass: options.interval_mass,
            histogram: Histogram::from_values(&restored, options.histogram_bins),
            draws,
        }
    }
}

/// One predictive distribution per incomplete row, in partition order.
pub fn predictive_distributions(
    posterior: &PosteriorSampleSet,
    incomplete: &Partition,
    scaling: &ScalingConstants,
    options: &ImputationOptions,
) -> Vec<PredictiveDistribution> {
    let columns: Vec<ArrayView1<f64>> = posterior.y_imputed.axis_iter(Axis(1)).collect();
    let distributions: Vec<PredictiveDistribution> = columns
        .into_par_iter()
        .zip(incomplete.rows.par_iter())
        .map(|(draws, row)| PredictiveDistribution::from_draws(row.key.clone(), draws, scaling, options))
        .collect();
    log::info!(
        "Built predictive distributions for {} incomplete sites from {} draws.",
        distributions.len(),
        posterior.num_draws()
    );
    distributions
}
