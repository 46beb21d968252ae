//! Robust outlier fence on the enrolment speed distribution.
//!
//! Quartiles are taken over defined values only, interpolating linearly
//! between order statistics at position `(n - 1) * q`. The fence is
//! `[max(Q1 - m * IQR, 0), Q3 + m * IQR]` with `m = 1.5` by default.
//!
//! Known limitation: with fewer than four defined values the quartiles are
//! little more than the extremes of the sample, so the fence is reported
//! together with a [`StatisticalWarning::SparseFenceSample`].

use crate::types::{Observation, StatisticalWarning};
use serde::{Deserialize, Serialize};

pub const DEFAULT_IQR_MULTIPLIER: f64 = 1.5;

/// Minimum number of defined values for which quartiles are considered stable.
pub const MIN_STABLE_SAMPLE: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FenceBounds {
    pub q1: f64,
    pub q3: f64,
    pub lower: f64,
    pub upper: f64,
}

impl FenceBounds {
    pub fn from_quartiles(q1: f64, q3: f64, multiplier: f64) -> Self {
        let iqr = q3 - q1;
        Self {
            q1,
            q3,
            lower: (q1 - multiplier * iqr).max(0.0),
            upper: q3 + multiplier * iqr,
        }
    }

    pub fn iqr(&self) -> f64 {
        self.q3 - self.q1
    }

    /// Inclusive on both ends: a value sitting exactly on the fence is usable.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Result of fencing one run's speeds. `bounds` is absent only when no value
/// was defined.
#[derive(Clone, Debug, PartialEq)]
pub struct FenceOutcome {
    pub bounds: Option<FenceBounds>,
    pub defined: usize,
    pub warning: Option<StatisticalWarning>,
}

/// Linearly interpolated percentile of an ascending slice, `q` in `[0, 1]`.
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let position = q.clamp(0.0, 1.0) * last as f64;
    let below = position.floor() as usize;
    let above = position.ceil() as usize;
    let fraction = position - below as f64;
    Some(sorted[below] + (sorted[above] - sorted[below]) * fraction)
}

pub fn compute_fence(values: &[Option<f64>], multiplier: f64) -> FenceOutcome {
    let mut defined: Vec<f64> = values.iter().flatten().copied().collect();
    defined.sort_by(f64::total_cmp);

    let (Some(q1), Some(q3)) = (percentile(&defined, 0.25), percentile(&defined, 0.75)) else {
        return FenceOutcome {
            bounds: None,
            defined: 0,
            warning: Some(StatisticalWarning::NoDefinedMetric),
        };
    };

    let warning = (defined.len() < MIN_STABLE_SAMPLE).then_some(
        StatisticalWarning::SparseFenceSample {
            defined: defined.len(),
        },
    );

    FenceOutcome {
        bounds: Some(FenceBounds::from_quartiles(q1, q3, multiplier)),
        defined: defined.len(),
        warning,
    }
}

/// A row needs imputation when its value is missing, when there is no fence to
/// test against, or when it falls outside the fence.
pub fn needs_imputation(value: Option<f64>, bounds: Option<&FenceBounds>) -> bool {
    match (value, bounds) {
        (Some(v), Some(b)) => !b.contains(v),
        _ => true,
    }
}

/// Computes the fence over all observations and flags every row.
pub fn classify(observations: &mut [Observation], multiplier: f64) -> FenceOutcome {
    let speeds: Vec<Option<f64>> = observations.iter().map(|o| o.enrolment_speed).collect();
    let outcome = compute_fence(&speeds, multiplier);

    for observation in observations.iter_mut() {
        observation.impute = needs_imputation(observation.enrolment_speed, outcome.bounds.as_ref());
    }

    let flagged = observations.iter().filter(|o| o.impute).count();
    match &outcome.bounds {
        Some(b) => log::info!(
            "IQR fence [{:.4}, {:.4}] (Q1={:.4}, Q3={:.4}); {} of {} sites need imputation.",
            b.lower,
            b.upper,
            b.q1,
            b.q3,
            flagged,
            observations.len()
        ),
        None => log::info!(
            "No fence could be computed; all {} sites need imputation.",
            observations.len()
        ),
    }
    outcome
}
