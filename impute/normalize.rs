//! Partitioning and rescaling of the feature table.
//!
//! Rows without a covariate are dropped outright. The remainder is split by
//! the impute flag; minimum age is shifted by a partition minimum and both
//! enrolment speed and the covariate are divided by maxima taken from the
//! complete partition.

use crate::types::{Observation, SiteKey};
use itertools::{Itertools, MinMaxResult};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of model features per row: minimum age and health expenditure.
pub const NUM_FEATURES: usize = 2;

/// Which minimum-age offset the incomplete partition is shifted by.
///
/// The reference analysis subtracts each partition's own minimum, which puts
/// imputed rows on a different age origin than the rows the coefficients were
/// fitted on. `PerPartition` keeps that behaviour; `SharedComplete` applies the
/// complete partition's offset to both.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgeOffsetPolicy {
    #[default]
    PerPartition,
    SharedComplete,
}

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error(
        "No site has usable enrolment data after fencing; at least one complete site is required to fit the model."
    )]
    EmptyCompletePartition,
    #[error("Site '{0}' has no minimum age. Every retained site needs a minimum age to build the design matrix.")]
    MissingMinimumAge(SiteKey),
    #[error("Complete site '{0}' lost its enrolment speed; complete rows must carry a defined speed.")]
    MissingSpeed(SiteKey),
    #[error("The maximum {what} of the complete partition is {value}; it must be strictly positive to scale by.")]
    NonPositiveScale { what: &'static str, value: f64 },
}

/// One normalized row. `speed` is set only for complete rows.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureRow {
    pub key: SiteKey,
    pub minimum_age: f64,
    pub covariate: f64,
    pub speed: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Partition {
    pub rows: Vec<FeatureRow>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SiteKey> {
        self.rows.iter().map(|r| &r.key)
    }

    /// Design matrix with columns `[minimum_age, covariate]`.
    pub fn design_matrix(&self) -> Array2<f64> {
        let mut x = Array2::zeros((self.rows.len(), NUM_FEATURES));
        for (mut out, row) in x.rows_mut().into_iter().zip(&self.rows) {
            out[0] = row.minimum_age;
            out[1] = row.covariate;
        }
        x
    }

    /// Normalized speeds; rows without one are reported as errors upstream, so
    /// here they are simply skipped.
    pub fn response(&self) -> Array1<f64> {
        self.rows.iter().filter_map(|r| r.speed).collect()
    }
}

/// Constants derived once from the complete partition (and, for the default
/// age policy, the incomplete one).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalingConstants {
    pub complete_min_age: f64,
    /// Offset actually subtracted from incomplete ages.
    pub incomplete_min_age: Option<f64>,
    pub max_speed: f64,
    pub max_covariate: f64,
    pub age_policy: AgeOffsetPolicy,
}

impl ScalingConstants {
    pub fn normalize_speed(&self, speed: f64) -> f64 {
        speed / self.max_speed
    }

    /// Maps a normalized speed back to patients per month.
    pub fn restore_speed(&self, normalized: f64) -> f64 {
        normalized * self.max_speed
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedPartitions {
    pub complete: Partition,
    pub incomplete: Partition,
    pub scaling: ScalingConstants,
    /// Rows dropped because their covariate was missing.
    pub dropped: usize,
}

fn require_age(o: &Observation) -> Result<f64, NormalizeError> {
    o.minimum_age
        .ok_or_else(|| NormalizeError::MissingMinimumAge(o.key.clone()))
}

fn min_age(rows: &[(&Observation, f64)]) -> Result<Option<f64>, NormalizeError> {
    let mut ages = Vec::with_capacity(rows.len());
    for (o, _) in rows {
        ages.push(require_age(o)?);
    }
    Ok(ages.into_iter().reduce(f64::min))
}

fn positive_max(values: impl Iterator<Item = f64>, what: &'static str) -> Result<f64, NormalizeError> {
    let max = match values.minmax_by(f64::total_cmp) {
        MinMaxResult::NoElements => return Err(NormalizeError::EmptyCompletePartition),
        MinMaxResult::OneElement(v) => v,
        MinMaxResult::MinMax(_, hi) => hi,
    };
    if max > 0.0 && max.is_finite() {
        Ok(max)
    } else {
        Err(NormalizeError::NonPositiveScale { what, value: max })
    }
}

pub fn normalize(
    observations: &[Observation],
    policy: AgeOffsetPolicy,
) -> Result<NormalizedPartitions, NormalizeError> {
    let with_covariate: Vec<(&Observation, f64)> = observations
        .iter()
        .filter_map(|o| o.health_exp_pc.filter(|v| v.is_finite()).map(|c| (o, c)))
        .collect();
    let dropped = observations.len() - with_covariate.len();
    if dropped > 0 {
        log::info!("Dropped {dropped} sites with no health expenditure covariate.");
    }

    let (complete, incomplete): (Vec<_>, Vec<_>) =
        with_covariate.into_iter().partition(|(o, _)| !o.impute);
    if complete.is_empty() {
        return Err(NormalizeError::EmptyCompletePartition);
    }

    let complete_min_age = min_age(&complete)?.ok_or(NormalizeError::EmptyCompletePartition)?;
    let incomplete_min_age = match policy {
        AgeOffsetPolicy::PerPartition => min_age(&incomplete)?,
        AgeOffsetPolicy::SharedComplete => (!incomplete.is_empty()).then_some(complete_min_age),
    };

    let mut complete_speeds = Vec::with_capacity(complete.len());
    for (o, _) in &complete {
        complete_speeds.push(o.enrolment_speed.ok_or_else(|| NormalizeError::MissingSpeed(o.key.clone()))?);
    }
    let max_speed = positive_max(complete_speeds.iter().copied(), "enrolment speed")?;
    let max_covariate = positive_max(complete.iter().map(|(_, c)| *c), "health expenditure")?;

    let scaling = ScalingConstants {
        complete_min_age,
        incomplete_min_age,
        max_speed,
        max_covariate,
        age_policy: policy,
    };

    let mut complete_rows = Vec::with_capacity(complete.len());
    for ((o, covariate), speed) in complete.iter().zip(&complete_speeds) {
        complete_rows.push(FeatureRow {
            key: o.key.clone(),
            minimum_age: require_age(o)? - complete_min_age,
            covariate: covariate / max_covariate,
            speed: Some(speed / max_speed),
        });
    }

    let incomplete_offset = incomplete_min_age.unwrap_or(complete_min_age);
    let mut incomplete_rows = Vec::with_capacity(incomplete.len());
    for (o, covariate) in &incomplete {
        incomplete_rows.push(FeatureRow {
            key: o.key.clone(),
            minimum_age: require_age(o)? - incomplete_offset,
            covariate: covariate / max_covariate,
            speed: None,
        });
    }

    log::info!(
        "Normalized {} complete and {} incomplete sites (max speed {:.4}, max covariate {:.1}, age offsets {:.1}/{}).",
        complete_rows.len(),
        incomplete_rows.len(),
        max_speed,
        max_covariate,
        complete_min_age,
        incomplete_min_age.map_or_else(|| "-".to_string(), |v| format!("{v:.1}"))
    );

    Ok(NormalizedPartitions {
        complete: Partition { rows: complete_rows },
        incomplete: Partition {
            rows: incomplete_rows,
        },
        scaling,
        dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::collections::HashSet;

    fn obs(id: &str, age: f64, gdp: Option<f64>, speed: Option<f64>, impute: bool) -> Observation {
        Observation {
            key: SiteKey::new("T", id),
            minimum_age: Some(age),
            health_exp_pc: gdp,
            enrolment_speed: speed,
            impute,
        }
    }

    fn fixture() -> Vec<Observation> {
        vec![
            obs("a", 18.0, Some(2000.0), Some(2.0), false),
            obs("b", 21.0, Some(4000.0), Some(4.0), false),
            obs("c", 30.0, Some(1000.0), Some(1.0), false),
            obs("d", 40.0, Some(3000.0), None, true),
            obs("e", 45.0, Some(8000.0), Some(50.0), true),
            obs("f", 25.0, None, Some(3.0), false),
        ]
    }

    #[test]
    fn partitions_are_disjoint_and_cover_rows_with_covariate() {
        let observations = fixture();
        let normalized = normalize(&observations, AgeOffsetPolicy::PerPartition).unwrap();

        let complete: HashSet<_> = normalized.complete.keys().cloned().collect();
        let incomplete: HashSet<_> = normalized.incomplete.keys().cloned().collect();
        assert!(complete.is_disjoint(&incomplete));

        let expected: HashSet<_> = observations
            .iter()
            .filter(|o| o.health_exp_pc.is_some())
            .map(|o| o.key.clone())
            .collect();
        let union: HashSet<_> = complete.union(&incomplete).cloned().collect();
        assert_eq!(union, expected);
        assert_eq!(normalized.dropped, 1);
    }

    #[test]
    fn complete_speed_scales_into_unit_interval_and_round_trips() {
        let observations = fixture();
        let normalized = normalize(&observations, AgeOffsetPolicy::PerPartition).unwrap();
        let scaling = normalized.scaling;
        assert_abs_diff_eq!(scaling.max_speed, 4.0, epsilon = 1e-12);

        for (row, original) in normalized.complete.rows.iter().zip([2.0, 4.0, 1.0]) {
            let speed = row.speed.unwrap();
            assert!(speed > 0.0 && speed <= 1.0);
            assert_abs_diff_eq!(scaling.restore_speed(speed), original, epsilon = 1e-12);
            assert_abs_diff_eq!(scaling.normalize_speed(original), speed, epsilon = 1e-12);
        }
    }

    #[test]
    fn covariate_uses_complete_maximum_for_both_partitions() {
        let normalized = normalize(&fixture(), AgeOffsetPolicy::PerPartition).unwrap();
        assert_abs_diff_eq!(normalized.scaling.max_covariate, 4000.0, epsilon = 1e-12);
        // Incomplete rows may exceed 1: their own maximum never enters the scale.
        let e = &normalized.incomplete.rows[1];
        assert_abs_diff_eq!(e.covariate, 2.0, epsilon = 1e-12);
        assert!(normalized.incomplete.rows.iter().all(|r| r.speed.is_none()));
    }

    #[test]
    fn per_partition_age_offset_diverges_from_shared_offset() {
        let observations = fixture();
        let per_partition = normalize(&observations, AgeOffsetPolicy::PerPartition).unwrap();
        let shared = normalize(&observations, AgeOffsetPolicy::SharedComplete).unwrap();

        // Complete rows are identical under both policies.
        assert_eq!(per_partition.complete, shared.complete);

        // The reference behaviour re-zeroes the incomplete ages on their own
        // minimum (40), the shared policy keeps the complete origin (18).
        let own: Vec<f64> = per_partition.incomplete.rows.iter().map(|r| r.minimum_age).collect();
        let common: Vec<f64> = shared.incomplete.rows.iter().map(|r| r.minimum_age).collect();
        assert_eq!(own, vec![0.0, 5.0]);
        assert_eq!(common, vec![22.0, 27.0]);
        assert_eq!(per_partition.scaling.incomplete_min_age, Some(40.0));
        assert_eq!(shared.scaling.incomplete_min_age, Some(18.0));
    }

    #[test]
    fn design_matrix_and_response_follow_row_order() {
        let normalized = normalize(&fixture(), AgeOffsetPolicy::PerPartition).unwrap();
        let x = normalized.complete.design_matrix();
        let y = normalized.complete.response();
        assert_eq!(x.dim(), (3, NUM_FEATURES));
        assert_eq!(y.len(), 3);
        assert_abs_diff_eq!(x[[1, 0]], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[[2, 1]], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(y[2], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn empty_complete_partition_is_fatal() {
        let observations = vec![obs("a", 18.0, Some(1.0), None, true)];
        let err = normalize(&observations, AgeOffsetPolicy::PerPartition).unwrap_err();
        assert!(matches!(err, NormalizeError::EmptyCompletePartition));
    }

    #[test]
    fn missing_age_on_retained_row_is_fatal() {
        let mut observations = fixture();
        observations[3].minimum_age = None;
        let err = normalize(&observations, AgeOffsetPolicy::PerPartition).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingMinimumAge(key) if key.site_id == "d"));
    }

    #[test]
    fn zero_covariate_maximum_is_fatal() {
        let observations = vec![obs("a", 18.0, Some(0.0), Some(1.0), false)];
        let err = normalize(&observations, AgeOffsetPolicy::PerPartition).unwrap_err();
        assert!(matches!(err, NormalizeError::NonPositiveScale { .. }));
    }
}
