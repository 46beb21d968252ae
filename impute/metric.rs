//! Derivation of the target metric, enrolment speed in patients per month.

use crate::types::{Observation, SiteRecord};

/// Computes `patients / months`, returning the missing marker whenever the
/// ratio is undefined (a missing operand, zero duration) or not strictly
/// positive.
pub fn enrolment_speed(patients: Option<f64>, months: Option<f64>) -> Option<f64> {
    let patients = patients?;
    let months = months?;
    if months == 0.0 {
        return None;
    }
    let speed = patients / months;
    (speed.is_finite() && speed > 0.0).then_some(speed)
}

/// Annotates every record with its enrolment speed. Classification happens
/// later, so `impute` starts out false.
pub fn derive_observations(records: &[SiteRecord]) -> Vec<Observation> {
    let observations: Vec<Observation> = records
        .iter()
        .map(|record| Observation {
            key: record.key.clone(),
            minimum_age: record.minimum_age,
            health_exp_pc: record.health_exp_pc,
            enrolment_speed: enrolment_speed(record.no_of_patients, record.enrolment_months),
            impute: false,
        })
        .collect();

    let missing = observations
        .iter()
        .filter(|o| o.enrolment_speed.is_none())
        .count();
    log::info!(
        "Derived enrolment speed for {} sites ({} missing or non-positive).",
        observations.len(),
        missing
    );
    observations
}
