use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one (trial, site) pair. This is the row key shared by every
/// stage of the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiteKey {
    pub trial_id: String,
    pub site_id: String,
}

impl SiteKey {
    pub fn new(trial_id: impl Into<String>, site_id: impl Into<String>) -> Self {
        Self {
            trial_id: trial_id.into(),
            site_id: site_id.into(),
        }
    }
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trial_id, self.site_id)
    }
}

/// A raw joined row as produced by the table loader. Every numeric attribute
/// may be absent: missing joins surface here as `None`.
#[derive(Clone, Debug, PartialEq)]
pub struct SiteRecord {
    pub key: SiteKey,
    pub country_id: Option<String>,
    pub no_of_patients: Option<f64>,
    pub enrolment_months: Option<f64>,
    pub minimum_age: Option<f64>,
    /// Health expenditure per capita (PPP) of the site's country.
    pub health_exp_pc: Option<f64>,
}

/// A site record annotated with the derived target metric and the outcome of
/// outlier classification.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub key: SiteKey,
    pub minimum_age: Option<f64>,
    pub health_exp_pc: Option<f64>,
    /// Patients per month. `None` is the missing marker: the ratio was
    /// undefined or not strictly positive.
    pub enrolment_speed: Option<f64>,
    /// True when the speed is missing or outside the IQR fence.
    pub impute: bool,
}

/// Non-fatal findings that must travel with the results instead of being
/// swallowed. Structural failures are errors, not warnings.
#[derive(Clone, Debug, PartialEq)]
pub enum StatisticalWarning {
    /// Quartiles were estimated from fewer than four defined values.
    SparseFenceSample { defined: usize },
    /// No row carried a defined enrolment speed, so no fence exists.
    NoDefinedMetric,
    /// PSIS-LOO importance weights are unreliable for these observations.
    HighParetoK {
        observations: Vec<usize>,
        threshold: f64,
        max_k: f64,
    },
    /// Split R-hat above the convergence threshold.
    PoorMixing { parameter: String, rhat: f64 },
    /// Bulk effective sample size below the usable minimum.
    LowEffectiveSampleSize { parameter: String, ess: f64 },
}

impl fmt::Display for StatisticalWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatisticalWarning::SparseFenceSample { defined } => write!(
                f,
                "IQR fence estimated from only {defined} defined enrolment speeds; quartiles are unstable below 4 values"
            ),
            StatisticalWarning::NoDefinedMetric => write!(
                f,
                "no defined enrolment speed in the dataset; every row is marked for imputation"
            ),
            StatisticalWarning::HighParetoK {
                observations,
                threshold,
                max_k,
            } => write!(
                f,
                "Pareto k above {threshold:.2} for {} observation(s) (max k = {max_k:.2}); LOO estimate is unreliable for them",
                observations.len()
            ),
            StatisticalWarning::PoorMixing { parameter, rhat } => {
                write!(f, "split R-hat for {parameter} is {rhat:.3}; chains have not mixed")
            }
            StatisticalWarning::LowEffectiveSampleSize { parameter, ess } => {
                write!(f, "bulk ESS for {parameter} is only {ess:.0}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_key_display_joins_trial_and_site() {
        let key = SiteKey::new("NCT001", "S-17");
        assert_eq!(key.to_string(), "NCT001/S-17");
    }

    #[test]
    fn warnings_render_counts() {
        let warning = StatisticalWarning::HighParetoK {
            observations: vec![3, 9],
            threshold: 0.7,
            max_k: 1.2,
        };
        let text = warning.to_string();
        assert!(text.contains("2 observation(s)"), "{text}");
        assert!(text.contains("0.70"), "{text}");
    }
}
