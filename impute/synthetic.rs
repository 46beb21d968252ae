//! Seeded synthetic data for tests and benchmarks.
//!
//! [`SyntheticSitesBuilder`] produces joined site records whose enrolment
//! speed follows a known linear relation in minimum age (shifted to 18) and
//! health expenditure, with optional outliers and missing cells.
//! [`linear_model_data`] skips the tables and builds regression inputs
//! directly.

use crate::data::DataSources;
use crate::model::ModelData;
use crate::types::{SiteKey, SiteRecord};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::Path;

/// Youngest minimum age produced; the first trial always uses it.
pub const BASE_AGE: f64 = 18.0;

pub struct SyntheticSitesBuilder {
    n_sites: usize,
    n_trials: usize,
    n_countries: usize,
    age_effect: f64,
    spending_effect: f64,
    noise_sd: f64,
    outlier_rate: f64,
    missing_rate: f64,
    missing_covariate_rate: f64,
    seed: u64,
}

impl SyntheticSitesBuilder {
    pub fn new(n_sites: usize) -> Self {
        Self {
            n_sites,
            n_trials: 6,
            n_countries: 8,
            age_effect: 0.02,
            spending_effect: 0.1,
            noise_sd: 0.01,
            outlier_rate: 0.0,
            missing_rate: 0.0,
            missing_covariate_rate: 0.0,
            seed: 42,
        }
    }

    pub fn with_trials(mut self, n: usize) -> Self {
        self.n_trials = n.max(1);
        self
    }

    /// Patients per month gained per year of minimum age above 18, and per
    /// 1000 units of health expenditure.
    pub fn with_effects(mut self, age: f64, spending: f64) -> Self {
        self.age_effect = age;
        self.spending_effect = spending;
        self
    }

    pub fn with_noise(mut self, sd: f64) -> Self {
        self.noise_sd = sd;
        self
    }

    /// Fraction of sites whose speed is inflated twentyfold.
    pub fn with_outliers(mut self, rate: f64) -> Self {
        self.outlier_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Fraction of sites with no patient count.
    pub fn with_missing(mut self, rate: f64) -> Self {
        self.missing_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Fraction of sites in a country without expenditure data.
    pub fn with_missing_covariate(mut self, rate: f64) -> Self {
        self.missing_covariate_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn seed(mut self, s: u64) -> Self {
        self.seed = s;
        self
    }

    pub fn build(self) -> Vec<SiteRecord> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let trial_ages: Vec<f64> = (0..self.n_trials)
            .map(|t| {
                if t == 0 {
                    BASE_AGE
                } else {
                    BASE_AGE + rng.gen_range(0..=47) as f64
                }
            })
            .collect();
        let spending: Vec<f64> = (0..self.n_countries)
            .map(|_| rng.gen_range(500.0..8000.0))
            .collect();

        (0..self.n_sites)
            .map(|i| {
                let trial = i % self.n_trials;
                let country = rng.gen_range(0..self.n_countries);
                let age = trial_ages[trial];
                let health_exp = spending[country];

                let noise: f64 = rng.sample(StandardNormal);
                let mut speed = self.age_effect * (age - BASE_AGE)
                    + self.spending_effect * health_exp / 1000.0
                    + self.noise_sd * noise;
                speed = speed.max(0.01);
                if rng.gen_bool(self.outlier_rate) {
                    speed *= 20.0;
                }
                let months = rng.gen_range(3..=24) as f64;
                let patients = (!rng.gen_bool(self.missing_rate)).then_some(speed * months);
                let covariate = (!rng.gen_bool(self.missing_covariate_rate)).then_some(health_exp);

                SiteRecord {
                    key: SiteKey::new(format!("T{trial}"), format!("S{i}")),
                    country_id: Some(format!("C{country}")),
                    no_of_patients: patients,
                    enrolment_months: Some(months),
                    minimum_age: Some(age),
                    health_exp_pc: covariate,
                }
            })
            .collect()
    }
}

/// Regression inputs with features uniform on [0, 1] and
/// `y = X beta + N(0, noise_sd)`.
pub fn linear_model_data(n: usize, n_inc: usize, beta: &[f64], noise_sd: f64, seed: u64) -> ModelData {
    let mut rng = StdRng::seed_from_u64(seed);
    let d = beta.len();
    let beta = Array1::from(beta.to_vec());
    let x = Array2::from_shape_fn((n, d), |_| rng.r#gen::<f64>());
    let x_inc = Array2::from_shape_fn((n_inc, d), |_| rng.r#gen::<f64>());
    let noise = Array1::from_shape_fn(n, |_| noise_sd * rng.sample::<f64, _>(StandardNormal));
    let y = x.dot(&beta) + noise;
    ModelData {
        n,
        n_inc,
        d,
        y,
        x,
        x_inc,
    }
}

fn format_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Writes records back out as the four CSV input tables under `dir`.
///
/// Country expenditure is taken from the first record seen per country, and
/// a country with no expenditure anywhere gets an empty cell.
pub fn write_tables(records: &[SiteRecord], dir: &Path) -> Result<DataSources, csv::Error> {
    let sources = DataSources {
        trial_site: dir.join("trial_site.csv"),
        trial: dir.join("trial.csv"),
        target: dir.join("target.csv"),
        country: dir.join("country.csv"),
    };

    let mut sites = csv::Writer::from_path(&sources.trial_site)?;
    let mut targets = csv::Writer::from_path(&sources.target)?;
    sites.write_record(["trial_id", "site_id", "country_id"])?;
    targets.write_record(["trial_id", "site_id", "no_of_patients", "enrolment_months"])?;

    let mut trial_ages: Vec<(String, Option<f64>)> = Vec::new();
    let mut countries: Vec<(String, Option<f64>)> = Vec::new();

    for record in records {
        let country = record.country_id.clone().unwrap_or_default();
        sites.write_record([
            record.key.trial_id.as_str(),
            record.key.site_id.as_str(),
            country.as_str(),
        ])?;
        targets.write_record([
            record.key.trial_id.clone(),
            record.key.site_id.clone(),
            format_cell(record.no_of_patients),
            format_cell(record.enrolment_months),
        ])?;

        if !trial_ages.iter().any(|(t, _)| *t == record.key.trial_id) {
            trial_ages.push((record.key.trial_id.clone(), record.minimum_age));
        }
        if !country.is_empty() {
            match countries.iter_mut().find(|(c, _)| *c == country) {
                Some((_, value)) => {
                    if value.is_none() {
                        *value = record.health_exp_pc;
                    }
                }
                None => countries.push((country, record.health_exp_pc)),
            }
        }
    }
    sites.flush()?;
    targets.flush()?;

    let mut trials = csv::Writer::from_path(&sources.trial)?;
    trials.write_record(["trial_id", "minimum_age"])?;
    for (trial, age) in &trial_ages {
        trials.write_record([trial.clone(), format_cell(*age)])?;
    }
    trials.flush()?;

    let mut country_table = csv::Writer::from_path(&sources.country)?;
    country_table.write_record(["country_id", "health_exp_per_capita"])?;
    for (country, value) in &countries {
        country_table.write_record([country.clone(), format_cell(*value)])?;
    }
    country_table.flush()?;

    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::enrolment_speed;

    #[test]
    fn builder_is_deterministic_per_seed() {
        let a = SyntheticSitesBuilder::new(30).seed(9).build();
        let b = SyntheticSitesBuilder::new(30).seed(9).build();
        let c = SyntheticSitesBuilder::new(30).seed(10).build();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn noiseless_records_follow_the_linear_relation() {
        let records = SyntheticSitesBuilder::new(40).with_noise(0.0).build();
        for r in &records {
            let speed = enrolment_speed(r.no_of_patients, r.enrolment_months).unwrap();
            let expected = 0.02 * (r.minimum_age.unwrap() - BASE_AGE) + 0.1 * r.health_exp_pc.unwrap() / 1000.0;
            assert!((speed - expected.max(0.01)).abs() < 1e-9);
        }
    }

    #[test]
    fn trial_count_and_effects_shape_the_records() {
        let records = SyntheticSitesBuilder::new(30)
            .with_trials(3)
            .with_effects(0.05, 0.0)
            .with_noise(0.0)
            .seed(7)
            .build();
        let trials: std::collections::HashSet<&str> =
            records.iter().map(|r| r.key.trial_id.as_str()).collect();
        assert_eq!(trials.len(), 3);
        for r in &records {
            let speed = enrolment_speed(r.no_of_patients, r.enrolment_months).unwrap();
            let expected = (0.05 * (r.minimum_age.unwrap() - BASE_AGE)).max(0.01);
            assert!((speed - expected).abs() < 1e-9);
        }

        let single = SyntheticSitesBuilder::new(5).with_trials(0).build();
        assert!(single.iter().all(|r| r.key.trial_id == "T0"));
    }

    #[test]
    fn missing_rates_blank_out_cells() {
        let records = SyntheticSitesBuilder::new(50)
            .with_missing(1.0)
            .with_missing_covariate(1.0)
            .build();
        assert!(records.iter().all(|r| r.no_of_patients.is_none()));
        assert!(records.iter().all(|r| r.health_exp_pc.is_none()));
    }

    #[test]
    fn model_data_has_declared_shapes() {
        let data = linear_model_data(10, 3, &[2.0, 0.0], 0.1, 1);
        assert!(data.validate_shapes().is_ok());
        assert_eq!(data.x.dim(), (10, 2));
        assert_eq!(data.x_inc.dim(), (3, 2));
    }
}
