//! # Table Loading and Joining
//!
//! Reads the four source tables and left-joins them into one [`SiteRecord`]
//! per trial-site row:
//!
//! ```text
//! trial_site ⟕ trial (trial_id) ⟕ target (trial_id, site_id) ⟕ country (country_id)
//! ```
//!
//! - Strict schema: column names are fixed (see [`TableKind::required`]). The
//!   country covariate also accepts its full WHO indicator name.
//! - Format by extension: `.tsv` and `.tab` files are tab separated, anything
//!   else is read as CSV.
//! - Missing values: empty or unparseable numeric cells become `None`, and so
//!   does every attribute of a row that finds no join partner.
//! - Join keys must be unique in the trial, target and country tables. A
//!   duplicate is a fatal [`DataError::DuplicateKey`].

use crate::types::{SiteKey, SiteRecord};
use ahash::AHashMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Failed to read the {table} table '{path}': {source}")]
    Csv {
        table: &'static str,
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(
        "The required column '{column}' was not found in the {table} table '{path}'. Please check spelling and case."
    )]
    ColumnNotFound {
        table: &'static str,
        path: PathBuf,
        column: &'static str,
    },
    #[error("Duplicate key '{key}' in the {table} table. Join keys must be unique.")]
    DuplicateKey { table: &'static str, key: String },
    #[error("The {0} table contains no rows.")]
    EmptyTable(&'static str),
}

/// Paths of the four input tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSources {
    pub trial_site: PathBuf,
    pub trial: PathBuf,
    pub target: PathBuf,
    pub country: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    TrialSite,
    Trial,
    Target,
    Country,
}

/// Accepted alias of the country covariate column.
pub const WHO_HEALTH_EXP_COLUMN: &str = "who_gho_ghed_che_pc_ppp_sha2011_curr_health_exp_per_capita_ppp";

impl TableKind {
    pub fn name(self) -> &'static str {
        match self {
            TableKind::TrialSite => "trial-site",
            TableKind::Trial => "trial",
            TableKind::Target => "target",
            TableKind::Country => "country",
        }
    }

    /// Required columns; each entry lists the accepted header names.
    pub fn required(self) -> &'static [&'static [&'static str]] {
        match self {
            TableKind::TrialSite => &[&["trial_id"], &["site_id"], &["country_id"]],
            TableKind::Trial => &[&["trial_id"], &["minimum_age"]],
            TableKind::Target => &[
                &["trial_id"],
                &["site_id"],
                &["no_of_patients"],
                &["enrolment_months"],
            ],
            TableKind::Country => &[
                &["country_id"],
                &["health_exp_per_capita", WHO_HEALTH_EXP_COLUMN],
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct TrialSiteRow {
    trial_id: String,
    site_id: String,
    country_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrialRow {
    trial_id: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    minimum_age: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TargetRow {
    trial_id: String,
    site_id: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    no_of_patients: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    enrolment_months: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CountryRow {
    country_id: String,
    #[serde(alias = "who_gho_ghed_che_pc_ppp_sha2011_curr_health_exp_per_capita_ppp")]
    #[serde(deserialize_with = "csv::invalid_option")]
    health_exp_per_capita: Option<f64>,
}

fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") || ext.eq_ignore_ascii_case("tab") => b'\t',
        _ => b',',
    }
}

fn read_table<T: DeserializeOwned>(path: &Path, kind: TableKind) -> Result<Vec<T>, DataError> {
    let csv_error = |source| DataError::Csv {
        table: kind.name(),
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_error)?;

    let headers = reader.headers().map_err(csv_error)?.clone();
    for names in kind.required() {
        if !names.iter().any(|name| headers.iter().any(|h| h == *name)) {
            return Err(DataError::ColumnNotFound {
                table: kind.name(),
                path: path.to_path_buf(),
                column: names[0],
            });
        }
    }

    let rows = reader
        .deserialize()
        .collect::<Result<Vec<T>, csv::Error>>()
        .map_err(csv_error)?;
    log::debug!("Read {} rows from the {} table.", rows.len(), kind.name());
    Ok(rows)
}

/// Builds a unique-key index, failing on the first duplicate.
fn unique_index<K, V>(
    rows: impl IntoIterator<Item = (K, V)>,
    table: &'static str,
    describe: impl Fn(&K) -> String,
) -> Result<AHashMap<K, V>, DataError>
where
    K: std::hash::Hash + Eq,
{
    let mut index = AHashMap::new();
    for (key, value) in rows {
        if index.contains_key(&key) {
            return Err(DataError::DuplicateKey {
                table,
                key: describe(&key),
            });
        }
        index.insert(key, value);
    }
    Ok(index)
}

/// Left-joins already parsed tables onto the trial-site rows, preserving
/// their order.
fn join_tables(
    sites: Vec<TrialSiteRow>,
    trials: Vec<TrialRow>,
    targets: Vec<TargetRow>,
    countries: Vec<CountryRow>,
) -> Result<Vec<SiteRecord>, DataError> {
    if sites.is_empty() {
        return Err(DataError::EmptyTable(TableKind::TrialSite.name()));
    }

    let trial_index = unique_index(
        trials.into_iter().map(|t| (t.trial_id, t.minimum_age)),
        TableKind::Trial.name(),
        |k| k.clone(),
    )?;
    let target_index = unique_index(
        targets.into_iter().map(|t| {
            (
                SiteKey::new(t.trial_id, t.site_id),
                (t.no_of_patients, t.enrolment_months),
            )
        }),
        TableKind::Target.name(),
        |k| k.to_string(),
    )?;
    let country_index = unique_index(
        countries
            .into_iter()
            .map(|c| (c.country_id, c.health_exp_per_capita)),
        TableKind::Country.name(),
        |k| k.clone(),
    )?;

    let records: Vec<SiteRecord> = sites
        .into_iter()
        .map(|site| {
            let key = SiteKey::new(site.trial_id, site.site_id);
            let minimum_age = trial_index.get(&key.trial_id).copied().flatten();
            let (no_of_patients, enrolment_months) =
                target_index.get(&key).copied().unwrap_or((None, None));
            let health_exp_pc = site
                .country_id
                .as_ref()
                .and_then(|c| country_index.get(c).copied().flatten());
            SiteRecord {
                key,
                country_id: site.country_id,
                no_of_patients,
                enrolment_months,
                minimum_age,
                health_exp_pc,
            }
        })
        .collect();

    let unmatched_targets = records
        .iter()
        .filter(|r| !target_index.contains_key(&r.key))
        .count();
    log::info!(
        "Joined {} trial-site rows ({} without a target row).",
        records.len(),
        unmatched_targets
    );
    Ok(records)
}

/// Loads and joins the four tables.
pub fn load_site_records(sources: &DataSources) -> Result<Vec<SiteRecord>, DataError> {
    let sites = read_table::<TrialSiteRow>(&sources.trial_site, TableKind::TrialSite)?;
    let trials = read_table::<TrialRow>(&sources.trial, TableKind::Trial)?;
    let targets = read_table::<TargetRow>(&sources.target, TableKind::Target)?;
    let countries = read_table::<CountryRow>(&sources.country, TableKind::Country)?;
    join_tables(sites, trials, targets, countries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
            }
        }

        fn write(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, contents).unwrap();
            path
        }

        fn sources(&self, trial_site: &str, trial: &str, target: &str, country: &str) -> DataSources {
            DataSources {
                trial_site: self.write("trial_site.csv", trial_site),
                trial: self.write("trial.csv", trial),
                target: self.write("target.csv", target),
                country: self.write("country.csv", country),
            }
        }
    }

    const SITES: &str = "trial_id,site_id,country_id\nT1,S1,GB\nT1,S2,FR\nT2,S1,XX\nT3,S9,\n";
    const TRIALS: &str = "trial_id,minimum_age\nT1,18\nT2,65\n";
    const TARGETS: &str =
        "trial_id,site_id,no_of_patients,enrolment_months\nT1,S1,12,4\nT1,S2,,3\nT2,S1,5,NA\n";
    const COUNTRIES: &str = "country_id,health_exp_per_capita\nGB,4500.5\nFR,5200\n";

    #[test]
    fn left_joins_propagate_missing_values() {
        let fixture = Fixture::new();
        let records = load_site_records(&fixture.sources(SITES, TRIALS, TARGETS, COUNTRIES)).unwrap();
        assert_eq!(records.len(), 4);

        assert_eq!(records[0].key, SiteKey::new("T1", "S1"));
        assert_eq!(records[0].no_of_patients, Some(12.0));
        assert_eq!(records[0].enrolment_months, Some(4.0));
        assert_eq!(records[0].minimum_age, Some(18.0));
        assert_eq!(records[0].health_exp_pc, Some(4500.5));

        // Empty patient cell.
        assert_eq!(records[1].no_of_patients, None);
        assert_eq!(records[1].health_exp_pc, Some(5200.0));

        // Unparseable months and an unknown country.
        assert_eq!(records[2].enrolment_months, None);
        assert_eq!(records[2].health_exp_pc, None);
        assert_eq!(records[2].minimum_age, Some(65.0));

        // No trial, no target, no country.
        assert_eq!(records[3].country_id, None);
        assert_eq!(records[3].minimum_age, None);
        assert_eq!(records[3].no_of_patients, None);
    }

    #[test]
    fn tab_separated_files_and_who_column_name_are_accepted() {
        let fixture = Fixture::new();
        let sources = DataSources {
            trial_site: fixture.write("sites.tsv", "trial_id\tsite_id\tcountry_id\nT1\tS1\tGB\n"),
            trial: fixture.write("trial.tsv", "trial_id\tminimum_age\nT1\t21\n"),
            target: fixture.write(
                "target.tsv",
                "trial_id\tsite_id\tno_of_patients\tenrolment_months\nT1\tS1\t8\t2\n",
            ),
            country: fixture.write(
                "country.tsv",
                &format!("country_id\t{WHO_HEALTH_EXP_COLUMN}\nGB\t3000\n"),
            ),
        };
        let records = load_site_records(&sources).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].minimum_age, Some(21.0));
        assert_eq!(records[0].health_exp_pc, Some(3000.0));
    }

    #[test]
    fn duplicate_index_keys_are_fatal() {
        let fixture = Fixture::new();
        let trials = "trial_id,minimum_age\nT1,18\nT1,21\n";
        let err = load_site_records(&fixture.sources(SITES, trials, TARGETS, COUNTRIES)).unwrap_err();
        assert!(matches!(
            err,
            DataError::DuplicateKey { table: "trial", ref key } if key == "T1"
        ));

        let targets = "trial_id,site_id,no_of_patients,enrolment_months\nT1,S1,1,1\nT1,S1,2,2\n";
        let err = load_site_records(&fixture.sources(SITES, TRIALS, targets, COUNTRIES)).unwrap_err();
        assert!(matches!(
            err,
            DataError::DuplicateKey { table: "target", ref key } if key == "T1/S1"
        ));
    }

    #[test]
    fn missing_columns_are_named() {
        let fixture = Fixture::new();
        let countries = "country_id,gdp\nGB,1\n";
        let err = load_site_records(&fixture.sources(SITES, TRIALS, TARGETS, countries)).unwrap_err();
        assert!(matches!(
            err,
            DataError::ColumnNotFound {
                table: "country",
                column: "health_exp_per_capita",
                ..
            }
        ));
    }

    #[test]
    fn empty_site_table_is_rejected() {
        let fixture = Fixture::new();
        let err = load_site_records(&fixture.sources(
            "trial_id,site_id,country_id\n",
            TRIALS,
            TARGETS,
            COUNTRIES,
        ))
        .unwrap_err();
        assert!(matches!(err, DataError::EmptyTable("trial-site")));
    }
}
