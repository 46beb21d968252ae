//! Condensed run results and their TOML artifact.

use crate::config::PipelineConfig;
use crate::diagnostics::SamplerStats;
use crate::fence::FenceBounds;
use crate::imputation::PredictiveDistribution;
use crate::loo::LooSummary;
use crate::normalize::ScalingConstants;
use crate::pipeline::{PipelineContext, PipelineError};
use crate::posterior::ParameterSummary;
use serde::Serialize;
use std::fmt::Write as FmtWrite;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to serialize report to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SiteCounts {
    pub total: usize,
    pub defined_speed: usize,
    pub flagged: usize,
    pub dropped_missing_covariate: usize,
    pub complete: usize,
    pub incomplete: usize,
}

/// The self-contained outcome of one run. This is what the CLI prints and
/// saves.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
    pub warnings: Vec<String>,
    pub settings: PipelineConfig,
    pub counts: SiteCounts,
    pub fence: Option<FenceBounds>,
    pub scaling: ScalingConstants,
    pub parameters: Vec<ParameterSummary>,
    pub sampler: SamplerStats,
    pub loo: LooSummary,
    pub imputations: Vec<PredictiveDistribution>,
}

impl PipelineReport {
    pub fn from_context(mut ctx: PipelineContext) -> Result<Self, PipelineError> {
        let stage = "report";
        let loo = ctx.loo.take().ok_or(PipelineError::StageOrder {
            stage,
            missing: "loo",
        })?;
        let partitions = ctx.partitions(stage)?;
        let posterior = ctx.posterior(stage)?;

        let counts = SiteCounts {
            total: ctx.observations.len(),
            defined_speed: ctx
                .observations
                .iter()
                .filter(|o| o.enrolment_speed.is_some())
                .count(),
            flagged: ctx.observations.iter().filter(|o| o.impute).count(),
            dropped_missing_covariate: partitions.dropped,
            complete: partitions.complete.len(),
            incomplete: partitions.incomplete.len(),
        };

        Ok(Self {
            warnings: ctx.warnings.iter().map(|w| w.to_string()).collect(),
            settings: ctx.config.clone(),
            counts,
            fence: ctx.fence.as_ref().and_then(|f| f.bounds),
            scaling: partitions.scaling,
            parameters: ctx.parameter_summaries.clone(),
            sampler: posterior.sampler.clone(),
            loo,
            imputations: ctx.predictions,
        })
    }

    /// Saves the report to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Plain-text overview for the terminal.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let c = &self.counts;
        let _ = writeln!(
            out,
            "Sites: {} total, {} with a defined speed, {} flagged for imputation, {} dropped (no covariate)",
            c.total, c.defined_speed, c.flagged, c.dropped_missing_covariate
        );
        let _ = writeln!(out, "Partitions: {} complete, {} incomplete", c.complete, c.incomplete);
        if let Some(b) = &self.fence {
            let _ = writeln!(
                out,
                "IQR fence: [{:.4}, {:.4}] patients/month (Q1 {:.4}, Q3 {:.4}, IQR {:.4})",
                b.lower,
                b.upper,
                b.q1,
                b.q3,
                b.iqr()
            );
        }

        let _ = writeln!(out, "\nPosterior (normalized scale):");
        let _ = writeln!(
            out,
            "{:<10} {:>9} {:>9} {:>9} {:>9} {:>9} {:>8} {:>7}",
            "parameter", "mean", "sd", "5%", "50%", "95%", "ess", "R-hat"
        );
        for p in &self.parameters {
            let _ = writeln!(
                out,
                "{:<10} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>8.0} {:>7.3}",
                p.name, p.mean, p.sd, p.q5, p.q50, p.q95, p.ess_bulk, p.rhat
            );
        }
        let s = &self.sampler;
        let _ = writeln!(
            out,
            "Sampler: {} chains, {} transitions, mean R-hat {:.3}, mean ESS {:.0}",
            s.chains, s.transitions, s.rhat_mean, s.ess_mean
        );

        let l = &self.loo;
        let _ = writeln!(out, "\nPSIS-LOO over {} draws:", l.n_draws);
        let _ = writeln!(out, "  elpd_loo {:>10.2} (se {:.2})", l.elpd_loo, l.elpd_loo_se);
        let _ = writeln!(out, "  p_loo    {:>10.2} (se {:.2})", l.p_loo, l.p_loo_se);
        let _ = writeln!(out, "  looic    {:>10.2} (se {:.2})", l.looic, l.looic_se);
        let k = &l.k_counts;
        let _ = writeln!(
            out,
            "  Pareto k: {} good, {} ok, {} bad, {} very bad",
            k.good, k.ok, k.bad, k.very_bad
        );

        if !self.imputations.is_empty() {
            let mass = self.imputations[0].interval_mass * 100.0;
            let _ = writeln!(out, "\nImputed enrolment speed (patients/month):");
            let _ = writeln!(
                out,
                "{:<24} {:>9} {:>9} {:>21}",
                "site",
                "mean",
                "sd",
                format!("{mass:.0}% interval")
            );
            for d in &self.imputations {
                let p = &d.patients_per_month;
                let _ = writeln!(
                    out,
                    "{:<24} {:>9.4} {:>9.4}   [{:>8.4}, {:>8.4}]",
                    d.key.to_string(),
                    p.mean,
                    p.sd,
                    p.lower,
                    p.upper
                );
            }
        }

        if !self.warnings.is_empty() {
            let _ = writeln!(out, "\nWarnings:");
            for w in &self.warnings {
                let _ = writeln!(out, "  - {w}");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::run_pipeline;
    use crate::synthetic::SyntheticSitesBuilder;
    use tempfile::TempDir;

    fn report() -> PipelineReport {
        let mut config = PipelineConfig::default();
        config.sampler.n_chains = 2;
        config.sampler.n_samples = 150;
        config.sampler.n_warmup = 150;
        let records = SyntheticSitesBuilder::new(30).with_outliers(0.1).seed(5).build();
        run_pipeline(records, &config, None).unwrap()
    }

    #[test]
    fn counts_are_consistent() {
        let report = report();
        let c = report.counts;
        assert_eq!(c.total, 30);
        assert_eq!(c.complete + c.incomplete + c.dropped_missing_covariate, c.total);
        assert_eq!(c.incomplete, report.imputations.len());
        assert_eq!(report.parameters.len(), 3);
    }

    #[test]
    fn saved_report_is_valid_toml() {
        let report = report();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.toml");
        report.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let parsed: toml::Value = toml::from_str(&text).unwrap();
        assert!(parsed.get("loo").is_some());
        assert!(parsed.get("parameters").and_then(|p| p.as_array()).is_some());
        assert_eq!(
            parsed["settings"]["sampler"]["seed"].as_integer(),
            Some(4444)
        );
    }

    #[test]
    fn summary_mentions_every_section() {
        let text = report().render_summary();
        for needle in ["Sites:", "beta[0]", "sigma", "elpd_loo", "Pareto k", "mean R-hat"] {
            assert!(text.contains(needle), "missing {needle} in\n{text}");
        }
    }

    #[test]
    fn summary_prints_the_fence_width() {
        let report = report();
        let fence = report.fence.unwrap();
        let text = report.render_summary();
        assert!(text.contains(&format!("IQR {:.4})", fence.iqr())), "{text}");
        assert!(text.contains("Sampler: 2 chains, 300 transitions"), "{text}");
    }
}
