//! End-to-end imputation pipeline.
//!
//! A [`PipelineContext`] is threaded through five stage functions, each taking
//! the context by value and handing it back enriched:
//!
//! 1. [`derive_metric`]: enrolment speed per site
//! 2. [`classify_outliers`]: IQR fence and impute flags
//! 3. [`normalize_features`]: complete and incomplete partitions
//! 4. [`fit_model`]: NUTS posterior of the linear-Gaussian model
//! 5. [`impute_and_validate`]: predictive distributions and PSIS-LOO
//!
//! Structural failures abort with a [`PipelineError`] and no partial output.
//! Statistical warnings accumulate on the context and are logged as they
//! arise. A failure after some warnings were raised comes back as
//! [`PipelineError::Halted`], which carries them.

use crate::config::{ConfigError, PipelineConfig};
use crate::data::DataError;
use crate::fence::{self, FenceOutcome};
use crate::hmc::{self, SamplingError};
use crate::imputation::{self, PredictiveDistribution};
use crate::loo::{self, LooSummary};
use crate::metric;
use crate::model::{LinearGaussianModel, ModelData, ModelError, Priors};
use crate::normalize::{self, NormalizeError, NormalizedPartitions};
use crate::posterior::{ParameterSummary, PosteriorSampleSet};
use crate::report::{PipelineReport, ReportError};
use crate::types::{Observation, SiteRecord, StatisticalWarning};
use indicatif::ProgressBar;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Data loading failed: {0}")]
    Data(#[from] DataError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Feature normalization failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("Model construction failed: {0}")]
    Model(#[from] ModelError),
    #[error("Sampling failed: {0}")]
    Sampling(#[from] SamplingError),
    #[error("Report output failed: {0}")]
    Report(#[from] ReportError),
    #[error("Stage '{stage}' needs '{missing}', which no earlier stage produced.")]
    StageOrder {
        stage: &'static str,
        missing: &'static str,
    },
    #[error("{source} ({} statistical warning(s) raised before the failure)", .warnings.len())]
    Halted {
        source: Box<PipelineError>,
        warnings: Vec<StatisticalWarning>,
    },
}

impl PipelineError {
    fn with_warnings(self, warnings: Vec<StatisticalWarning>) -> Self {
        if warnings.is_empty() {
            return self;
        }
        PipelineError::Halted {
            source: Box::new(self),
            warnings,
        }
    }

    /// Warnings raised by the stages that completed before the failure.
    pub fn warnings(&self) -> &[StatisticalWarning] {
        match self {
            PipelineError::Halted { warnings, .. } => warnings,
            _ => &[],
        }
    }

    /// The failure itself, without the warnings wrapper.
    pub fn failure(&self) -> &PipelineError {
        match self {
            PipelineError::Halted { source, .. } => source.failure(),
            other => other,
        }
    }
}

/// Stages reported on the progress bar handed to [`run_stages`].
pub const STAGE_COUNT: u64 = 5;

fn advance(progress: Option<&ProgressBar>, stage: &'static str) {
    if let Some(bar) = progress {
        bar.set_message(stage);
        bar.inc(1);
    }
}

/// Everything one run knows so far. Fields are filled stage by stage.
#[derive(Debug)]
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub records: Vec<SiteRecord>,
    pub observations: Vec<Observation>,
    pub fence: Option<FenceOutcome>,
    pub partitions: Option<NormalizedPartitions>,
    pub posterior: Option<PosteriorSampleSet>,
    pub parameter_summaries: Vec<ParameterSummary>,
    pub predictions: Vec<PredictiveDistribution>,
    pub loo: Option<LooSummary>,
    pub warnings: Vec<StatisticalWarning>,
}

impl PipelineContext {
    pub fn new(records: Vec<SiteRecord>, config: PipelineConfig) -> Self {
        Self {
            config,
            records,
            observations: Vec::new(),
            fence: None,
            partitions: None,
            posterior: None,
            parameter_summaries: Vec::new(),
            predictions: Vec::new(),
            loo: None,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, warning: StatisticalWarning) {
        log::warn!("{warning}");
        self.warnings.push(warning);
    }

    pub fn partitions(&self, stage: &'static str) -> Result<&NormalizedPartitions, PipelineError> {
        self.partitions.as_ref().ok_or(PipelineError::StageOrder {
            stage,
            missing: "partitions",
        })
    }

    pub fn posterior(&self, stage: &'static str) -> Result<&PosteriorSampleSet, PipelineError> {
        self.posterior.as_ref().ok_or(PipelineError::StageOrder {
            stage,
            missing: "posterior",
        })
    }
}

pub fn derive_metric(mut ctx: PipelineContext) -> PipelineContext {
    ctx.observations = metric::derive_observations(&ctx.records);
    ctx
}

pub fn classify_outliers(mut ctx: PipelineContext) -> PipelineContext {
    let outcome = fence::classify(&mut ctx.observations, ctx.config.fence.iqr_multiplier);
    if let Some(warning) = outcome.warning.clone() {
        ctx.warn(warning);
    }
    ctx.fence = Some(outcome);
    ctx
}

pub fn normalize_features(mut ctx: PipelineContext) -> Result<PipelineContext, PipelineError> {
    let partitions = normalize::normalize(&ctx.observations, ctx.config.normalization.age_offset)?;
    ctx.partitions = Some(partitions);
    Ok(ctx)
}

pub fn fit_model(
    mut ctx: PipelineContext,
    progress: Option<&ProgressBar>,
) -> Result<PipelineContext, PipelineError> {
    let data = ModelData::from_partitions(ctx.partitions("fit_model")?);
    let model = LinearGaussianModel::build(data, Priors::default())?;

    // The sampler draws its own bars; hide the stage bar meanwhile.
    let sampler = &ctx.config.sampler;
    let run = match progress {
        Some(bar) => bar.suspend(|| hmc::run_chains(&model, sampler)),
        None => hmc::run_chains(&model, sampler),
    }?;
    let posterior = PosteriorSampleSet::from_run(&model, &run);

    let summaries = posterior.summarize();
    for summary in &summaries {
        log::info!(
            "{}: mean {:.4}, sd {:.4}, 90% [{:.4}, {:.4}], ess {:.0}, R-hat {:.3}",
            summary.name,
            summary.mean,
            summary.sd,
            summary.q5,
            summary.q95,
            summary.ess_bulk,
            summary.rhat
        );
    }
    for warning in posterior.convergence_warnings(&summaries) {
        ctx.warn(warning);
    }

    ctx.parameter_summaries = summaries;
    ctx.posterior = Some(posterior);
    Ok(ctx)
}

pub fn impute_and_validate(mut ctx: PipelineContext) -> Result<PipelineContext, PipelineError> {
    let partitions = ctx.partitions("impute_and_validate")?;
    let posterior = ctx.posterior("impute_and_validate")?;

    let predictions = imputation::predictive_distributions(
        posterior,
        &partitions.incomplete,
        &partitions.scaling,
        &ctx.config.imputation,
    );
    let loo = loo::psis_loo(posterior.log_lik.view(), posterior.relative_efficiency());

    if let Some(warning) = loo.warning() {
        ctx.warn(warning);
    }
    ctx.predictions = predictions;
    ctx.loo = Some(loo);
    Ok(ctx)
}

/// Runs all stages on already joined records. `progress`, when given, is
/// ticked once per stage and should have length [`STAGE_COUNT`].
pub fn run_stages(
    records: Vec<SiteRecord>,
    config: &PipelineConfig,
    progress: Option<&ProgressBar>,
) -> Result<PipelineContext, PipelineError> {
    config.validate()?;
    let ctx = PipelineContext::new(records, config.clone());
    let ctx = derive_metric(ctx);
    advance(progress, "derive_metric");
    let ctx = classify_outliers(ctx);
    advance(progress, "classify_outliers");

    let warnings = ctx.warnings.clone();
    let ctx = normalize_features(ctx).map_err(|e| e.with_warnings(warnings))?;
    advance(progress, "normalize_features");

    let warnings = ctx.warnings.clone();
    let ctx = fit_model(ctx, progress).map_err(|e| e.with_warnings(warnings))?;
    advance(progress, "fit_model");

    let warnings = ctx.warnings.clone();
    let ctx = impute_and_validate(ctx).map_err(|e| e.with_warnings(warnings))?;
    advance(progress, "impute_and_validate");
    Ok(ctx)
}

/// Runs all stages and condenses the outcome into a report.
pub fn run_pipeline(
    records: Vec<SiteRecord>,
    config: &PipelineConfig,
    progress: Option<&ProgressBar>,
) -> Result<PipelineReport, PipelineError> {
    let ctx = run_stages(records, config, progress)?;
    PipelineReport::from_context(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticSitesBuilder;

    fn quick_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.sampler.n_chains = 2;
        config.sampler.n_samples = 200;
        config.sampler.n_warmup = 200;
        config
    }

    #[test]
    fn stages_fill_the_context_in_order() {
        let records = SyntheticSitesBuilder::new(40).with_outliers(0.1).with_missing(0.1).build();
        let ctx = PipelineContext::new(records, quick_config());
        let ctx = derive_metric(ctx);
        assert_eq!(ctx.observations.len(), 40);
        let ctx = classify_outliers(ctx);
        assert!(ctx.fence.as_ref().and_then(|f| f.bounds).is_some());

        let ctx = normalize_features(ctx).unwrap();
        let partitions = ctx.partitions.as_ref().unwrap();
        assert_eq!(partitions.complete.len() + partitions.incomplete.len(), 40);

        let ctx = fit_model(ctx, None).unwrap();
        assert_eq!(ctx.posterior.as_ref().unwrap().num_draws(), 400);
        assert_eq!(ctx.parameter_summaries.len(), 3);

        let ctx = impute_and_validate(ctx).unwrap();
        let n_incomplete = ctx.partitions.as_ref().unwrap().incomplete.len();
        assert_eq!(ctx.predictions.len(), n_incomplete);
        assert!(ctx.loo.is_some());
    }

    #[test]
    fn stages_out_of_order_are_errors() {
        let ctx = PipelineContext::new(Vec::new(), quick_config());
        let err = fit_model(ctx, None).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StageOrder {
                stage: "fit_model",
                missing: "partitions"
            }
        ));
    }

    #[test]
    fn all_missing_speeds_warn_then_fail_structurally() {
        let records = SyntheticSitesBuilder::new(10).with_missing(1.0).build();
        let err = run_stages(records, &quick_config(), None).unwrap_err();
        assert!(matches!(
            err.failure(),
            PipelineError::Normalize(NormalizeError::EmptyCompletePartition)
        ));
        assert_eq!(err.warnings(), &[StatisticalWarning::NoDefinedMetric]);
        assert!(err.to_string().contains("1 statistical warning(s)"));

        let records = SyntheticSitesBuilder::new(10).with_missing(1.0).build();
        let ctx = classify_outliers(derive_metric(PipelineContext::new(records, quick_config())));
        assert_eq!(ctx.warnings, vec![StatisticalWarning::NoDefinedMetric]);
        assert!(ctx.observations.iter().all(|o| o.impute));
    }

    #[test]
    fn invalid_configuration_stops_before_any_stage() {
        let mut config = quick_config();
        config.imputation.interval_mass = 0.0;
        let err = run_stages(Vec::new(), &config, None).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.warnings().is_empty());
    }

    #[test]
    fn stage_bar_ends_full_after_a_run() {
        let records = SyntheticSitesBuilder::new(20).with_missing(0.2).build();
        let bar = ProgressBar::hidden();
        bar.set_length(STAGE_COUNT);
        run_stages(records, &quick_config(), Some(&bar)).unwrap();
        assert_eq!(bar.position(), STAGE_COUNT);
    }
}
