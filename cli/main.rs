#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process;

use siterate::config::PipelineConfig;
use siterate::data::{DataSources, load_site_records};
use siterate::normalize::AgeOffsetPolicy;
use siterate::pipeline::{STAGE_COUNT, run_pipeline};

#[derive(Clone, Copy, ValueEnum)]
pub enum AgeOffsetCli {
    /// Each partition is shifted by its own minimum age
    PerPartition,
    /// Both partitions are shifted by the complete partition's minimum age
    SharedComplete,
}

impl From<AgeOffsetCli> for AgeOffsetPolicy {
    fn from(value: AgeOffsetCli) -> Self {
        match value {
            AgeOffsetCli::PerPartition => AgeOffsetPolicy::PerPartition,
            AgeOffsetCli::SharedComplete => AgeOffsetPolicy::SharedComplete,
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// Trial-site table (trial_id, site_id, country_id)
    #[arg(long)]
    pub trial_site: PathBuf,

    /// Trial table (trial_id, minimum_age)
    #[arg(long)]
    pub trial: PathBuf,

    /// Target table (trial_id, site_id, no_of_patients, enrolment_months)
    #[arg(long)]
    pub target: PathBuf,

    /// Country table (country_id, health expenditure per capita)
    #[arg(long)]
    pub country: PathBuf,

    /// TOML file with [fence], [normalization], [sampler] and [imputation] sections
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub chains: Option<usize>,

    /// Post-warmup draws per chain
    #[arg(long)]
    pub samples: Option<usize>,

    /// Warmup iterations per chain
    #[arg(long)]
    pub warmup: Option<usize>,

    #[arg(long, value_enum)]
    pub age_offset: Option<AgeOffsetCli>,

    /// Where to write the TOML report
    #[arg(long, default_value = "report.toml")]
    pub report: PathBuf,

    /// Hide the stage progress bar
    #[arg(long)]
    pub no_progress: bool,
}

impl RunArgs {
    fn resolve_config(&self) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(seed) = self.seed {
            config.sampler.seed = seed;
        }
        if let Some(chains) = self.chains {
            config.sampler.n_chains = chains;
        }
        if let Some(samples) = self.samples {
            config.sampler.n_samples = samples;
        }
        if let Some(warmup) = self.warmup {
            config.sampler.n_warmup = warmup;
        }
        if let Some(policy) = self.age_offset {
            config.normalization.age_offset = policy.into();
        }
        config.validate()?;
        Ok(config)
    }

    fn sources(&self) -> DataSources {
        DataSources {
            trial_site: self.trial_site.clone(),
            trial: self.trial.clone(),
            target: self.target.clone(),
            country: self.country.clone(),
        }
    }
}

#[derive(Parser)]
#[command(
    name = "siterate",
    about = "Bayesian imputation of clinical-trial site enrolment rates",
    long_about = "Derives patients-per-month enrolment speeds, fences out implausible sites, \
                 fits a Bayesian linear regression with NUTS and imputes the fenced-out \
                 sites from the posterior predictive."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the imputation pipeline (outputs: report.toml)")]
    Run(RunArgs),
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Version) => {
            println!("siterate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn stage_progress(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message("pipeline stages");
    pb
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.resolve_config()?;
    let records = load_site_records(&args.sources())?;
    log::info!("Loaded {} trial-site records.", records.len());

    let progress = (!args.no_progress).then(|| stage_progress(STAGE_COUNT));
    let report = run_pipeline(records, &config, progress.as_ref());
    if let Some(pb) = &progress {
        pb.finish_and_clear();
    }
    let report = report.inspect_err(|e| {
        for warning in e.warnings() {
            log::warn!("Raised before the failure: {warning}");
        }
    })?;

    print!("{}", report.render_summary());
    report.save(&args.report)?;
    println!("\nReport written to {}", args.report.display());
    Ok(())
}
