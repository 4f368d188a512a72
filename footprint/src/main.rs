mod cli;
mod config;
mod summary;

use std::{fs, path::Path, time::Duration};

use chrono::{Datelike as _, Local, NaiveDate};
use clap::Parser as _;
use color_eyre::{
    eyre::{bail, WrapErr as _},
    Result, Section as _,
};
use footprint_data::{
    carbon_intensity::{CarbonIntensityApi, RegionSelector},
    config::{write_config_template, ClusterConfig, TemplateOutcome},
    emissions::Scope3Factor,
    export::{write_tables, ExportMode},
    run_pipeline,
    slurm::{DateRange, Sacct},
    RunOptionsBuilder, RunOutcome,
};
use tracing::{info, instrument, Level};

use crate::{
    cli::{Args, Command, RunArgs},
    config::Settings,
};

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    register_logging(args.log_level)?;

    match args.command {
        Command::Configure { path } => configure(&path),
        Command::Run(run_args) => run(run_args),
    }
}

fn register_logging(level: Option<Level>) -> Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level.unwrap_or(Level::INFO))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).wrap_err("setting default subscriber failed")
}

#[instrument]
fn configure(path: &Path) -> Result<()> {
    match write_config_template(path)? {
        TemplateOutcome::Written => {
            println!("Wrote a configuration template to {}.", path.display());
            println!("Fill in the values for your cluster before running `footprint run`.");
        }
        TemplateOutcome::AlreadyExists => {
            println!("{} already exists, leaving it untouched.", path.display());
        }
    }
    Ok(())
}

/// Everything the command line and the settings say about a run, checked before anything is fetched.
#[derive(Debug)]
struct Resolved {
    date_range: DateRange,
    region: RegionSelector,
    scope3: Scope3Factor,
    export: ExportMode,
    settings: Settings,
}

fn resolve(args: &RunArgs, settings: Settings, today: NaiveDate) -> Result<Resolved> {
    let start = args
        .start_date
        .or_else(|| NaiveDate::from_ymd_opt(today.year(), 1, 1))
        .unwrap_or(today);
    let end = args.end_date.unwrap_or(today);

    let region = args.region.as_deref().unwrap_or(&settings.region).parse::<RegionSelector>()?;
    let scope3 = args.scope3.as_deref().unwrap_or(&settings.scope3).parse::<Scope3Factor>()?;
    let export = args.export.as_deref().unwrap_or(&settings.export).parse::<ExportMode>()?;

    Ok(Resolved { date_range: DateRange::new(start, end)?, region, scope3, export, settings })
}

#[instrument(skip_all)]
fn run(args: RunArgs) -> Result<()> {
    let settings = Settings::new().wrap_err("loading settings")?;
    let Resolved { date_range, region, scope3, export, mut settings } =
        resolve(&args, settings, Local::now().date_naive())?;
    if let Some(path) = args.cluster_config {
        settings.cluster_config = path;
    }
    if let Some(dir) = args.output_dir {
        settings.output_dir = dir;
    }

    let config = ClusterConfig::load(&settings.cluster_config)
        .suggestion("run `footprint configure` and fill in the generated file")?;

    let mut options = RunOptionsBuilder::default();
    options.date_range(date_range).region(region).scope3(scope3);
    if let Some(job_ids) = args.job_ids {
        options.job_ids(job_ids);
    }
    let options = options.build()?;

    if !Sacct::is_available() {
        bail!("`sacct` was not found, this has to run on a Slurm login node");
    }
    let oracle = CarbonIntensityApi::new(Duration::from_secs(settings.oracle_timeout_secs))?;

    info!(%region, %scope3, "processing jobs from {} to {}", date_range.start, date_range.end);
    let report = match run_pipeline(&options, &config, &Sacct, &oracle)? {
        RunOutcome::NoJobs { reason } => {
            println!("{reason}");
            return Ok(());
        }
        RunOutcome::Report(report) => report,
    };

    summary::print(&report, &config, date_range);

    if export != ExportMode::NoSave {
        fs::create_dir_all(&settings.output_dir)
            .wrap_err_with(|| format!("creating {:?}", settings.output_dir))?;
        for path in write_tables(&settings.output_dir, export, &report.rollup)? {
            println!("Saved {}", path.display());
        }
    }
    Ok(())
}
