//! One run: accounting table in, rollup and diagnostics out.

use color_eyre::{eyre::WrapErr as _, Result};
use derive_builder::Builder;
use itertools::{izip, Itertools as _};
use tracing::{info, instrument};

use crate::{
    carbon_intensity::{self, CarbonIntensitySource, RegionSelector},
    config::ClusterConfig,
    diagnostics::{Diagnostic, Diagnostics},
    emissions::{EmissionsEngine, EnrichedJob, Scope3Factor},
    energy::EnergyEstimator,
    job::{check_single_user, filter_job_ids, JobAggregator},
    normalize::FieldNormalizer,
    rollup::Rollup,
    slurm::{AccountingSource, DateRange, SacctTable},
};

#[derive(Builder, Clone, Debug, PartialEq)]
#[builder(setter(into))]
pub struct RunOptions {
    pub date_range: DateRange,
    /// only keep these main job ids
    #[builder(default, setter(strip_option))]
    pub job_ids: Option<Vec<String>>,
    #[builder(default)]
    pub region: RegionSelector,
    #[builder(default)]
    pub scope3: Scope3Factor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub rollup: Rollup,
    pub diagnostics: Vec<Diagnostic>,
    /// whether energy counter readings were available
    pub counters_present: bool,
}

/// Finding nothing is a normal result.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    NoJobs { reason: String },
    Report(Report),
}

#[instrument(skip_all, fields(start = %options.date_range.start, end = %options.date_range.end))]
pub fn run_pipeline(
    options: &RunOptions,
    config: &ClusterConfig,
    accounting: &dyn AccountingSource,
    oracle: &dyn CarbonIntensitySource,
) -> Result<RunOutcome> {
    let DateRange { start, end } = options.date_range;

    let raw = accounting.fetch(options.date_range).wrap_err("fetching accounting records")?;
    let table = SacctTable::parse(&raw)?;
    if table.is_empty() {
        return Ok(RunOutcome::NoJobs { reason: format!("no jobs found between {start} and {end}") });
    }

    let mut diagnostics = Diagnostics::default();
    let normalizer = FieldNormalizer;
    let mut jobs = JobAggregator::new(&normalizer, config).aggregate(&table, &mut diagnostics)?;
    if let Some(ids) = &options.job_ids {
        jobs = filter_job_ids(jobs, ids);
    }
    if jobs.is_empty() {
        let reason = match &options.job_ids {
            Some(ids) => format!("no finished jobs with ids {} between {start} and {end}", ids.iter().join(", ")),
            None => format!("no finished jobs between {start} and {end}, all of them are still pending or running"),
        };
        return Ok(RunOutcome::NoJobs { reason });
    }
    check_single_user(&jobs)?;

    let estimator = EnergyEstimator::new(config);
    let energies = jobs.iter().map(|job| estimator.estimate(job)).collect::<Result<Vec<_>, _>>()?;
    let intensities = carbon_intensity::intensities(&jobs, options.region, oracle, &mut diagnostics);
    let engine = EmissionsEngine::new(options.scope3, config.pue, config.electricity_cost, &jobs);

    let enriched = izip!(jobs, energies, intensities)
        .map(|(job, energy, carbon_intensity)| {
            let emissions = engine.emissions(&job, &energy, carbon_intensity);
            EnrichedJob { job, energy, emissions }
        })
        .collect_vec();

    let Some(rollup) = Rollup::build(enriched) else {
        return Ok(RunOutcome::NoJobs { reason: format!("no jobs between {start} and {end}") });
    };
    info!(
        jobs = rollup.total.job_count,
        total_emissions = rollup.total.emissions.total,
        warnings = diagnostics.as_slice().len(),
        "run finished"
    );

    Ok(RunOutcome::Report(Report {
        rollup,
        diagnostics: diagnostics.into_vec(),
        counters_present: engine.counters_present,
    }))
}
