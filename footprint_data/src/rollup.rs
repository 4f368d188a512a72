//! Per-job, per-day and whole-run views of the enriched jobs.

use chrono::{NaiveDate, NaiveDateTime};
use itertools::Itertools as _;
use serde::Serialize;

use crate::{
    emissions::{EmissionsResult, EnrichedJob},
    energy::EnergyEstimate,
};

/// Aggregate of a group of jobs. Everything is summed, except the carbon intensity and the wasted
/// memory ratio, which are averaged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    /// `None` for the whole-run row
    pub submission_date: Option<NaiveDate>,
    pub job_count: usize,
    pub successful_jobs: u32,
    pub first_job_time: NaiveDateTime,
    pub last_job_time: NaiveDateTime,
    pub elapsed_hours: f64,
    pub node_hours: f64,
    pub cpu_hours: f64,
    pub gpu_hours: f64,
    pub cpu_usage_hours: f64,
    pub gpu_usage_hours: f64,
    pub requested_memory_gb: f64,
    pub used_memory_gb: f64,
    pub required_memory_gb: f64,
    pub wasted_memory_ratio: f64,
    /// raw counter readings
    pub energy_counter_kwh: f64,
    pub energy: EnergyEstimate,
    pub emissions: EmissionsResult,
    pub success_fraction: f64,
    pub failed_fraction: f64,
    /// share of the view's total emissions
    pub emissions_fraction: f64,
}

impl GroupSummary {
    /// `None` for an empty group. `grand_total` is the total emissions of the whole view.
    pub fn of<'a>(
        submission_date: Option<NaiveDate>,
        jobs: impl IntoIterator<Item = &'a EnrichedJob>,
        grand_total: f64,
    ) -> Option<Self> {
        let jobs = jobs.into_iter().collect_vec();
        let (first_job_time, last_job_time) =
            jobs.iter().map(|j| j.job.submission_time).minmax().into_option()?;
        let job_count = jobs.len();
        let sum = |field: fn(&EnrichedJob) -> f64| jobs.iter().map(|j| field(j)).sum::<f64>();

        let mut energy = EnergyEstimate::default();
        let mut emissions = EmissionsResult::default();
        for job in &jobs {
            energy += job.energy;
            emissions += job.emissions;
        }
        emissions.carbon_intensity /= job_count as f64;

        let successful_jobs = jobs.iter().map(|j| j.job.state.code().max(0) as u32).sum::<u32>();
        let success_fraction = successful_jobs as f64 / job_count as f64;

        Some(Self {
            submission_date,
            job_count,
            successful_jobs,
            first_job_time,
            last_job_time,
            elapsed_hours: sum(|j| j.job.elapsed.as_hours()),
            node_hours: sum(|j| j.job.node_hours),
            cpu_hours: sum(|j| j.job.cpu_hours),
            gpu_hours: sum(|j| j.job.gpu_hours),
            cpu_usage_hours: sum(|j| j.job.cpu_usage_time.as_hours()),
            gpu_usage_hours: sum(|j| j.job.gpu_usage_time.as_hours()),
            requested_memory_gb: sum(|j| j.job.requested_memory_gb),
            used_memory_gb: sum(|j| j.job.used_memory_gb),
            required_memory_gb: sum(|j| j.job.required_memory_gb),
            wasted_memory_ratio: sum(|j| j.job.wasted_memory_ratio) / job_count as f64,
            energy_counter_kwh: sum(|j| j.job.measured_energy_kwh),
            energy,
            emissions,
            success_fraction,
            failed_fraction: 1.0 - success_fraction,
            emissions_fraction: emissions_fraction(emissions.total, grand_total),
        })
    }
}

/// 0 when there is nothing to take a share of
pub fn emissions_fraction(group_total: f64, grand_total: f64) -> f64 {
    if grand_total == 0.0 {
        0.0
    } else {
        group_total / grand_total
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rollup {
    pub full: Vec<EnrichedJob>,
    pub daily: Vec<GroupSummary>,
    pub total: GroupSummary,
}

impl Rollup {
    /// `None` if there are no jobs
    pub fn build(full: Vec<EnrichedJob>) -> Option<Self> {
        let grand_total = full.iter().map(|j| j.emissions.total).sum::<f64>();

        let daily = full
            .iter()
            .into_group_map_by(|j| j.job.submission_time.date())
            .into_iter()
            .sorted_by_key(|(date, _)| *date)
            .filter_map(|(date, jobs)| GroupSummary::of(Some(date), jobs, grand_total))
            .collect_vec();
        let total = GroupSummary::of(None, &full, grand_total)?;

        Some(Self { full, daily, total })
    }
}
