//! CSV export of the rollup tables.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{NaiveDate, NaiveDateTime};
use color_eyre::{eyre::WrapErr as _, Result};
use serde::Serialize;
use tracing::{info, instrument};

use crate::{
    config::ConfigError,
    emissions::EnrichedJob,
    rollup::{GroupSummary, Rollup},
};

/// Which tables get written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportMode {
    #[default]
    NoSave,
    Full,
    Daily,
    Total,
    FullSummary,
    DailySummary,
    TotalSummary,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Full,
    Daily,
    Total,
    FullSummary,
    DailySummary,
    TotalSummary,
}

impl Table {
    pub fn file_name(self) -> &'static str {
        match self {
            Table::Full => "full_job_data.csv",
            Table::Daily => "daily_data.csv",
            Table::Total => "total_data.csv",
            Table::FullSummary => "full_job_data_summary.csv",
            Table::DailySummary => "daily_data_summary.csv",
            Table::TotalSummary => "total_data_summary.csv",
        }
    }
}

impl ExportMode {
    const NAMES: [(&'static str, ExportMode); 8] = [
        ("no_save", ExportMode::NoSave),
        ("full", ExportMode::Full),
        ("daily", ExportMode::Daily),
        ("total", ExportMode::Total),
        ("full_summary", ExportMode::FullSummary),
        ("daily_summary", ExportMode::DailySummary),
        ("total_summary", ExportMode::TotalSummary),
        ("all", ExportMode::All),
    ];

    pub fn tables(self) -> &'static [Table] {
        match self {
            ExportMode::NoSave => &[],
            ExportMode::Full => &[Table::Full],
            ExportMode::Daily => &[Table::Daily],
            ExportMode::Total => &[Table::Total],
            ExportMode::FullSummary => &[Table::FullSummary],
            ExportMode::DailySummary => &[Table::DailySummary],
            ExportMode::TotalSummary => &[Table::TotalSummary],
            ExportMode::All => &[
                Table::Full,
                Table::Daily,
                Table::Total,
                Table::FullSummary,
                Table::DailySummary,
                Table::TotalSummary,
            ],
        }
    }
}

impl FromStr for ExportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::NAMES
            .iter()
            .find(|(name, _)| *name == s.trim())
            .map(|(_, mode)| *mode)
            .ok_or_else(|| ConfigError::UnknownExportMode(s.to_owned()))
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = Self::NAMES.iter().find(|(_, mode)| mode == self).map(|(name, _)| *name).unwrap_or_default();
        f.write_str(name)
    }
}

#[derive(Debug, Serialize)]
pub struct FullRow<'a> {
    #[serde(rename = "Job_ID")]
    pub job_id: String,
    #[serde(rename = "UserName")]
    pub user: &'a str,
    #[serde(rename = "NameofJob")]
    pub job_name: &'a str,
    #[serde(rename = "WorkingDir")]
    pub working_directory: &'a str,
    #[serde(rename = "PartitionName")]
    pub partition: &'a str,
    #[serde(rename = "PartitionCategory")]
    pub category: String,
    #[serde(rename = "SubmissionTime")]
    pub submission_time: NaiveDateTime,
    #[serde(rename = "StateCode")]
    pub state_code: i8,
    #[serde(rename = "ElapsedRuntime")]
    pub elapsed: String,
    #[serde(rename = "NNodes")]
    pub nodes: u32,
    #[serde(rename = "NCPUS")]
    pub cpus: u32,
    #[serde(rename = "NGPUS")]
    pub gpus: u32,
    #[serde(rename = "CPUusagetime")]
    pub cpu_usage_time: String,
    #[serde(rename = "GPUusagetime")]
    pub gpu_usage_time: String,
    #[serde(rename = "NodeHours")]
    pub node_hours: f64,
    #[serde(rename = "CPUHours")]
    pub cpu_hours: f64,
    #[serde(rename = "GPUHours")]
    pub gpu_hours: f64,
    #[serde(rename = "RequestedMemoryGB")]
    pub requested_memory_gb: f64,
    #[serde(rename = "UsedMemoryGB")]
    pub used_memory_gb: f64,
    #[serde(rename = "RequiredMemoryGB")]
    pub required_memory_gb: f64,
    #[serde(rename = "WastedMemoryRatio")]
    pub wasted_memory_ratio: f64,
    #[serde(rename = "EnergyIPMI_kwh")]
    pub energy_counter_kwh: f64,
    #[serde(rename = "CPU_energy_estimated_kwh")]
    pub cpu_kwh: f64,
    #[serde(rename = "GPU_energy_estimated_kwh")]
    pub gpu_kwh: f64,
    #[serde(rename = "memory_energy_estimated_kwh")]
    pub memory_kwh: f64,
    #[serde(rename = "energy_estimated_noPUE_kwh")]
    pub total_no_pue_kwh: f64,
    #[serde(rename = "energy_estimated_kwh")]
    pub total_kwh: f64,
    #[serde(rename = "energy_requiredMem_estimated_kwh")]
    pub total_required_memory_kwh: f64,
    #[serde(rename = "failed_energy_kwh")]
    pub failed_kwh: f64,
    #[serde(rename = "CarbonIntensity_gCO2e_kwh")]
    pub carbon_intensity: f64,
    #[serde(rename = "Scope2Emissions_gCO2e")]
    pub scope2: f64,
    #[serde(rename = "Scope2Emissions_IPMI_gCO2e")]
    pub scope2_measured: f64,
    #[serde(rename = "Scope2Emissions_requiredMem_gCO2e")]
    pub scope2_required_memory: f64,
    #[serde(rename = "Scope2Emissions_failed_gCO2e")]
    pub scope2_failed: f64,
    #[serde(rename = "Scope3Emissions_gCO2e")]
    pub scope3: f64,
    #[serde(rename = "TotalEmissions_gCO2e")]
    pub total_emissions: f64,
    #[serde(rename = "Cost_GBP")]
    pub cost: f64,
    pub driving_miles: f64,
    pub tree_absorption_months: f64,
    pub uk_houses_daily_emissions: f64,
    pub bris_paris_flights: f64,
}

impl<'a> From<&'a EnrichedJob> for FullRow<'a> {
    fn from(EnrichedJob { job, energy, emissions }: &'a EnrichedJob) -> Self {
        Self {
            job_id: job.job_id.to_string(),
            user: &job.user,
            job_name: &job.job_name,
            working_directory: &job.working_directory,
            partition: &job.partition,
            category: job.category.to_string(),
            submission_time: job.submission_time,
            state_code: job.state.code(),
            elapsed: job.elapsed.to_string(),
            nodes: job.nodes,
            cpus: job.cpus,
            gpus: job.gpus,
            cpu_usage_time: job.cpu_usage_time.to_string(),
            gpu_usage_time: job.gpu_usage_time.to_string(),
            node_hours: job.node_hours,
            cpu_hours: job.cpu_hours,
            gpu_hours: job.gpu_hours,
            requested_memory_gb: job.requested_memory_gb,
            used_memory_gb: job.used_memory_gb,
            required_memory_gb: job.required_memory_gb,
            wasted_memory_ratio: job.wasted_memory_ratio,
            energy_counter_kwh: job.measured_energy_kwh,
            cpu_kwh: energy.cpu_kwh,
            gpu_kwh: energy.gpu_kwh,
            memory_kwh: energy.memory_kwh,
            total_no_pue_kwh: energy.total_no_pue_kwh,
            total_kwh: energy.total_kwh,
            total_required_memory_kwh: energy.total_required_memory_kwh,
            failed_kwh: energy.failed_kwh,
            carbon_intensity: emissions.carbon_intensity,
            scope2: emissions.scope2,
            scope2_measured: emissions.scope2_measured,
            scope2_required_memory: emissions.scope2_required_memory,
            scope2_failed: emissions.scope2_failed,
            scope3: emissions.scope3,
            total_emissions: emissions.total,
            cost: emissions.cost,
            driving_miles: emissions.equivalents.driving_miles,
            tree_absorption_months: emissions.equivalents.tree_months,
            uk_houses_daily_emissions: emissions.equivalents.household_days,
            bris_paris_flights: emissions.equivalents.flights,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FullSummaryRow {
    #[serde(rename = "Job_ID")]
    pub job_id: String,
    #[serde(rename = "NameofJob")]
    pub job_name: String,
    #[serde(rename = "SubmissionTime")]
    pub submission_time: NaiveDateTime,
    #[serde(rename = "ElapsedRuntime")]
    pub elapsed: String,
    #[serde(rename = "EnergyIPMI_kwh")]
    pub energy_counter_kwh: f64,
    #[serde(rename = "energy_estimated_noPUE_kwh")]
    pub total_no_pue_kwh: f64,
    #[serde(rename = "energy_estimated_kwh")]
    pub total_kwh: f64,
    #[serde(rename = "Scope2Emissions_IPMI_gCO2e")]
    pub scope2_measured: f64,
    #[serde(rename = "Scope2Emissions_gCO2e")]
    pub scope2: f64,
    #[serde(rename = "Scope3Emissions_gCO2e")]
    pub scope3: f64,
    #[serde(rename = "TotalEmissions_gCO2e")]
    pub total_emissions: f64,
    #[serde(rename = "CarbonIntensity_gCO2e_kwh")]
    pub carbon_intensity: f64,
    #[serde(rename = "Cost_GBP")]
    pub cost: f64,
    pub driving_miles: f64,
    pub tree_absorption_months: f64,
    pub uk_houses_daily_emissions: f64,
    pub bris_paris_flights: f64,
}

impl From<&EnrichedJob> for FullSummaryRow {
    fn from(EnrichedJob { job, energy, emissions }: &EnrichedJob) -> Self {
        Self {
            job_id: job.job_id.to_string(),
            job_name: job.job_name.clone(),
            submission_time: job.submission_time,
            elapsed: job.elapsed.to_string(),
            energy_counter_kwh: job.measured_energy_kwh,
            total_no_pue_kwh: energy.total_no_pue_kwh,
            total_kwh: energy.total_kwh,
            scope2_measured: emissions.scope2_measured,
            scope2: emissions.scope2,
            scope3: emissions.scope3,
            total_emissions: emissions.total,
            carbon_intensity: emissions.carbon_intensity,
            cost: emissions.cost,
            driving_miles: emissions.equivalents.driving_miles,
            tree_absorption_months: emissions.equivalents.tree_months,
            uk_houses_daily_emissions: emissions.equivalents.household_days,
            bris_paris_flights: emissions.equivalents.flights,
        }
    }
}

/// A daily or whole-run row. The date stays empty for the whole run.
#[derive(Debug, Serialize)]
pub struct GroupRow {
    #[serde(rename = "SubmissionDate")]
    pub submission_date: Option<NaiveDate>,
    #[serde(rename = "JobCount")]
    pub job_count: usize,
    #[serde(rename = "successful_jobs")]
    pub successful_jobs: u32,
    #[serde(rename = "SuccessFraction")]
    pub success_fraction: f64,
    #[serde(rename = "FailedFraction")]
    pub failed_fraction: f64,
    #[serde(rename = "FirstJobTime")]
    pub first_job_time: NaiveDateTime,
    #[serde(rename = "LastJobTime")]
    pub last_job_time: NaiveDateTime,
    #[serde(rename = "ElapsedHours")]
    pub elapsed_hours: f64,
    #[serde(rename = "NodeHours")]
    pub node_hours: f64,
    #[serde(rename = "CPUHours")]
    pub cpu_hours: f64,
    #[serde(rename = "GPUHours")]
    pub gpu_hours: f64,
    #[serde(rename = "CPUusageHours")]
    pub cpu_usage_hours: f64,
    #[serde(rename = "GPUusageHours")]
    pub gpu_usage_hours: f64,
    #[serde(rename = "RequestedMemoryGB")]
    pub requested_memory_gb: f64,
    #[serde(rename = "UsedMemoryGB")]
    pub used_memory_gb: f64,
    #[serde(rename = "RequiredMemoryGB")]
    pub required_memory_gb: f64,
    #[serde(rename = "WastedMemoryRatio")]
    pub wasted_memory_ratio: f64,
    #[serde(rename = "EnergyIPMI_kwh")]
    pub energy_counter_kwh: f64,
    #[serde(rename = "CPU_energy_estimated_kwh")]
    pub cpu_kwh: f64,
    #[serde(rename = "GPU_energy_estimated_kwh")]
    pub gpu_kwh: f64,
    #[serde(rename = "memory_energy_estimated_kwh")]
    pub memory_kwh: f64,
    #[serde(rename = "energy_estimated_noPUE_kwh")]
    pub total_no_pue_kwh: f64,
    #[serde(rename = "energy_estimated_kwh")]
    pub total_kwh: f64,
    #[serde(rename = "energy_requiredMem_estimated_kwh")]
    pub total_required_memory_kwh: f64,
    #[serde(rename = "failed_energy_kwh")]
    pub failed_kwh: f64,
    #[serde(rename = "CarbonIntensity_gCO2e_kwh")]
    pub carbon_intensity: f64,
    #[serde(rename = "Scope2Emissions_gCO2e")]
    pub scope2: f64,
    #[serde(rename = "Scope2Emissions_IPMI_gCO2e")]
    pub scope2_measured: f64,
    #[serde(rename = "Scope2Emissions_requiredMem_gCO2e")]
    pub scope2_required_memory: f64,
    #[serde(rename = "Scope2Emissions_failed_gCO2e")]
    pub scope2_failed: f64,
    #[serde(rename = "Scope3Emissions_gCO2e")]
    pub scope3: f64,
    #[serde(rename = "TotalEmissions_gCO2e")]
    pub total_emissions: f64,
    #[serde(rename = "EmissionsFraction")]
    pub emissions_fraction: f64,
    #[serde(rename = "Cost_GBP")]
    pub cost: f64,
    pub driving_miles: f64,
    pub tree_absorption_months: f64,
    pub uk_houses_daily_emissions: f64,
    pub bris_paris_flights: f64,
}

impl From<&GroupSummary> for GroupRow {
    fn from(g: &GroupSummary) -> Self {
        Self {
            submission_date: g.submission_date,
            job_count: g.job_count,
            successful_jobs: g.successful_jobs,
            success_fraction: g.success_fraction,
            failed_fraction: g.failed_fraction,
            first_job_time: g.first_job_time,
            last_job_time: g.last_job_time,
            elapsed_hours: g.elapsed_hours,
            node_hours: g.node_hours,
            cpu_hours: g.cpu_hours,
            gpu_hours: g.gpu_hours,
            cpu_usage_hours: g.cpu_usage_hours,
            gpu_usage_hours: g.gpu_usage_hours,
            requested_memory_gb: g.requested_memory_gb,
            used_memory_gb: g.used_memory_gb,
            required_memory_gb: g.required_memory_gb,
            wasted_memory_ratio: g.wasted_memory_ratio,
            energy_counter_kwh: g.energy_counter_kwh,
            cpu_kwh: g.energy.cpu_kwh,
            gpu_kwh: g.energy.gpu_kwh,
            memory_kwh: g.energy.memory_kwh,
            total_no_pue_kwh: g.energy.total_no_pue_kwh,
            total_kwh: g.energy.total_kwh,
            total_required_memory_kwh: g.energy.total_required_memory_kwh,
            failed_kwh: g.energy.failed_kwh,
            carbon_intensity: g.emissions.carbon_intensity,
            scope2: g.emissions.scope2,
            scope2_measured: g.emissions.scope2_measured,
            scope2_required_memory: g.emissions.scope2_required_memory,
            scope2_failed: g.emissions.scope2_failed,
            scope3: g.emissions.scope3,
            total_emissions: g.emissions.total,
            emissions_fraction: g.emissions_fraction,
            cost: g.emissions.cost,
            driving_miles: g.emissions.equivalents.driving_miles,
            tree_absorption_months: g.emissions.equivalents.tree_months,
            uk_houses_daily_emissions: g.emissions.equivalents.household_days,
            bris_paris_flights: g.emissions.equivalents.flights,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GroupSummaryRow {
    #[serde(rename = "SubmissionDate")]
    pub submission_date: Option<NaiveDate>,
    #[serde(rename = "JobCount")]
    pub job_count: usize,
    #[serde(rename = "EnergyIPMI_kwh")]
    pub energy_counter_kwh: f64,
    #[serde(rename = "energy_estimated_noPUE_kwh")]
    pub total_no_pue_kwh: f64,
    #[serde(rename = "energy_estimated_kwh")]
    pub total_kwh: f64,
    #[serde(rename = "Scope2Emissions_IPMI_gCO2e")]
    pub scope2_measured: f64,
    #[serde(rename = "Scope2Emissions_gCO2e")]
    pub scope2: f64,
    #[serde(rename = "Scope3Emissions_gCO2e")]
    pub scope3: f64,
    #[serde(rename = "TotalEmissions_gCO2e")]
    pub total_emissions: f64,
    #[serde(rename = "CarbonIntensity_gCO2e_kwh")]
    pub carbon_intensity: f64,
    #[serde(rename = "Cost_GBP")]
    pub cost: f64,
    pub driving_miles: f64,
    pub tree_absorption_months: f64,
    pub uk_houses_daily_emissions: f64,
    pub bris_paris_flights: f64,
}

impl From<&GroupSummary> for GroupSummaryRow {
    fn from(g: &GroupSummary) -> Self {
        Self {
            submission_date: g.submission_date,
            job_count: g.job_count,
            energy_counter_kwh: g.energy_counter_kwh,
            total_no_pue_kwh: g.energy.total_no_pue_kwh,
            total_kwh: g.energy.total_kwh,
            scope2_measured: g.emissions.scope2_measured,
            scope2: g.emissions.scope2,
            scope3: g.emissions.scope3,
            total_emissions: g.emissions.total,
            carbon_intensity: g.emissions.carbon_intensity,
            cost: g.emissions.cost,
            driving_miles: g.emissions.equivalents.driving_miles,
            tree_absorption_months: g.emissions.equivalents.tree_months,
            uk_houses_daily_emissions: g.emissions.equivalents.household_days,
            bris_paris_flights: g.emissions.equivalents.flights,
        }
    }
}

fn write_csv<T: Serialize>(path: &Path, rows: impl IntoIterator<Item = T>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).wrap_err_with(|| format!("creating {path:?}"))?;
    for row in rows {
        writer.serialize(row).wrap_err_with(|| format!("writing {path:?}"))?;
    }
    writer.flush().wrap_err_with(|| format!("flushing {path:?}"))?;
    Ok(())
}

/// Writes the tables selected by `mode` into `dir`, returns the written paths.
#[instrument(skip(rollup))]
pub fn write_tables(dir: &Path, mode: ExportMode, rollup: &Rollup) -> Result<Vec<PathBuf>> {
    mode.tables()
        .iter()
        .map(|&table| {
            let path = dir.join(table.file_name());
            match table {
                Table::Full => write_csv(&path, rollup.full.iter().map(FullRow::from)),
                Table::Daily => write_csv(&path, rollup.daily.iter().map(GroupRow::from)),
                Table::Total => write_csv(&path, [GroupRow::from(&rollup.total)]),
                Table::FullSummary => write_csv(&path, rollup.full.iter().map(FullSummaryRow::from)),
                Table::DailySummary => write_csv(&path, rollup.daily.iter().map(GroupSummaryRow::from)),
                Table::TotalSummary => write_csv(&path, [GroupSummaryRow::from(&rollup.total)]),
            }?;
            info!(?path, "wrote table");
            Ok(path)
        })
        .collect()
}
