use std::{fmt::Debug, process::Command};

use chrono::NaiveDate;
use color_eyre::{
    eyre::{ensure, eyre, WrapErr as _},
    Result, Section as _, SectionExt as _,
};
use derive_more::derive::{Deref, Display, Into};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deref, Into, Display, Serialize, Deserialize)]
pub struct SlurmUser(pub String);

/// Everything the estimation model needs from `sacct`, in this order.
pub const SACCT_FIELDS: &str =
    "UID,USER,Partition,JobID,JobName,Submit,State,Elapsed,AllocTRES,NNodes,NCPUS,TotalCPU,CPUTime,ReqMem,MaxRSS,WorkDir,ConsumedEnergyRaw";

/// Inclusive range of calendar days to pull accounting records for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        ensure!(start <= end, "start date {start} is after end date {end}");
        Ok(Self { start, end })
    }
}

/// `sacct` accepts plain `YYYY-MM-DD` and interprets it as local midnight
pub fn format_date_for_slurm(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Produces the raw pipe-separated accounting table for a date range.
pub trait AccountingSource {
    fn fetch(&self, range: DateRange) -> Result<String>;
}

/// Queries the local workload manager via `sacct -P`.
#[derive(Debug, Clone, Default)]
pub struct Sacct;

impl Sacct {
    pub fn is_available() -> bool {
        Command::new("which").arg("sacct").output().map(|out| out.status.success()).unwrap_or(false)
    }
}

impl AccountingSource for Sacct {
    #[instrument]
    fn fetch(&self, range: DateRange) -> Result<String> {
        let sacct = Command::new("sacct")
            .args(["--start", &format_date_for_slurm(range.start)])
            .args(["--end", &format_date_for_slurm(range.end)])
            .args(["--format", SACCT_FIELDS])
            .arg("-P" /* sep by `|` without trailing `|`*/)
            .output()
            .wrap_err("executing sacct")?;

        if !sacct.status.success() {
            return Err(eyre!("sacct failed with status {:?}", sacct.status.code())
                .note(String::from_utf8_lossy(&sacct.stderr).trim().to_string().header("Stderr:")));
        }

        let stdout = String::from_utf8(sacct.stdout).wrap_err("sacct output is not valid UTF-8")?;
        debug!(lines = stdout.lines().count(), "received accounting table");
        Ok(stdout)
    }
}

/// One row of `sacct -P` output. Each job shows up once for the allocation and once per step.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawStepRecord {
    #[serde(rename = "UID", default)]
    pub uid: Option<String>,
    #[serde(rename = "User", default)]
    pub user: Option<String>,
    #[serde(rename = "Partition", default)]
    pub partition: Option<String>,
    #[serde(rename = "JobID")]
    pub job_id: String,
    #[serde(rename = "JobName", default)]
    pub job_name: Option<String>,
    #[serde(rename = "Submit")]
    pub submit: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Elapsed")]
    pub elapsed: String,
    #[serde(rename = "AllocTRES", default)]
    pub alloc_tres: Option<String>,
    #[serde(rename = "NNodes")]
    pub nnodes: u32,
    #[serde(rename = "NCPUS")]
    pub ncpus: u32,
    #[serde(rename = "TotalCPU")]
    pub total_cpu: String,
    #[serde(rename = "CPUTime", default)]
    pub cpu_time: Option<String>,
    #[serde(rename = "ReqMem", default)]
    pub req_mem: Option<String>,
    #[serde(rename = "MaxRSS", default)]
    pub max_rss: Option<String>,
    #[serde(rename = "WorkDir", default)]
    pub work_dir: Option<String>,
    #[serde(rename = "ConsumedEnergyRaw", default)]
    pub consumed_energy_raw: Option<String>,
}

/// A parsed accounting table.
///
/// Older slurm versions don't know `AllocTRES`; in that case there is no way to tell how many
/// GPUs a job had.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SacctTable {
    pub steps: Vec<RawStepRecord>,
    pub has_alloc_tres: bool,
}

impl SacctTable {
    pub fn parse(input: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'|')
            .quoting(false)
            .from_reader(input.as_bytes());

        let has_alloc_tres = reader.headers().wrap_err("reading sacct header")?.iter().any(|h| h == "AllocTRES");
        let steps = reader
            .deserialize()
            .enumerate()
            .map(|(i, record)| record.wrap_err_with(|| format!("line {}: parsing sacct record", i + 2)))
            .collect::<Result<Vec<RawStepRecord>>>()?;

        Ok(Self { steps, has_alloc_tres })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Canned accounting text, for replaying a saved `sacct -P` dump.
impl AccountingSource for String {
    fn fetch(&self, _range: DateRange) -> Result<String> {
        Ok(self.clone())
    }
}
