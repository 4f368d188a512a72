//! Turns raw `sacct` text fields into typed values.
//!
//! [`FieldNormalizer`] holds no state; it exists so that the aggregator can be handed one explicitly
//! instead of inheriting the helpers.

use std::{cmp::Ordering, fmt};

use chrono::NaiveDateTime;
use itertools::Itertools as _;
use serde::Serialize;

use crate::{
    diagnostics::Diagnostic,
    misc::parsing::{memory, Duration, FieldError},
};

const SUBMIT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const JOULES_PER_KWH: f64 = 3_600_000.0;

/// Normalised lifecycle state.
///
/// The numeric codes are ordered so that the minimum across a job's steps is the job's state: a
/// single running step keeps the whole job out of the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "i8")]
pub enum StateCode {
    Active = -2,
    Failed = 0,
    Completed = 1,
}

impl StateCode {
    pub fn code(self) -> i8 {
        self as i8
    }
}

impl From<StateCode> for i8 {
    fn from(value: StateCode) -> Self {
        value.code()
    }
}

/// `main[_task]`, with any `.step` suffix removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JobId {
    pub main: String,
    pub array_task: Option<String>,
}

impl JobId {
    fn sort_key(&self) -> (Option<u64>, &str, Option<&str>) {
        (self.main.parse().ok(), &self.main, self.array_task.as_deref())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.array_task {
            Some(task) => write!(f, "{}_{task}", self.main),
            None => write!(f, "{}", self.main),
        }
    }
}

/// Numeric main ids first (so `9` sorts before `10`), then array tasks
impl Ord for JobId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for JobId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FieldNormalizer;

impl FieldNormalizer {
    pub fn duration(&self, raw: &str) -> Result<Duration, FieldError> {
        Duration::parse(raw)
    }

    pub fn requested_memory_gb(&self, raw: Option<&str>, nodes: u32, cpus: u32) -> Result<f64, FieldError> {
        memory::requested_gb(raw, nodes, cpus)
    }

    pub fn used_memory_gb(&self, raw: Option<&str>) -> Result<Option<f64>, FieldError> {
        memory::used_gb(raw)
    }

    /// First listed partition governs the job. Several partitions on a job that actually ran is
    /// suspicious but not fatal, so it comes back as a [`Diagnostic`].
    pub fn partition(&self, raw: Option<&str>, elapsed: Duration, job_id: &str) -> (String, Option<Diagnostic>) {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return (String::new(), None);
        };
        let partitions = raw.split(',').map(str::trim).collect_vec();

        let diagnostic = (elapsed.is_positive() && partitions.len() > 1).then(|| Diagnostic::MultiplePartitions {
            job_id: job_id.to_owned(),
            partitions: partitions.iter().map(|p| p.to_string()).collect(),
        });

        (partitions[0].to_owned(), diagnostic)
    }

    /// Anything that is not a known success or a known active state counts as failed.
    pub fn state(&self, raw: &str) -> StateCode {
        const SUCCESSFUL: [&str; 2] = ["CD", "COMPLETED"];
        const ACTIVE: [&str; 6] = ["PD", "PENDING", "R", "RUNNING", "RQ", "REQUEUED"];

        // `CANCELLED by 1234` and friends
        let token = raw.split_whitespace().next().unwrap_or_default();

        if ACTIVE.contains(&token) {
            StateCode::Active
        } else if SUCCESSFUL.contains(&token) {
            StateCode::Completed
        } else {
            StateCode::Failed
        }
    }

    /// `1234`, `1234_7`, `1234.batch`, `1234_7.0` all work; `1_2_3` doesn't.
    pub fn job_id(&self, raw: &str) -> Result<JobId, FieldError> {
        let raw = raw.trim();
        let without_step = raw.split('.').next().unwrap_or_default();
        let parts = without_step.split('_').collect_vec();

        match parts.as_slice() {
            &[main] if !main.is_empty() => Ok(JobId { main: main.to_owned(), array_task: None }),
            &[main, task] if !main.is_empty() => Ok(JobId { main: main.to_owned(), array_task: Some(task.to_owned()) }),
            _ => Err(FieldError::JobId(raw.to_owned())),
        }
    }

    pub fn submission_time(&self, raw: &str) -> Result<NaiveDateTime, FieldError> {
        NaiveDateTime::parse_from_str(raw.trim(), SUBMIT_FORMAT).map_err(|_| FieldError::Timestamp(raw.to_owned()))
    }

    /// The `gres/gpu=N` entry of `AllocTRES`, 0 if there is none
    pub fn gpu_count(&self, alloc_tres: Option<&str>) -> Result<u32, FieldError> {
        let Some(tres) = alloc_tres else {
            return Ok(0);
        };
        tres.split(',')
            .find_map(|entry| entry.trim().strip_prefix("gres/gpu="))
            .map(|count| count.parse::<u32>())
            .transpose()
            .map(Option::unwrap_or_default)
            .map_err(FieldError::from)
    }

    /// `ConsumedEnergyRaw` is in Joules. Missing or garbage readings count as "not measured".
    pub fn consumed_energy_kwh(&self, raw: Option<&str>) -> f64 {
        raw.and_then(|joules| joules.trim().parse::<f64>().ok())
            .filter(|joules| joules.is_finite())
            .map(|joules| joules / JOULES_PER_KWH)
            .unwrap_or(0.0)
    }
}
