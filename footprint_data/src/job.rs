//! One authoritative record per job, merged from the step rows of an accounting table.

use chrono::NaiveDateTime;
use itertools::Itertools as _;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    config::{ClusterConfig, ProcessorCategory},
    diagnostics::{Diagnostic, Diagnostics},
    misc::parsing::{Duration, FieldError},
    normalize::{FieldNormalizer, JobId, StateCode},
    slurm::{RawStepRecord, SacctTable, SlurmUser},
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("job {job_id}: {source}")]
    MalformedField { job_id: String, source: FieldError },
    #[error("job {job_id}: partition `{partition}` is not listed in the cluster configuration")]
    UnknownPartition { job_id: String, partition: String },
    #[error("multiple users found in the job logs ({}), only a single user can be processed", .users.iter().join(", "))]
    MultipleUsers { users: Vec<SlurmUser> },
}

/// One step row with every field parsed. Still one row per step, not per job.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub job_id: JobId,
    pub uid: Option<String>,
    pub user: Option<String>,
    pub job_name: Option<String>,
    pub working_directory: Option<String>,
    pub partition: String,
    pub submission_time: NaiveDateTime,
    pub state: StateCode,
    pub elapsed: Duration,
    pub nodes: u32,
    pub cpus: u32,
    pub gpus: u32,
    pub actual_cpu_time: Duration,
    pub cpu_wall_time: Duration,
    pub requested_memory_gb: f64,
    pub used_memory_gb: Option<f64>,
    pub measured_energy_kwh: f64,
}

/// A job's steps folded together, before anything is derived from them
#[derive(Debug, Clone, PartialEq)]
pub struct MergedJob {
    pub job_id: JobId,
    pub uid: Option<String>,
    pub user: SlurmUser,
    pub job_name: String,
    pub working_directory: String,
    pub partition: String,
    pub submission_time: NaiveDateTime,
    pub state: StateCode,
    pub elapsed: Duration,
    pub nodes: u32,
    pub cpus: u32,
    pub gpus: u32,
    pub actual_cpu_time: Duration,
    pub cpu_wall_time: Duration,
    pub requested_memory_gb: f64,
    /// `None` if no step ever reported a high-water mark
    pub used_memory_gb: Option<f64>,
    pub measured_energy_kwh: f64,
}

/// Per-job usage, as handed to the energy model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub uid: Option<String>,
    pub user: SlurmUser,
    pub job_name: String,
    pub working_directory: String,
    pub partition: String,
    pub category: ProcessorCategory,
    pub submission_time: NaiveDateTime,
    pub state: StateCode,
    #[serde(skip)]
    pub elapsed: Duration,
    pub nodes: u32,
    pub cpus: u32,
    pub gpus: u32,
    #[serde(skip)]
    pub actual_cpu_time: Duration,
    #[serde(skip)]
    pub cpu_wall_time: Duration,
    #[serde(skip)]
    pub cpu_usage_time: Duration,
    #[serde(skip)]
    pub gpu_usage_time: Duration,
    pub requested_memory_gb: f64,
    pub used_memory_gb: f64,
    pub required_memory_gb: f64,
    pub wasted_memory_ratio: f64,
    pub node_hours: f64,
    pub cpu_hours: f64,
    pub gpu_hours: f64,
    /// hardware energy counter, 0 when the cluster has no instrumentation
    pub measured_energy_kwh: f64,
}

/// Measured cpu time if there is any, otherwise all allocated cores busy for the whole run
pub fn cpu_usage_time(actual_cpu_time: Duration, cpu_wall_time: Duration) -> Duration {
    if !actual_cpu_time.is_positive() {
        cpu_wall_time
    } else {
        actual_cpu_time
    }
}

/// No per-GPU utilisation is available, so GPUs are assumed fully busy
pub fn gpu_usage_time(category: ProcessorCategory, elapsed: Duration, gpus: u32) -> Duration {
    match category {
        ProcessorCategory::Cpu => Duration::default(),
        ProcessorCategory::Gpu => elapsed.times(gpus),
    }
}

pub fn node_hours(elapsed: Duration, nodes: u32) -> f64 {
    elapsed.times(nodes).as_hours()
}

/// `(cpu_hours, gpu_hours)`, billed by partition category: one of them is always 0
pub fn core_hours(category: ProcessorCategory, cpu_usage_time: Duration, elapsed: Duration, gpus: u32) -> (f64, f64) {
    match category {
        ProcessorCategory::Cpu => (cpu_usage_time.as_hours(), 0.0),
        ProcessorCategory::Gpu => (0.0, elapsed.times(gpus).as_hours()),
    }
}

/// The smallest request that would have fitted the job: usage rounded to the next GB, plus 1.
pub fn required_memory_gb(requested_gb: f64, used_gb: f64) -> f64 {
    let rounded = used_gb.trunc() + 1.0;
    if requested_gb < used_gb {
        rounded
    } else {
        requested_gb.min(rounded)
    }
}

/// How many times more memory was requested than needed. Never below 1.
pub fn wasted_memory_ratio(requested_gb: f64, required_gb: f64) -> f64 {
    if requested_gb < required_gb || required_gb <= 0.0 {
        1.0
    } else {
        requested_gb / required_gb
    }
}

/// Folds step rows into jobs and derives usage metrics.
#[derive(Debug, Clone, Copy)]
pub struct JobAggregator<'a> {
    normalizer: &'a FieldNormalizer,
    config: &'a ClusterConfig,
}

impl<'a> JobAggregator<'a> {
    pub fn new(normalizer: &'a FieldNormalizer, config: &'a ClusterConfig) -> Self {
        Self { normalizer, config }
    }

    pub fn normalize_step(&self, raw: &RawStepRecord) -> Result<(StepRecord, Option<Diagnostic>), PipelineError> {
        let n = self.normalizer;
        let malformed = |source: FieldError| PipelineError::MalformedField { job_id: raw.job_id.clone(), source };

        let elapsed = n.duration(&raw.elapsed).map_err(malformed)?;
        let (partition, diagnostic) = n.partition(raw.partition.as_deref(), elapsed, &raw.job_id);
        let cpu_wall_time = match raw.cpu_time.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(cpu_time) => n.duration(cpu_time).map_err(malformed)?,
            None => elapsed.times(raw.ncpus),
        };

        let step = StepRecord {
            job_id: n.job_id(&raw.job_id).map_err(malformed)?,
            uid: non_empty(&raw.uid),
            user: non_empty(&raw.user),
            job_name: non_empty(&raw.job_name),
            working_directory: non_empty(&raw.work_dir),
            partition,
            submission_time: n.submission_time(&raw.submit).map_err(malformed)?,
            state: n.state(&raw.state),
            elapsed,
            nodes: raw.nnodes,
            cpus: raw.ncpus,
            gpus: n.gpu_count(raw.alloc_tres.as_deref()).map_err(malformed)?,
            actual_cpu_time: n.duration(&raw.total_cpu).map_err(malformed)?,
            cpu_wall_time,
            requested_memory_gb: n
                .requested_memory_gb(raw.req_mem.as_deref(), raw.nnodes, raw.ncpus)
                .map_err(malformed)?,
            used_memory_gb: n.used_memory_gb(raw.max_rss.as_deref()).map_err(malformed)?,
            measured_energy_kwh: n.consumed_energy_kwh(raw.consumed_energy_raw.as_deref()),
        };
        Ok((step, diagnostic))
    }

    /// Identity fields come from the first step that has them, counts and usage take the
    /// maximum, submission the earliest and the state the minimum code.
    pub fn merge(steps: Vec<StepRecord>) -> Vec<MergedJob> {
        steps
            .into_iter()
            .into_group_map_by(|step| step.job_id.clone())
            .into_iter()
            .filter_map(|(job_id, steps)| {
                let first_of = |field: fn(&StepRecord) -> Option<&String>| steps.iter().find_map(field).cloned();
                let max_u32 = |field: fn(&StepRecord) -> u32| steps.iter().map(field).max().unwrap_or_default();
                let max_duration = |field: fn(&StepRecord) -> Duration| steps.iter().map(field).max().unwrap_or_default();
                let max_f64 = |field: fn(&StepRecord) -> f64| steps.iter().map(field).fold(0.0, f64::max);

                Some(MergedJob {
                    uid: first_of(|s| s.uid.as_ref()),
                    user: SlurmUser(first_of(|s| s.user.as_ref()).unwrap_or_default()),
                    job_name: first_of(|s| s.job_name.as_ref()).unwrap_or_default(),
                    working_directory: first_of(|s| s.working_directory.as_ref()).unwrap_or_default(),
                    partition: steps.iter().map(|s| &s.partition).find(|p| !p.is_empty()).cloned().unwrap_or_default(),
                    submission_time: steps.iter().map(|s| s.submission_time).min()?,
                    state: steps.iter().map(|s| s.state).min()?,
                    elapsed: max_duration(|s| s.elapsed),
                    nodes: max_u32(|s| s.nodes),
                    cpus: max_u32(|s| s.cpus),
                    gpus: max_u32(|s| s.gpus),
                    actual_cpu_time: max_duration(|s| s.actual_cpu_time),
                    cpu_wall_time: max_duration(|s| s.cpu_wall_time),
                    requested_memory_gb: max_f64(|s| s.requested_memory_gb),
                    used_memory_gb: steps.iter().filter_map(|s| s.used_memory_gb).reduce(f64::max),
                    measured_energy_kwh: max_f64(|s| s.measured_energy_kwh),
                    job_id,
                })
            })
            .sorted_by(|a, b| a.job_id.cmp(&b.job_id))
            .collect()
    }

    /// Derives the usage metrics of a finished job. Fails if the partition is unknown to the
    /// cluster configuration.
    pub fn derive(&self, job: MergedJob, assume_one_gpu: bool) -> Result<JobRecord, PipelineError> {
        let category = self
            .config
            .partition(&job.partition)
            .map(|spec| spec.processor)
            .ok_or_else(|| PipelineError::UnknownPartition { job_id: job.job_id.to_string(), partition: job.partition.clone() })?;

        let gpus = match category {
            ProcessorCategory::Gpu if assume_one_gpu => 1,
            _ => job.gpus,
        };
        // an unreported high-water mark means the whole request is assumed to be used
        let used_memory_gb = job.used_memory_gb.unwrap_or(job.requested_memory_gb);
        let cpu_usage_time = cpu_usage_time(job.actual_cpu_time, job.cpu_wall_time);
        let (cpu_hours, gpu_hours) = core_hours(category, cpu_usage_time, job.elapsed, gpus);
        let required_memory_gb = required_memory_gb(job.requested_memory_gb, used_memory_gb);

        Ok(JobRecord {
            category,
            gpus,
            cpu_usage_time,
            gpu_usage_time: gpu_usage_time(category, job.elapsed, gpus),
            used_memory_gb,
            required_memory_gb,
            wasted_memory_ratio: wasted_memory_ratio(job.requested_memory_gb, required_memory_gb),
            node_hours: node_hours(job.elapsed, job.nodes),
            cpu_hours,
            gpu_hours,
            job_id: job.job_id,
            uid: job.uid,
            user: job.user,
            job_name: job.job_name,
            working_directory: job.working_directory,
            partition: job.partition,
            submission_time: job.submission_time,
            state: job.state,
            elapsed: job.elapsed,
            nodes: job.nodes,
            cpus: job.cpus,
            actual_cpu_time: job.actual_cpu_time,
            cpu_wall_time: job.cpu_wall_time,
            requested_memory_gb: job.requested_memory_gb,
            measured_energy_kwh: job.measured_energy_kwh,
        })
    }

    /// Normalise, merge, drop jobs that are still pending or running, derive.
    #[instrument(skip_all, fields(steps = table.steps.len()))]
    pub fn aggregate(&self, table: &SacctTable, diagnostics: &mut Diagnostics) -> Result<Vec<JobRecord>, PipelineError> {
        let (steps, step_diagnostics): (Vec<_>, Vec<_>) =
            table.steps.iter().map(|raw| self.normalize_step(raw)).process_results(|iter| iter.unzip())?;
        diagnostics.extend(step_diagnostics.into_iter().flatten());

        let assume_one_gpu = !table.has_alloc_tres;
        if assume_one_gpu {
            diagnostics.push(Diagnostic::MissingAllocTres);
        }

        let merged = Self::merge(steps);
        let total = merged.len();
        let jobs = merged
            .into_iter()
            .filter(|job| job.state != StateCode::Active)
            .map(|job| self.derive(job, assume_one_gpu))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(total, finished = jobs.len(), "merged job steps");
        Ok(jobs)
    }
}

fn non_empty(field: &Option<String>) -> Option<String> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned)
}

/// Keeps jobs whose main id is in `ids`
pub fn filter_job_ids(jobs: Vec<JobRecord>, ids: &[String]) -> Vec<JobRecord> {
    jobs.into_iter().filter(|job| ids.iter().any(|id| id.trim() == job.job_id.main)).collect()
}

/// The whole run is about one user; anything else means the accounting query went wrong.
pub fn check_single_user(jobs: &[JobRecord]) -> Result<(), PipelineError> {
    let users = jobs.iter().map(|job| &job.user).unique().cloned().sorted().collect_vec();
    if users.len() > 1 {
        return Err(PipelineError::MultipleUsers { users });
    }
    Ok(())
}

#[allow(non_snake_case)]
#[cfg(test)]
mod test {
    use itertools::Itertools as _;

    use super::*;
    use crate::config::test::EXAMPLE;

    const ε: f64 = 0.0000000001;

    const HEADER: &str = "UID|User|Partition|JobID|JobName|Submit|State|Elapsed|AllocTRES|NNodes|NCPUS|TotalCPU|CPUTime|ReqMem|MaxRSS|WorkDir|ConsumedEnergyRaw";

    fn table(rows: &[&str]) -> SacctTable {
        SacctTable::parse(&std::iter::once(HEADER).chain(rows.iter().copied()).join("\n")).unwrap()
    }

    fn aggregate(rows: &[&str]) -> Result<(Vec<JobRecord>, Diagnostics), PipelineError> {
        let config = ClusterConfig::from_yaml(EXAMPLE).unwrap();
        let normalizer = FieldNormalizer;
        let mut diagnostics = Diagnostics::default();
        let jobs = JobAggregator::new(&normalizer, &config).aggregate(&table(rows), &mut diagnostics)?;
        Ok((jobs, diagnostics))
    }

    #[test]
    fn required_memory_gb__cases() {
        // requested more than used: round up and add one
        assert_eq!(required_memory_gb(16.0, 2.5), 3.0);
        // requested barely enough
        assert_eq!(required_memory_gb(2.8, 2.5), 2.8);
        // requested too little
        assert_eq!(required_memory_gb(2.0, 2.5), 3.0);
        assert_eq!(required_memory_gb(0.0, 0.0), 0.0);
    }

    #[test]
    fn wasted_memory_ratio__never_below_one() {
        assert_eq!(wasted_memory_ratio(16.0, 4.0), 4.0);
        assert_eq!(wasted_memory_ratio(2.0, 3.0), 1.0);
        assert_eq!(wasted_memory_ratio(0.0, 0.0), 1.0);
        for (requested, used) in [(1.0, 0.2), (8.0, 7.9), (0.5, 4.0), (64.0, 0.0), (3.0, 3.0)] {
            let ratio = wasted_memory_ratio(requested, required_memory_gb(requested, used));
            assert!(ratio >= 1.0, "{requested} {used} -> {ratio}");
        }
    }

    #[test]
    fn cpu_usage_time__falls_back_to_wall_time() {
        let wall = Duration::parse("04:00:00").unwrap();
        assert_eq!(cpu_usage_time(Duration::default(), wall), wall);
        let actual = Duration::parse("03:30:00").unwrap();
        assert_eq!(cpu_usage_time(actual, wall), actual);
    }

    #[test]
    fn core_hours__exclusive_by_category() {
        let elapsed = Duration::parse("00:30:00").unwrap();
        let usage = Duration::parse("02:00:00").unwrap();
        assert_eq!(core_hours(ProcessorCategory::Cpu, usage, elapsed, 2), (2.0, 0.0));
        assert_eq!(core_hours(ProcessorCategory::Gpu, usage, elapsed, 2), (0.0, 1.0));
        assert_eq!(gpu_usage_time(ProcessorCategory::Cpu, elapsed, 2), Duration::default());
        assert_eq!(gpu_usage_time(ProcessorCategory::Gpu, elapsed, 2), Duration::parse("01:00:00").unwrap());
    }

    #[test]
    fn JobAggregator__aggregate__merges_steps() {
        let (jobs, diagnostics) = aggregate(&[
            "1001|alice|grace|100|sim|2025-07-01T09:00:00|COMPLETED|01:00:00|billing=4,cpu=4,mem=8G,node=1|1|4|00:00:00|04:00:00|8G||/home/alice|",
            "||grace|100.batch|batch|2025-07-01T08:59:00|COMPLETED|01:00:00|cpu=4,mem=8G,node=1|1|4|00:00:00|04:00:00||2500000K||7200000",
            "||grace|100.extern|extern|2025-07-01T09:00:00|COMPLETED|01:00:01|cpu=4,mem=8G,node=1|1|4|00:00:00|04:00:04||1000K||0",
        ])
        .unwrap();
        assert!(diagnostics.is_empty());
        assert_eq!(jobs.len(), 1);

        let job = &jobs[0];
        assert_eq!(job.job_id.to_string(), "100");
        assert_eq!(job.user, SlurmUser("alice".into()));
        assert_eq!(job.job_name, "sim");
        assert_eq!(job.working_directory, "/home/alice");
        assert_eq!(job.category, ProcessorCategory::Cpu);
        assert_eq!(job.submission_time.to_string(), "2025-07-01 08:59:00");
        assert_eq!(job.state, StateCode::Completed);
        assert_eq!(job.elapsed, Duration::parse("01:00:01").unwrap());
        assert_eq!(job.cpu_usage_time, Duration::parse("04:00:04").unwrap());
        assert!((job.used_memory_gb - 2.5).abs() < ε);
        assert_eq!(job.required_memory_gb, 3.0);
        assert!((job.wasted_memory_ratio - 8.0 / 3.0).abs() < ε);
        assert!((job.measured_energy_kwh - 2.0).abs() < ε);
        assert_eq!(job.gpu_hours, 0.0);
        assert!((job.cpu_hours - (4.0 + 4.0 / 3600.0)).abs() < ε);
    }

    #[test]
    fn JobAggregator__aggregate__excludes_active_jobs() {
        let (jobs, _) = aggregate(&[
            "1001|alice|grace|200|done|2025-07-01T09:00:00|FAILED|00:10:00||1|1|00:00:00|00:10:00|1G||/home|",
            "1001|alice|grace|201|busy|2025-07-01T09:00:00|COMPLETED|00:10:00||1|1|00:00:00|00:10:00|1G||/home|",
            "||grace|201.0|step|2025-07-01T09:00:00|RUNNING|00:10:00||1|1|00:00:00|00:10:00|||/home|",
            "1001|alice|grace|202|queued|2025-07-01T09:00:00|PENDING|00:00:00||1|1|00:00:00|00:00:00|1G||/home|",
        ])
        .unwrap();
        assert_eq!(jobs.iter().map(|j| j.job_id.to_string()).collect_vec(), ["200"]);
        assert_eq!(jobs[0].state, StateCode::Failed);
        // no MaxRSS anywhere: the request is carried forward as usage
        assert_eq!(jobs[0].used_memory_gb, 1.0);
    }

    #[test]
    fn JobAggregator__aggregate__gpu_job() {
        let (jobs, _) = aggregate(&[
            "1001|alice|workq|300_1|train|2025-07-01T09:00:00|COMPLETED|00:30:00|cpu=8,gres/gpu=2,node=1|1|8|01:00:00|04:00:00|32G|16G|/home|",
        ])
        .unwrap();
        let job = &jobs[0];
        assert_eq!(job.job_id.array_task.as_deref(), Some("1"));
        assert_eq!(job.category, ProcessorCategory::Gpu);
        assert_eq!(job.gpus, 2);
        assert_eq!(job.gpu_usage_time, Duration::parse("01:00:00").unwrap());
        assert_eq!(job.gpu_hours, 1.0);
        assert_eq!(job.cpu_hours, 0.0);
        assert_eq!(job.node_hours, 0.5);
    }

    #[test]
    fn JobAggregator__aggregate__unknown_partition() {
        let result = aggregate(&["1001|alice|nowhere|400|x|2025-07-01T09:00:00|COMPLETED|00:10:00||1|1|00:00:00|00:10:00|1G||/home|"]);
        assert_eq!(
            result.map(|(jobs, _)| jobs),
            Err(PipelineError::UnknownPartition { job_id: "400".into(), partition: "nowhere".into() })
        );
    }

    #[test]
    fn JobAggregator__aggregate__malformed_memory() {
        let result = aggregate(&["1001|alice|grace|401|x|2025-07-01T09:00:00|COMPLETED|00:10:00||1|1|00:00:00|00:10:00|1Q||/home|"]);
        assert!(matches!(result, Err(PipelineError::MalformedField { .. })));
    }

    #[test]
    fn JobAggregator__aggregate__multiple_partitions_warning() {
        let (jobs, diagnostics) = aggregate(&[
            "1001|alice|grace,workq|500|x|2025-07-01T09:00:00|COMPLETED|00:10:00||1|1|00:00:00|00:10:00|1G||/home|",
        ])
        .unwrap();
        assert_eq!(jobs[0].partition, "grace");
        assert!(matches!(diagnostics.as_slice(), [Diagnostic::MultiplePartitions { .. }]));
    }

    #[test]
    fn JobAggregator__aggregate__old_slurm_assumes_one_gpu() {
        let config = ClusterConfig::from_yaml(EXAMPLE).unwrap();
        let normalizer = FieldNormalizer;
        let table = SacctTable::parse(
            "User|Partition|JobID|Submit|State|Elapsed|NNodes|NCPUS|TotalCPU|ReqMem\n\
             bob|workq|7|2025-07-01T09:00:00|FAILED|01:00:00|1|2|00:00|4000Mn\n",
        )
        .unwrap();
        let mut diagnostics = Diagnostics::default();
        let jobs = JobAggregator::new(&normalizer, &config).aggregate(&table, &mut diagnostics).unwrap();

        assert_eq!(jobs[0].gpus, 1);
        assert_eq!(jobs[0].gpu_hours, 1.0);
        assert_eq!(jobs[0].requested_memory_gb, 4.0);
        assert_eq!(jobs[0].cpu_usage_time, Duration::parse("02:00:00").unwrap());
        assert_eq!(diagnostics.as_slice(), [Diagnostic::MissingAllocTres]);
    }

    #[test]
    fn check_single_user__rejects_many() {
        let (mut jobs, _) = aggregate(&[
            "1001|alice|grace|600|x|2025-07-01T09:00:00|COMPLETED|00:10:00||1|1|00:00:00|00:10:00|1G||/home|",
            "1002|bob|grace|601|x|2025-07-01T09:00:00|COMPLETED|00:10:00||1|1|00:00:00|00:10:00|1G||/home|",
        ])
        .unwrap();
        assert!(matches!(check_single_user(&jobs), Err(PipelineError::MultipleUsers { users }) if users.len() == 2));

        jobs = filter_job_ids(jobs, &["600".to_string()]);
        assert_eq!(jobs.len(), 1);
        assert!(check_single_user(&jobs).is_ok());
    }
}
