//! TDP based energy model.

use derive_more::derive::AddAssign;
use serde::Serialize;

use crate::{
    config::{ClusterConfig, PartitionSpec},
    job::{JobRecord, PipelineError},
    normalize::StateCode,
};

/// W per GB of DRAM, average of published measurements
pub const MEMORY_POWER_W_PER_GB: f64 = 0.3725;

/// Energy of one job, all in kWh.
#[derive(Debug, Clone, Copy, Default, PartialEq, AddAssign, Serialize)]
pub struct EnergyEstimate {
    pub cpu_kwh: f64,
    pub gpu_kwh: f64,
    pub memory_kwh: f64,
    /// compute only, what an energy counter on the node would see
    pub total_no_pue_kwh: f64,
    /// facility level
    pub total_kwh: f64,
    /// memory term with the required instead of the requested memory
    pub required_memory_kwh: f64,
    /// facility level total with `required_memory_kwh` as the memory term
    pub total_required_memory_kwh: f64,
    /// `total_kwh` if the job failed, 0 otherwise
    pub failed_kwh: f64,
}

/// usage (h) × power (W) → kWh
fn kwh(hours: f64, watts: f64) -> f64 {
    hours * watts / 1000.0
}

pub fn memory_kwh(elapsed_hours: f64, memory_gb: f64) -> f64 {
    kwh(elapsed_hours, memory_gb * MEMORY_POWER_W_PER_GB)
}

#[derive(Debug, Clone, Copy)]
pub struct EnergyEstimator<'a> {
    config: &'a ClusterConfig,
}

impl<'a> EnergyEstimator<'a> {
    pub fn new(config: &'a ClusterConfig) -> Self {
        Self { config }
    }

    pub fn estimate(&self, job: &JobRecord) -> Result<EnergyEstimate, PipelineError> {
        let partition = self.config.partition(&job.partition).ok_or_else(|| PipelineError::UnknownPartition {
            job_id: job.job_id.to_string(),
            partition: job.partition.clone(),
        })?;
        Ok(Self::estimate_with(partition, self.config.pue, job))
    }

    pub fn estimate_with(partition: &PartitionSpec, pue: f64, job: &JobRecord) -> EnergyEstimate {
        let elapsed_hours = job.elapsed.as_hours();

        let cpu_kwh = kwh(job.cpu_usage_time.as_hours(), partition.cpu_power_w());
        let gpu_kwh = kwh(job.gpu_usage_time.as_hours(), partition.gpu_power_w());
        let required_memory_kwh = memory_kwh(elapsed_hours, job.required_memory_gb);
        let memory_kwh = memory_kwh(elapsed_hours, job.requested_memory_gb);

        let total_no_pue_kwh = cpu_kwh + gpu_kwh + memory_kwh;
        let total_kwh = total_no_pue_kwh * pue;

        EnergyEstimate {
            cpu_kwh,
            gpu_kwh,
            memory_kwh,
            total_no_pue_kwh,
            total_kwh,
            required_memory_kwh,
            total_required_memory_kwh: (cpu_kwh + gpu_kwh + required_memory_kwh) * pue,
            failed_kwh: if job.state == StateCode::Failed { total_kwh } else { 0.0 },
        }
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
pub(crate) mod test {
    use chrono::NaiveDate;

    use super::*;
    use crate::{
        config::{test::EXAMPLE, ProcessorCategory},
        misc::parsing::Duration,
        normalize::JobId,
        slurm::SlurmUser,
    };

    const ε: f64 = 0.0000000001;

    pub(crate) fn job(partition: &str, category: ProcessorCategory, elapsed: &str, cpus: u32, gpus: u32) -> JobRecord {
        let elapsed = Duration::parse(elapsed).unwrap();
        let cpu_usage_time = elapsed.times(cpus);
        let gpu_usage_time = match category {
            ProcessorCategory::Cpu => Duration::default(),
            ProcessorCategory::Gpu => elapsed.times(gpus),
        };
        JobRecord {
            job_id: JobId { main: "1".into(), array_task: None },
            uid: None,
            user: SlurmUser("alice".into()),
            job_name: "test".into(),
            working_directory: "/home".into(),
            partition: partition.into(),
            category,
            submission_time: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap().and_hms_opt(9, 0, 0).unwrap(),
            state: StateCode::Completed,
            elapsed,
            nodes: 1,
            cpus,
            gpus,
            actual_cpu_time: cpu_usage_time,
            cpu_wall_time: cpu_usage_time,
            cpu_usage_time,
            gpu_usage_time,
            requested_memory_gb: 10.0,
            used_memory_gb: 4.0,
            required_memory_gb: 5.0,
            wasted_memory_ratio: 2.0,
            node_hours: elapsed.as_hours(),
            cpu_hours: 0.0,
            gpu_hours: 0.0,
            measured_energy_kwh: 0.0,
        }
    }

    #[test]
    fn EnergyEstimator__estimate__cpu() {
        let config = ClusterConfig::from_yaml(EXAMPLE).unwrap();
        let estimate = EnergyEstimator::new(&config)
            .estimate(&job("grace", ProcessorCategory::Cpu, "01:00:00", 4, 0))
            .unwrap();

        // 4 core-hours at 3.5 W
        assert!((estimate.cpu_kwh - 0.014).abs() < ε);
        assert_eq!(estimate.gpu_kwh, 0.0);
        // 1 h × 10 GB × 0.3725 W/GB
        assert!((estimate.memory_kwh - 0.003725).abs() < ε);
        assert!((estimate.total_no_pue_kwh - 0.017725).abs() < ε);
        assert!((estimate.total_kwh - 0.017725 * 1.1).abs() < ε);
        assert!((estimate.required_memory_kwh - 0.0018625).abs() < ε);
        assert!((estimate.total_required_memory_kwh - (0.014 + 0.0018625) * 1.1).abs() < ε);
        assert_eq!(estimate.failed_kwh, 0.0);
    }

    #[test]
    fn EnergyEstimator__estimate__gpu() {
        let config = ClusterConfig::from_yaml(EXAMPLE).unwrap();
        let mut record = job("workq", ProcessorCategory::Gpu, "00:30:00", 2, 1);
        record.state = StateCode::Failed;
        let estimate = EnergyEstimator::new(&config).estimate(&record).unwrap();

        // supporting CPUs: 1 core-hour at 3.5 W, GPU: 0.5 h at 700 W
        assert!((estimate.cpu_kwh - 0.0035).abs() < ε);
        assert!((estimate.gpu_kwh - 0.35).abs() < ε);
        assert!(estimate.failed_kwh > 0.0);
        assert_eq!(estimate.failed_kwh, estimate.total_kwh);
    }

    #[test]
    fn EnergyEstimator__estimate__unknown_partition() {
        let config = ClusterConfig::from_yaml(EXAMPLE).unwrap();
        let result = EnergyEstimator::new(&config).estimate(&job("gone", ProcessorCategory::Cpu, "01:00:00", 1, 0));
        assert_eq!(result, Err(PipelineError::UnknownPartition { job_id: "1".into(), partition: "gone".into() }));
    }
}
