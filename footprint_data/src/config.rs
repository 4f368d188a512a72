//! Cluster hardware description (`hpc_config.yaml`).
//!
//! The document is read into a loosely typed [`RawClusterConfig`] and then checked once into a
//! [`ClusterConfig`], so that nothing deep inside the energy model has to deal with missing keys.

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write as _},
    path::Path,
};

use color_eyre::{eyre::WrapErr as _, Result};
use derive_more::derive::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

pub const DEFAULT_CONFIG_FILE: &str = "hpc_config.yaml";
/// GBP per kWh, UK price cap July 2025
pub const DEFAULT_ELECTRICITY_COST: f64 = 0.2573;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("cluster configuration is not valid YAML: {0}")]
    Parse(String),
    #[error("cluster configuration lists no partitions")]
    NoPartitions,
    #[error("partition `{partition}`: unknown processor `{processor}` (expected CPU or GPU)")]
    UnknownProcessor { partition: String, processor: String },
    #[error("partition `{0}` is a GPU partition and needs `CPU_TDP` for its supporting CPUs")]
    MissingCpuTdp(String),
    #[error("partition `{partition}`: `{key}` must be a finite, non-negative number (got {value})")]
    InvalidPower { partition: String, key: &'static str, value: f64 },
    #[error("`PUE` must be a positive number (got {0})")]
    InvalidPue(f64),
    #[error("`electricity_cost` must be non-negative (got {0})")]
    InvalidElectricityCost(f64),
    #[error("invalid scope 3 selector `{0}`: use a positive number or one of Isambard3, IsambardAI, Archer2, no_scope3")]
    UnknownScope3(String),
    #[error("invalid region name `{0}`")]
    UnknownRegion(String),
    #[error("invalid export mode `{0}`: use one of no_save, full, daily, total, full_summary, daily_summary, total_summary, all")]
    UnknownExportMode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum ProcessorCategory {
    #[serde(rename = "CPU")]
    #[display("CPU")]
    Cpu,
    #[serde(rename = "GPU")]
    #[display("GPU")]
    Gpu,
}

impl ProcessorCategory {
    fn parse(partition: &str, raw: &str) -> Result<Self, ConfigError> {
        match raw.trim() {
            "CPU" => Ok(Self::Cpu),
            "GPU" => Ok(Self::Gpu),
            other => Err(ConfigError::UnknownProcessor { partition: partition.to_owned(), processor: other.to_owned() }),
        }
    }
}

/// Power figures of one partition, in W.
///
/// For a CPU partition `tdp` is per core and `cpu_tdp` is unused. For a GPU partition `tdp` is per
/// GPU and `cpu_tdp` is per core of the supporting CPUs.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSpec {
    pub processor: ProcessorCategory,
    pub processor_name: Option<String>,
    pub tdp: f64,
    pub cpu_name: Option<String>,
    pub cpu_tdp: Option<f64>,
}

impl PartitionSpec {
    /// CPU per-core power draw
    pub fn cpu_power_w(&self) -> f64 {
        match self.processor {
            ProcessorCategory::Cpu => self.tdp,
            ProcessorCategory::Gpu => self.cpu_tdp.unwrap_or_default(),
        }
    }

    /// Per-GPU power draw, 0 on CPU partitions
    pub fn gpu_power_w(&self) -> f64 {
        match self.processor {
            ProcessorCategory::Cpu => 0.0,
            ProcessorCategory::Gpu => self.tdp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    pub hpc_system: String,
    pub partitions: HashMap<String, PartitionSpec>,
    pub pue: f64,
    pub electricity_cost: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPartition {
    pub processor: String,
    #[serde(default)]
    pub processor_name: Option<String>,
    #[serde(rename = "TDP")]
    pub tdp: f64,
    #[serde(rename = "CPU_name", default)]
    pub cpu_name: Option<String>,
    #[serde(rename = "CPU_TDP", default)]
    pub cpu_tdp: Option<f64>,
}

/// `hpc_config.yaml` as written by the user
#[derive(Debug, Clone, Deserialize)]
pub struct RawClusterConfig {
    pub hpc_system: String,
    pub partitions: HashMap<String, RawPartition>,
    #[serde(rename = "PUE")]
    pub pue: f64,
    #[serde(default)]
    pub electricity_cost: Option<f64>,
}

fn check_power(partition: &str, key: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidPower { partition: partition.to_owned(), key, value })
    }
}

impl TryFrom<RawClusterConfig> for ClusterConfig {
    type Error = ConfigError;

    fn try_from(raw: RawClusterConfig) -> Result<Self, Self::Error> {
        if raw.partitions.is_empty() {
            return Err(ConfigError::NoPartitions);
        }
        if !(raw.pue.is_finite() && raw.pue > 0.0) {
            return Err(ConfigError::InvalidPue(raw.pue));
        }
        let electricity_cost = raw.electricity_cost.unwrap_or(DEFAULT_ELECTRICITY_COST);
        if !(electricity_cost.is_finite() && electricity_cost >= 0.0) {
            return Err(ConfigError::InvalidElectricityCost(electricity_cost));
        }

        let partitions = raw
            .partitions
            .into_iter()
            .map(|(name, partition)| {
                let processor = ProcessorCategory::parse(&name, &partition.processor)?;
                let tdp = check_power(&name, "TDP", partition.tdp)?;
                let cpu_tdp = partition.cpu_tdp.map(|tdp| check_power(&name, "CPU_TDP", tdp)).transpose()?;
                if processor == ProcessorCategory::Gpu && cpu_tdp.is_none() {
                    return Err(ConfigError::MissingCpuTdp(name));
                }
                let spec = PartitionSpec {
                    processor,
                    processor_name: partition.processor_name,
                    tdp,
                    cpu_name: partition.cpu_name,
                    cpu_tdp,
                };
                Ok((name, spec))
            })
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        Ok(ClusterConfig { hpc_system: raw.hpc_system, partitions, pue: raw.pue, electricity_cost })
    }
}

impl ClusterConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let raw: RawClusterConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        raw.try_into()
    }

    #[instrument]
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading cluster configuration");
        let yaml = fs::read_to_string(path).wrap_err_with(|| format!("reading {path:?}"))?;
        Self::from_yaml(&yaml).wrap_err_with(|| format!("checking {path:?}"))
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionSpec> {
        self.partitions.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateOutcome {
    Written,
    AlreadyExists,
}

/// Writes [`CONFIG_TEMPLATE`] to `path` unless something is already there.
pub fn write_config_template(path: &Path) -> Result<TemplateOutcome> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(TemplateOutcome::AlreadyExists),
        Err(e) => return Err(e).wrap_err_with(|| format!("creating {path:?}")),
    };
    file.write_all(CONFIG_TEMPLATE.as_bytes()).wrap_err_with(|| format!("writing {path:?}"))?;
    Ok(TemplateOutcome::Written)
}

pub const CONFIG_TEMPLATE: &str = r#"# Cluster hardware description used to estimate energy use.
# Replace every value in < > with the figures for your system and remove the brackets.
---
# name of the system, only used for display
hpc_system: "<HPC System Name>"

partitions:
    # CPU partition
    <Partition1_Name>:
        processor: CPU
        processor_name: "<NVIDIA Grace CPU>"
        TDP: <5>                # W per core

    # GPU partition
    <Partition2_Name>:
        processor: GPU
        processor_name: "<NVIDIA H100 GPU>"
        TDP: <500>              # W per GPU
        # supporting CPUs, required for GPU partitions
        CPU_name: "<NVIDIA Grace CPU>"
        CPU_TDP: <5>            # W per core

# power usage effectiveness of the data centre
PUE: <1.1>

# price of electricity per kWh (GBP)
electricity_cost: 0.2573

# Some TDP values:
#   NVIDIA Grace CPU: ~3.472 W per core (250 W / 72 cores)
#   NVIDIA H100 GPU:  ~700 W per GPU (max)
"#;
