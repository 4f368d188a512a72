//! Scope 2 and scope 3 emissions, cost and everyday equivalents per job.

use std::{fmt, str::FromStr};

use derive_more::derive::AddAssign;
use serde::Serialize;

use crate::{config::ConfigError, energy::EnergyEstimate, job::JobRecord};

/// gCO2e per mile, average UK car (2023)
pub const DRIVING_G_PER_MILE: f64 = 211.2;
/// gCO2e absorbed by a mature tree in a month
pub const TREE_G_PER_MONTH: f64 = 833.0;
/// kWh, average daily UK household electricity use
pub const HOUSEHOLD_KWH_PER_DAY: f64 = 7.397;
/// gCO2e of one household day at the UK average intensity
pub const HOUSEHOLD_G_PER_DAY: f64 = HOUSEHOLD_KWH_PER_DAY * crate::carbon_intensity::UK_AVERAGE_INTENSITY;
/// gCO2e per passenger, one way Bristol to Paris
pub const FLIGHT_G: f64 = 141_700.0;

/// Embodied emissions per node-hour
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Scope3Factor {
    #[default]
    None,
    Isambard3,
    IsambardAI,
    Archer2,
    Custom(f64),
}

impl Scope3Factor {
    /// gCO2e per node-hour, `None` for no scope 3 at all
    pub fn per_node_hour(self) -> Option<f64> {
        match self {
            Scope3Factor::None => None,
            Scope3Factor::Isambard3 => Some(43.0),
            Scope3Factor::IsambardAI => Some(114.0),
            Scope3Factor::Archer2 => Some(23.0),
            Scope3Factor::Custom(factor) => Some(factor),
        }
    }

    pub fn scope3_g(self, node_hours: f64) -> f64 {
        match self.per_node_hour() {
            None => 0.0,
            Some(factor) => node_hours * factor,
        }
    }
}

impl FromStr for Scope3Factor {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "no_scope3" => Ok(Self::None),
            "Isambard3" => Ok(Self::Isambard3),
            "IsambardAI" => Ok(Self::IsambardAI),
            "Archer2" => Ok(Self::Archer2),
            other => match other.parse::<f64>() {
                Ok(factor) if factor.is_finite() && factor > 0.0 => Ok(Self::Custom(factor)),
                _ => Err(ConfigError::UnknownScope3(other.to_owned())),
            },
        }
    }
}

impl fmt::Display for Scope3Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope3Factor::None => f.write_str("no_scope3"),
            Scope3Factor::Isambard3 => f.write_str("Isambard3"),
            Scope3Factor::IsambardAI => f.write_str("IsambardAI"),
            Scope3Factor::Archer2 => f.write_str("Archer2"),
            Scope3Factor::Custom(factor) => write!(f, "{factor}"),
        }
    }
}

/// Everyday comparisons for an amount of gCO2e.
#[derive(Debug, Clone, Copy, Default, PartialEq, AddAssign, Serialize)]
pub struct Equivalents {
    pub driving_miles: f64,
    pub tree_months: f64,
    pub household_days: f64,
    pub flights: f64,
}

impl Equivalents {
    pub fn of(emissions_g: f64) -> Self {
        Self {
            driving_miles: emissions_g / DRIVING_G_PER_MILE,
            tree_months: emissions_g / TREE_G_PER_MONTH,
            household_days: emissions_g / HOUSEHOLD_G_PER_DAY,
            flights: emissions_g / FLIGHT_G,
        }
    }
}

/// Emissions of one job. Everything in gCO2e except where the name says otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, AddAssign, Serialize)]
pub struct EmissionsResult {
    pub carbon_intensity: f64,
    /// counter reading with the facility overhead, if the cluster has counters
    pub measured_energy_kwh: f64,
    pub scope2: f64,
    pub scope2_measured: f64,
    pub scope2_required_memory: f64,
    pub scope2_failed: f64,
    pub scope3: f64,
    pub total: f64,
    pub cost: f64,
    pub equivalents: Equivalents,
}

/// Run wide inputs of the emissions model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmissionsEngine {
    pub scope3: Scope3Factor,
    pub pue: f64,
    pub electricity_cost: f64,
    /// whether any job of the run has a positive energy counter reading
    pub counters_present: bool,
}

impl EmissionsEngine {
    pub fn new(scope3: Scope3Factor, pue: f64, electricity_cost: f64, jobs: &[JobRecord]) -> Self {
        Self { scope3, pue, electricity_cost, counters_present: counters_present(jobs) }
    }

    /// Counter readings already reflect what the node drew, so the overhead is applied on top. If
    /// nothing in the run was measured there is nothing to correct.
    pub fn measured_facility_kwh(&self, job: &JobRecord) -> f64 {
        if self.counters_present {
            job.measured_energy_kwh * self.pue
        } else {
            job.measured_energy_kwh
        }
    }

    /// Energy the job is billed for. Once any job of the run has a counter reading, counters are
    /// the source for every job, taken as read from the node.
    pub fn billed_kwh(&self, job: &JobRecord, energy: &EnergyEstimate) -> f64 {
        if self.counters_present {
            job.measured_energy_kwh
        } else {
            energy.total_kwh
        }
    }

    pub fn emissions(&self, job: &JobRecord, energy: &EnergyEstimate, carbon_intensity: f64) -> EmissionsResult {
        let measured_energy_kwh = self.measured_facility_kwh(job);
        let scope2 = energy.total_kwh * carbon_intensity;
        let scope2_measured = measured_energy_kwh * carbon_intensity;
        let scope3 = self.scope3.scope3_g(job.node_hours);

        let scope2_authoritative = if self.counters_present { scope2_measured } else { scope2 };
        let total = scope2_authoritative + scope3;

        EmissionsResult {
            carbon_intensity,
            measured_energy_kwh,
            scope2,
            scope2_measured,
            scope2_required_memory: energy.total_required_memory_kwh * carbon_intensity,
            scope2_failed: energy.failed_kwh * carbon_intensity,
            scope3,
            total,
            cost: self.billed_kwh(job, energy) * self.electricity_cost,
            equivalents: Equivalents::of(total),
        }
    }
}

pub fn counters_present(jobs: &[JobRecord]) -> bool {
    jobs.iter().any(|job| job.measured_energy_kwh > 0.0)
}

/// A job with everything known about it.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedJob {
    pub job: JobRecord,
    pub energy: EnergyEstimate,
    pub emissions: EmissionsResult,
}

#[allow(non_snake_case)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::{test::EXAMPLE, ClusterConfig, ProcessorCategory},
        energy::{test::job, EnergyEstimator},
    };

    const ε: f64 = 0.0000000001;

    #[test]
    fn Scope3Factor__from_str() {
        assert_eq!("no_scope3".parse::<Scope3Factor>().unwrap(), Scope3Factor::None);
        assert_eq!("Isambard3".parse::<Scope3Factor>().unwrap().per_node_hour(), Some(43.0));
        assert_eq!("IsambardAI".parse::<Scope3Factor>().unwrap().per_node_hour(), Some(114.0));
        assert_eq!("Archer2".parse::<Scope3Factor>().unwrap().per_node_hour(), Some(23.0));
        assert_eq!("12.5".parse::<Scope3Factor>().unwrap(), Scope3Factor::Custom(12.5));

        assert_eq!("Isambard4".parse::<Scope3Factor>(), Err(ConfigError::UnknownScope3("Isambard4".into())));
        assert!("-3".parse::<Scope3Factor>().is_err());
        assert!("0".parse::<Scope3Factor>().is_err());
        assert!("NaN".parse::<Scope3Factor>().is_err());
    }

    #[test]
    fn Scope3Factor__none_is_always_zero() {
        for node_hours in [0.0, 1.0, 1e9] {
            assert_eq!(Scope3Factor::None.scope3_g(node_hours), 0.0);
        }
        assert_eq!(Scope3Factor::Isambard3.scope3_g(2.0), 86.0);
    }

    #[test]
    fn Equivalents__of() {
        let eq = Equivalents::of(141_700.0);
        assert_eq!(eq.flights, 1.0);
        assert!((eq.driving_miles - 141_700.0 / 211.2).abs() < ε);
        assert!((eq.tree_months - 141_700.0 / 833.0).abs() < ε);
        assert!((eq.household_days - 141_700.0 / (7.397 * 124.0)).abs() < ε);
        assert_eq!(Equivalents::of(0.0), Equivalents::default());
    }

    #[test]
    fn EmissionsEngine__emissions__estimated() {
        let config = ClusterConfig::from_yaml(EXAMPLE).unwrap();
        let record = job("grace", ProcessorCategory::Cpu, "01:00:00", 4, 0);
        let energy = EnergyEstimator::new(&config).estimate(&record).unwrap();
        let engine = EmissionsEngine::new(Scope3Factor::Isambard3, config.pue, config.electricity_cost, &[record.clone()]);

        let result = engine.emissions(&record, &energy, 100.0);
        assert!(!engine.counters_present);
        assert!((result.scope2 - energy.total_kwh * 100.0).abs() < ε);
        assert_eq!(result.scope2_measured, 0.0);
        assert_eq!(result.scope3, 43.0);
        assert!((result.total - (result.scope2 + 43.0)).abs() < ε);
        assert!((result.cost - energy.total_kwh * 0.25).abs() < ε);
        assert_eq!(result.scope2_failed, 0.0);
        assert!(result.scope2_required_memory < result.scope2);
    }

    #[test]
    fn EmissionsEngine__emissions__measured() {
        let config = ClusterConfig::from_yaml(EXAMPLE).unwrap();
        let mut measured = job("grace", ProcessorCategory::Cpu, "01:00:00", 4, 0);
        measured.measured_energy_kwh = 2.0;
        let unmeasured = job("grace", ProcessorCategory::Cpu, "01:00:00", 4, 0);
        let engine = EmissionsEngine::new(
            Scope3Factor::None,
            config.pue,
            config.electricity_cost,
            &[measured.clone(), unmeasured.clone()],
        );
        assert!(engine.counters_present);

        let energy = EnergyEstimator::new(&config).estimate(&measured).unwrap();
        let result = engine.emissions(&measured, &energy, 100.0);
        assert!((result.measured_energy_kwh - 2.2).abs() < ε);
        assert!((result.scope2_measured - 220.0).abs() < ε);
        assert!((result.total - 220.0).abs() < ε);
        assert!((result.cost - 2.0 * 0.25).abs() < ε);
    }

    #[test]
    fn EmissionsEngine__emissions__counters_decide_for_whole_run() {
        let config = ClusterConfig::from_yaml(EXAMPLE).unwrap();
        let mut measured = job("grace", ProcessorCategory::Cpu, "01:00:00", 4, 0);
        measured.measured_energy_kwh = 2.0;
        let unmeasured = job("grace", ProcessorCategory::Cpu, "01:00:00", 4, 0);
        let engine = EmissionsEngine::new(
            Scope3Factor::Isambard3,
            config.pue,
            config.electricity_cost,
            &[measured, unmeasured.clone()],
        );

        let energy = EnergyEstimator::new(&config).estimate(&unmeasured).unwrap();
        let result = engine.emissions(&unmeasured, &energy, 100.0);
        assert!(result.scope2 > 0.0);
        assert_eq!(result.scope2_measured, 0.0);
        assert_eq!(result.total, 43.0);
        assert_eq!(result.cost, 0.0);
    }
}
