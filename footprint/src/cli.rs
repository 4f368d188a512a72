use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use footprint_data::config::DEFAULT_CONFIG_FILE;
use tracing::Level;

/// Estimates the energy use and carbon footprint (scope 2 and 3) of your Slurm jobs.
#[derive(Debug, Clone, PartialEq, Parser)]
#[command(version)]
pub struct Args {
    /// TRACE, DEBUG, INFO, WARN or ERROR
    #[arg(long, global = true)]
    pub log_level: Option<Level>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Command {
    /// Write a cluster configuration template to fill in
    Configure {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
    },
    /// Estimate the footprint of the jobs in a date range
    Run(RunArgs),
}

#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct RunArgs {
    /// First day, YYYY-MM-DD. Default: January 1st of this year
    #[arg(long)]
    pub start_date: Option<NaiveDate>,
    /// Last day, YYYY-MM-DD. Default: today
    #[arg(long)]
    pub end_date: Option<NaiveDate>,
    /// Only these job ids, comma separated
    #[arg(long, value_delimiter = ',')]
    pub job_ids: Option<Vec<String>>,
    /// `UK_average` or a region name such as "South West England"
    #[arg(long)]
    pub region: Option<String>,
    /// Isambard3, IsambardAI, Archer2, no_scope3 or gCO2e per node-hour
    #[arg(long)]
    pub scope3: Option<String>,
    /// no_save, full, daily, total, full_summary, daily_summary, total_summary or all
    #[arg(long)]
    pub export: Option<String>,
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    #[arg(long)]
    pub cluster_config: Option<PathBuf>,
}

#[allow(non_snake_case)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn Args__parse_run() {
        let args = Args::try_parse_from([
            "footprint",
            "run",
            "--start-date",
            "2025-01-01",
            "--job-ids",
            "12,13",
            "--region",
            "South West England",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(args.log_level, Some(Level::DEBUG));
        let Command::Run(run) = args.command else {
            panic!("expected the run subcommand");
        };
        assert_eq!(run.start_date, NaiveDate::from_ymd_opt(2025, 1, 1));
        assert_eq!(run.end_date, None);
        assert_eq!(run.job_ids, Some(vec!["12".to_string(), "13".to_string()]));
        assert_eq!(run.region.as_deref(), Some("South West England"));
    }

    #[test]
    fn Args__parse_configure() {
        let args = Args::try_parse_from(["footprint", "configure"]).unwrap();
        assert_eq!(args.command, Command::Configure { path: PathBuf::from(DEFAULT_CONFIG_FILE) });
        assert!(Args::try_parse_from(["footprint", "run", "--start-date", "01/01/2025"]).is_err());
    }
}
