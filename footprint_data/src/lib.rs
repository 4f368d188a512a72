//! Energy use and carbon footprint of a user's Slurm jobs.
//!
//! The pipeline pulls the accounting records of a date range, folds job steps into jobs, estimates
//! their energy from the partition hardware and turns that into scope 2 and scope 3 emissions.

pub mod carbon_intensity;
pub mod config;
pub mod diagnostics;
pub mod emissions;
pub mod energy;
pub mod export;
pub mod job;
pub mod misc;
pub mod normalize;
pub mod pipeline;
pub mod rollup;
pub mod slurm;

pub use pipeline::{run_pipeline, Report, RunOptions, RunOptionsBuilder, RunOutcome};
