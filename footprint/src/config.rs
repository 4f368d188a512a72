use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use footprint_data::config::DEFAULT_CONFIG_FILE;
use serde::Deserialize;

const DEFAULT_SETTINGS_FILE: &str = "footprint";
const DEFAULT_REGION: &str = "UK_average";
const DEFAULT_SCOPE3: &str = "no_scope3";
const DEFAULT_EXPORT: &str = "no_save";
const DEFAULT_OUTPUT_DIR: &str = ".";
const DEFAULT_ORACLE_TIMEOUT_SECS: u64 = 10;

/// Defaults for `run`, overridden by `footprint.toml`, then by `FOOTPRINT_*` variables, then by
/// command line flags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub cluster_config: PathBuf,
    pub region: String,
    pub scope3: String,
    pub export: String,
    pub output_dir: PathBuf,
    pub oracle_timeout_secs: u64,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file(DEFAULT_SETTINGS_FILE)
    }

    pub fn from_file(name: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("cluster_config", DEFAULT_CONFIG_FILE)?
            .set_default("region", DEFAULT_REGION)?
            .set_default("scope3", DEFAULT_SCOPE3)?
            .set_default("export", DEFAULT_EXPORT)?
            .set_default("output_dir", DEFAULT_OUTPUT_DIR)?
            .set_default("oracle_timeout_secs", DEFAULT_ORACLE_TIMEOUT_SECS)?
            .add_source(File::with_name(name).required(false))
            .add_source(Environment::with_prefix("footprint"))
            .build()?;

        builder.try_deserialize()
    }
}
