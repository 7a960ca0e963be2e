use std::{env, ops::Range, path::PathBuf};

use accounting_data::misc::parsing::Duration;
use chrono::{DateTime, Local};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

const DEFAULT_DATABASE_DIR: &str = "data/job_details";
const DEFAULT_SPOOL_DIR: &str = "data/job_details/temp";
const DEFAULT_TABLE_NAME: &str = database::DEFAULT_TABLE;
const DEFAULT_SACCT_PROGRAM: &str = "sacct";
// meant to be triggered hourly
const DEFAULT_WINDOW: &str = "1h";
const DEFAULT_BUSY_TIMEOUT: &str = "5s";

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub database_dir: PathBuf,
    /// raw `sacct` output lands here for the duration of a run
    pub spool_dir: PathBuf,
    pub table_name: String,
    pub sacct_program: PathBuf,
    pub window: Duration,
    pub busy_timeout: Duration,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "default".into());

        let builder = Config::builder()
            .set_default("database_dir", DEFAULT_DATABASE_DIR)?
            .set_default("spool_dir", DEFAULT_SPOOL_DIR)?
            .set_default("table_name", DEFAULT_TABLE_NAME)?
            .set_default("sacct_program", DEFAULT_SACCT_PROGRAM)?
            .set_default("window", DEFAULT_WINDOW)?
            .set_default("busy_timeout", DEFAULT_BUSY_TIMEOUT)?
            .add_source(File::with_name("config/ingest").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("ingest"))
            .build()?;

        builder.try_deserialize()
    }

    /// `[end - window, end)`
    pub fn window_ending(&self, end: DateTime<Local>) -> Range<DateTime<Local>> {
        end - *self.window..end
    }
}
