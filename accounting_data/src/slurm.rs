use std::{
    io,
    ops::Range,
    path::{Path, PathBuf},
    process::Command,
};

use chrono::{DateTime, Local};
use derive_builder::Builder;
use derive_more::derive::{Deref, Into};
use itertools::Itertools as _;
use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::record::{JobState, ACCOUNTING_FIELDS};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref, Into, Serialize)]
pub struct SlurmUser(pub String);

/// Local wall-clock time without offset, the only form `--starttime`/`--endtime` accept.
pub fn format_datetime_for_slurm(date: DateTime<Local>) -> String {
    date.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// One `sacct` invocation: finished jobs on `hostname` inside `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct SacctQuery {
    pub hostname: String,
    #[builder(default = "Local::now() - chrono::Duration::hours(1)")]
    pub start: DateTime<Local>,
    #[builder(default = "Local::now()")]
    pub end: DateTime<Local>,
    #[builder(default = "JobState::TERMINAL.to_vec()")]
    pub states: Vec<JobState>,
}

impl SacctQueryBuilder {
    fn validate(&self) -> Result<(), String> {
        match &self.hostname {
            Some(host) if host.trim().is_empty() => return Err("hostname must not be empty".to_owned()),
            _ => {}
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start >= end {
                return Err(format!("empty time window: {start} >= {end}"));
            }
        }
        Ok(())
    }
}

impl SacctQuery {
    pub fn for_window(hostname: impl Into<String>, window: Range<DateTime<Local>>) -> Result<Self, SacctQueryBuilderError> {
        SacctQueryBuilder::default().hostname(hostname).start(window.start).end(window.end).build()
    }

    pub fn to_args(&self) -> Vec<String> {
        vec![
            format!("--nodelist={}", self.hostname),
            format!("--format={}", ACCOUNTING_FIELDS.join(",")),
            format!("--state={}", self.states.iter().map(JobState::as_str).join(",")),
            format!("--starttime={}", format_datetime_for_slurm(self.start)),
            format!("--endtime={}", format_datetime_for_slurm(self.end)),
            // ReqTRES memory in mebibytes
            "--units=M".to_owned(),
            "--allusers".to_owned(),
            // sep by `|` without trailing `|`, header first
            "--parsable2".to_owned(),
        ]
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not execute `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` failed with status {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("`{program}` produced no output")]
    EmptyOutput { program: String },
}

/// Captured result of running the accounting query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SacctOutput {
    pub program: String,
    pub stdout: String,
    pub stderr: String,
    /// `None` when killed by a signal
    pub exit_code: Option<i32>,
}

/// Where accounting text comes from. [`Sacct`] is the real thing, closures are handy in tests.
pub trait AccountingSource {
    fn fetch(&self, query: &SacctQuery) -> Result<SacctOutput, FetchError>;
}

impl<F> AccountingSource for F
where
    F: Fn(&SacctQuery) -> Result<SacctOutput, FetchError>,
{
    fn fetch(&self, query: &SacctQuery) -> Result<SacctOutput, FetchError> {
        self(query)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sacct {
    program: PathBuf,
}

impl Sacct {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Sacct {
            program: program.as_ref().to_owned(),
        }
    }
}

impl Default for Sacct {
    fn default() -> Self {
        Sacct::new("sacct")
    }
}

impl AccountingSource for Sacct {
    fn fetch(&self, query: &SacctQuery) -> Result<SacctOutput, FetchError> {
        let program = self.program.display().to_string();
        let args = query.to_args();
        debug!("running {program} {}", args.join(" "));

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| FetchError::Spawn {
                program: program.clone(),
                source,
            })?;

        Ok(SacctOutput {
            program,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// Runs `query` against `source` and hands back its output once it is known to be usable.
///
/// A non-zero (or missing) exit status and an empty stdout both count as failure, so nothing gets
/// ingested for the window. On success `exit_code` is always `Some(0)`.
pub fn fetch_window(source: &impl AccountingSource, query: &SacctQuery) -> Result<SacctOutput, FetchError> {
    let output = source.fetch(query)?;

    if output.exit_code != Some(0) {
        return Err(FetchError::Failed {
            program: output.program,
            code: output.exit_code,
            stderr: output.stderr,
        });
    }
    if output.stdout.trim().is_empty() {
        return Err(FetchError::EmptyOutput { program: output.program });
    }
    debug!(
        "{} exited with {:?}, {} lines",
        output.program,
        output.exit_code,
        output.stdout.lines().count()
    );
    Ok(output)
}
