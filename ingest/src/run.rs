use std::{
    fmt, fs,
    io::{self, Write as _},
    ops::Range,
    path::{Path, PathBuf},
};

use accounting_data::{
    fetch_window, parse_sacct_output, slurm::format_datetime_for_slurm, AccountingSource, JobAccountingRecord, RowError,
    SacctQuery,
};
use chrono::{DateTime, Local};
use color_eyre::{
    eyre::{eyre, Context as _},
    Result,
};
use database::{commit_window, HostStore};
use log::{debug, info, warn};
use sysinfo::{System, SystemExt as _};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetching,
    Parsing,
    Committing,
    Cleanup,
    Done,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Fetching => "FETCHING",
            Phase::Parsing => "PARSING",
            Phase::Committing => "COMMITTING",
            Phase::Cleanup => "CLEANUP",
            Phase::Done => "DONE",
            Phase::Aborted => "ABORTED",
        })
    }
}

fn enter(host: &str, phase: Phase) {
    debug!("[{host}] {phase}");
}

/// Explicit host name wins, otherwise the one of the machine we run on.
pub fn resolve_host(explicit: Option<String>) -> Result<String> {
    match explicit.map(|host| host.trim().to_owned()) {
        Some(host) if !host.is_empty() => Ok(host),
        Some(_) => Err(eyre!("hostname argument is empty")),
        None => System::new()
            .host_name()
            .ok_or_else(|| eyre!("could not determine the local host name")),
    }
}

/// Raw `sacct` output of one run. Removed when dropped, whatever happened in between.
#[derive(Debug)]
pub struct SpoolFile {
    path: PathBuf,
}

impl SpoolFile {
    /// `<dir>/<hostname>_<unix seconds>.out`
    pub fn path_for(dir: &Path, hostname: &str, at: DateTime<Local>) -> PathBuf {
        dir.join(format!("{hostname}_{}.out", at.timestamp()))
    }

    pub fn create(path: PathBuf, contents: &str) -> io::Result<Self> {
        Self::create_with(path, |file| file.write_all(contents.as_bytes()))
    }

    /// The guard owns the file before the first byte is written, a failed write removes it again.
    fn create_with(path: PathBuf, write: impl FnOnce(&mut fs::File) -> io::Result<()>) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = fs::File::create(&path)?;
        let spool = SpoolFile { path };
        write(&mut file)?;
        Ok(spool)
    }

    pub fn read(&self) -> io::Result<String> {
        fs::read_to_string(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("removed {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove {:?}: {e}", self.path),
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub host: String,
    pub window: Range<DateTime<Local>>,
    pub rows: usize,
    pub job_steps: usize,
    pub parsed: usize,
    pub dropped: Vec<RowError>,
    pub committed: usize,
    pub commit_failures: usize,
    pub cpu_hours: f64,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{host} {start}..{end}: {rows} rows, {steps} job steps skipped, {parsed} parsed, {dropped} dropped, \
             {committed} committed, {failed} failed to commit, {cpu_hours:.2} cpu hours",
            host = self.host,
            start = format_datetime_for_slurm(self.window.start),
            end = format_datetime_for_slurm(self.window.end),
            rows = self.rows,
            steps = self.job_steps,
            parsed = self.parsed,
            dropped = self.dropped.len(),
            committed = self.committed,
            failed = self.commit_failures,
            cpu_hours = self.cpu_hours,
        )
    }
}

/// One ingestion run: FETCHING → PARSING → COMMITTING → CLEANUP → DONE.
///
/// Only a failed fetch ends the run early (ABORTED), before anything is written. Row and commit
/// failures are counted in the report.
pub fn ingest_window(
    host: &str,
    window: Range<DateTime<Local>>,
    source: &impl AccountingSource,
    store: &HostStore,
    spool_dir: &Path,
) -> Result<RunReport> {
    let query = SacctQuery::for_window(host, window.clone()).wrap_err("building sacct query")?;

    enter(host, Phase::Fetching);
    let output = match fetch_window(source, &query) {
        Ok(output) => output,
        Err(e) => {
            enter(host, Phase::Aborted);
            return Err(e).wrap_err_with(|| format!("fetching accounting data for {host}"));
        }
    };

    let spool = match SpoolFile::create(SpoolFile::path_for(spool_dir, host, Local::now()), &output.stdout) {
        Ok(spool) => {
            debug!("raw output in {:?}", spool.path());
            Some(spool)
        }
        Err(e) => {
            warn!("could not write raw output to {spool_dir:?}: {e}");
            None
        }
    };

    enter(host, Phase::Parsing);
    // parse what was spooled, the fetched text only stands in when spooling failed
    let text = match spool.as_ref().map(SpoolFile::read) {
        Some(Ok(spooled)) => spooled,
        Some(Err(e)) => {
            warn!("could not read back raw output: {e}");
            output.stdout
        }
        None => output.stdout,
    };
    let batch = parse_sacct_output(&text);
    let cpu_hours: f64 = batch.records.iter().map(JobAccountingRecord::cpu_hours).sum();

    enter(host, Phase::Committing);
    let summary = commit_window(store, &batch.records);

    enter(host, Phase::Cleanup);
    drop(spool);

    let report = RunReport {
        host: host.to_owned(),
        window,
        rows: batch.rows(),
        job_steps: batch.job_steps,
        parsed: batch.records.len(),
        dropped: batch.errors,
        committed: summary.committed,
        commit_failures: summary.failures.len(),
        cpu_hours,
    };
    enter(host, Phase::Done);
    info!("{report}");
    Ok(report)
}
