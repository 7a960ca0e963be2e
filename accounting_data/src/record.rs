use std::{collections::HashMap, fmt, str::FromStr};

use derive_more::derive::{Deref, Display, From, Into};
use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    misc::parsing::{sacct_parsable2, slurm_duration, SlurmDurationError},
    slurm::SlurmUser,
    tres::{ResourceRequest, TresError},
};

/// Columns requested from `sacct`, in query order.
pub const ACCOUNTING_FIELDS: [&str; 12] = [
    "User", "Group", "JobID", "ReqTRES", "Timelimit", "Submit", "NodeList", "Start", "End", "Elapsed", "State",
    "ExitCode",
];

/// Scheduler-assigned job id. Slurm recycles these, so it is only unique within one host's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deref, Display, From, Into, Serialize)]
pub struct JobId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Completed,
    Cancelled,
    Failed,
    Timeout,
    OutOfMemory,
}

impl JobState {
    /// The states the accounting query filters for.
    pub const TERMINAL: [JobState; 5] = [
        JobState::Completed,
        JobState::Cancelled,
        JobState::Failed,
        JobState::Timeout,
        JobState::OutOfMemory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Completed => "COMPLETED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
            JobState::OutOfMemory => "OUT_OF_MEMORY",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{0}` is not a terminal job state")]
pub struct UnknownJobState(pub String);

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // sacct appends the uid of whoever cancelled the job
        if let Some(uid) = s.strip_prefix("CANCELLED by ") {
            if !uid.is_empty() && uid.chars().all(|c| c.is_ascii_digit()) {
                return Ok(JobState::Cancelled);
            }
        }
        JobState::TERMINAL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownJobState(s.to_owned()))
    }
}

/// One finished job as reported by `sacct`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobAccountingRecord {
    pub job_id: JobId,
    pub user_id: SlurmUser,
    pub group_id: String,
    pub node_count: u32,
    pub cpu_count: u32,
    pub gpu_count: u32,
    pub memory_mb: u64,
    pub billing_units: u64,
    /// `HH:MM:SS`, `D-HH:MM:SS` or `UNLIMITED`
    pub time_limit: String,
    pub elapsed_time: String,
    pub submit_time: String,
    pub start_time: String,
    pub end_time: String,
    /// compressed hostlist, e.g. `gpu[01-04],cpu17`
    pub node_list: String,
    pub state: JobState,
    /// `code:signal`
    pub exit_code: String,
}

impl JobAccountingRecord {
    pub fn elapsed(&self) -> chrono::Duration {
        // validated while parsing
        slurm_duration(&self.elapsed_time).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Saturates at `i64::MAX`.
    pub fn cpu_seconds(&self) -> i64 {
        self.elapsed().num_seconds().saturating_mul(i64::from(self.cpu_count))
    }

    pub fn cpu_hours(&self) -> f64 {
        self.elapsed().num_seconds() as f64 * f64::from(self.cpu_count) / 3600.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRow {
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
    #[error("row has {found} fields, header only has {expected}")]
    TooManyFields { expected: usize, found: usize },
    #[error("JobID `{0}` is not an integer")]
    InvalidJobId(String),
    #[error(transparent)]
    State(#[from] UnknownJobState),
    #[error("Elapsed: {0}")]
    Elapsed(#[from] SlurmDurationError),
    #[error("ExitCode `{0}` is not of the form code:signal")]
    InvalidExitCode(String),
}

/// Why a single row was dropped. Never fatal to the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("line {line}: malformed row: {reason}")]
    Malformed { line: usize, reason: MalformedRow },
    #[error("line {line}: job {job_id}: ReqTRES: {source}")]
    Resource {
        line: usize,
        job_id: JobId,
        #[source]
        source: TresError,
    },
}

impl RowError {
    pub fn line(&self) -> usize {
        match self {
            RowError::Malformed { line, .. } | RowError::Resource { line, .. } => *line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRow {
    Job(JobAccountingRecord),
    /// `.batch`/`.extern`/step rows, they carry no user
    JobStep,
}

impl ParsedRow {
    /// Turns one header-keyed row into a record. `line` is only used for error reporting.
    pub fn from_fields(line: usize, fields: &HashMap<String, String>) -> Result<Self, RowError> {
        let malformed = |reason: MalformedRow| RowError::Malformed { line, reason };

        let mut values = HashMap::with_capacity(ACCOUNTING_FIELDS.len());
        for name in ACCOUNTING_FIELDS {
            let value = fields.get(name).ok_or_else(|| malformed(MalformedRow::MissingField(name)))?;
            values.insert(name, value.trim());
        }
        let get = |name: &str| values.get(name).copied().unwrap_or_default();

        if get("User").is_empty() {
            return Ok(ParsedRow::JobStep);
        }

        let job_id = get("JobID")
            .parse::<u32>()
            .map(JobId)
            .map_err(|_| malformed(MalformedRow::InvalidJobId(get("JobID").to_owned())))?;
        let state = get("State").parse::<JobState>().map_err(|e| malformed(e.into()))?;
        slurm_duration(get("Elapsed")).map_err(|e| malformed(e.into()))?;
        let exit_code = get("ExitCode");
        if !is_exit_code(exit_code) {
            return Err(malformed(MalformedRow::InvalidExitCode(exit_code.to_owned())));
        }

        let resources = ResourceRequest::parse(get("ReqTRES")).map_err(|source| RowError::Resource {
            line,
            job_id,
            source,
        })?;

        Ok(ParsedRow::Job(JobAccountingRecord {
            job_id,
            user_id: SlurmUser(get("User").to_owned()),
            group_id: get("Group").to_owned(),
            node_count: resources.nodes,
            cpu_count: resources.cpus,
            gpu_count: resources.gpus,
            memory_mb: resources.memory_mb,
            billing_units: resources.billing,
            time_limit: get("Timelimit").to_owned(),
            elapsed_time: get("Elapsed").to_owned(),
            submit_time: get("Submit").to_owned(),
            start_time: get("Start").to_owned(),
            end_time: get("End").to_owned(),
            node_list: get("NodeList").to_owned(),
            state,
            exit_code: exit_code.to_owned(),
        }))
    }
}

fn is_exit_code(value: &str) -> bool {
    let is_number = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    value.split_once(':').is_some_and(|(code, signal)| is_number(code) && is_number(signal))
}

/// Everything that came out of one `sacct` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBatch {
    pub records: Vec<JobAccountingRecord>,
    pub job_steps: usize,
    pub errors: Vec<RowError>,
}

impl ParsedBatch {
    pub fn rows(&self) -> usize {
        self.records.len() + self.job_steps + self.errors.len()
    }
}

/// Parses the whole `sacct --parsable2` output. A bad row is recorded in
/// [`ParsedBatch::errors`] and parsing carries on with the next one.
pub fn parse_sacct_output(input: &str) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    let Some((header, rows)) = sacct_parsable2(input) else {
        debug!("sacct output is empty, nothing to parse");
        return batch;
    };
    debug!("sacct header: {}", header.join("|"));

    for row in rows {
        let parsed = match row.fields {
            Ok(fields) => ParsedRow::from_fields(row.line, &fields),
            Err(e) => Err(RowError::Malformed {
                line: row.line,
                reason: MalformedRow::TooManyFields {
                    expected: e.expected,
                    found: e.found,
                },
            }),
        };
        match parsed {
            Ok(ParsedRow::Job(record)) => batch.records.push(record),
            Ok(ParsedRow::JobStep) => batch.job_steps += 1,
            Err(e) => {
                warn!("dropping row: {e}");
                batch.errors.push(e);
            }
        }
    }

    batch
}

#[allow(non_snake_case)]
#[cfg(test)]
mod test {
    use color_eyre::Result;

    use super::*;

    const HEADER: &str = "User|Group|JobID|ReqTRES|Timelimit|Submit|NodeList|Start|End|Elapsed|State|ExitCode";

    fn row(user: &str, job_id: &str, tres: &str, state: &str) -> String {
        format!(
            "{user}|research|{job_id}|{tres}|01:00:00|2024-05-02T09:58:11|gpu[01-02]|2024-05-02T10:00:00|2024-05-02T10:30:00|00:30:00|{state}|0:0"
        )
    }

    fn fields(line: &str) -> HashMap<String, String> {
        HEADER.split('|').zip(line.split('|')).map(|(k, v)| (k.to_owned(), v.to_owned())).collect()
    }

    #[test]
    fn ParsedRow__from_fields__full_record() -> Result<()> {
        let line = row("alice", "4242", "billing=16,cpu=16,gres/gpu=2,mem=64000M,node=2", "COMPLETED");
        let ParsedRow::Job(record) = ParsedRow::from_fields(2, &fields(&line))? else {
            panic!("expected a job row");
        };

        assert_eq!(record.job_id, JobId(4242));
        assert_eq!(*record.user_id, "alice");
        assert_eq!(record.group_id, "research");
        assert_eq!(record.node_count, 2);
        assert_eq!(record.cpu_count, 16);
        assert_eq!(record.gpu_count, 2);
        assert_eq!(record.memory_mb, 64000);
        assert_eq!(record.billing_units, 16);
        assert_eq!(record.time_limit, "01:00:00");
        assert_eq!(record.node_list, "gpu[01-02]");
        assert_eq!(record.start_time, "2024-05-02T10:00:00");
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.exit_code, "0:0");
        assert_eq!(record.cpu_seconds(), 30 * 60 * 16);
        Ok(())
    }

    #[test]
    fn ParsedRow__from_fields__job_step() -> Result<()> {
        let line = row("", "4242", "", "COMPLETED");
        assert_eq!(ParsedRow::from_fields(3, &fields(&line))?, ParsedRow::JobStep);
        Ok(())
    }

    #[test]
    fn ParsedRow__from_fields__missing_field() {
        let mut map = fields(&row("alice", "1", "node=1,cpu=1,mem=1M,billing=1", "FAILED"));
        map.remove("NodeList");
        assert_eq!(
            ParsedRow::from_fields(5, &map),
            Err(RowError::Malformed {
                line: 5,
                reason: MalformedRow::MissingField("NodeList")
            })
        );
    }

    #[test]
    fn ParsedRow__from_fields__array_job_id_rejected() {
        let line = row("alice", "4242_7", "node=1,cpu=1,mem=1M,billing=1", "COMPLETED");
        assert!(matches!(
            ParsedRow::from_fields(2, &fields(&line)),
            Err(RowError::Malformed {
                reason: MalformedRow::InvalidJobId(id),
                ..
            }) if id == "4242_7"
        ));
    }

    #[test]
    fn ParsedRow__from_fields__non_terminal_state() {
        let line = row("alice", "1", "node=1,cpu=1,mem=1M,billing=1", "RUNNING");
        assert!(matches!(
            ParsedRow::from_fields(2, &fields(&line)),
            Err(RowError::Malformed {
                reason: MalformedRow::State(_),
                ..
            })
        ));
    }

    #[test]
    fn ParsedRow__from_fields__missing_mem_names_key() {
        let line = row("alice", "9", "node=2,cpu=16,billing=16", "COMPLETED");
        let err = ParsedRow::from_fields(2, &fields(&line)).unwrap_err();
        assert_eq!(
            err,
            RowError::Resource {
                line: 2,
                job_id: JobId(9),
                source: TresError::MissingField("mem"),
            }
        );
    }

    #[test]
    fn ParsedRow__from_fields__bad_elapsed() {
        let line = row("alice", "1", "node=1,cpu=1,mem=1M,billing=1", "COMPLETED").replace("|00:30:00|", "|UNLIMITED|");
        assert_eq!(
            ParsedRow::from_fields(2, &fields(&line)),
            Err(RowError::Malformed {
                line: 2,
                reason: MalformedRow::Elapsed(SlurmDurationError("UNLIMITED".to_owned())),
            })
        );
    }

    #[test]
    fn ParsedRow__from_fields__bad_exit_code() {
        let line = row("alice", "1", "node=1,cpu=1,mem=1M,billing=1", "FAILED").replace("|0:0", "|0");
        assert_eq!(
            ParsedRow::from_fields(4, &fields(&line)),
            Err(RowError::Malformed {
                line: 4,
                reason: MalformedRow::InvalidExitCode("0".to_owned()),
            })
        );
    }

    #[test]
    fn JobAccountingRecord__cpu_time_of_huge_job_saturates() -> Result<()> {
        let line = row("alice", "1", "node=1,cpu=4294967295,mem=1M,billing=1", "TIMEOUT")
            .replace("|00:30:00|", "|1000000000:00:00|");
        let ParsedRow::Job(record) = ParsedRow::from_fields(2, &fields(&line))? else {
            panic!("expected a job row");
        };

        assert_eq!(record.cpu_count, u32::MAX);
        assert_eq!(record.cpu_seconds(), i64::MAX);
        assert!((record.cpu_hours() - 1e9 * f64::from(u32::MAX)).abs() < 1e6);
        Ok(())
    }

    #[test]
    fn JobState__from_str() {
        assert_eq!("OUT_OF_MEMORY".parse::<JobState>(), Ok(JobState::OutOfMemory));
        assert_eq!("TIMEOUT".parse::<JobState>(), Ok(JobState::Timeout));
        assert_eq!("CANCELLED by 1000".parse::<JobState>(), Ok(JobState::Cancelled));
        assert!("CANCELLED by someone".parse::<JobState>().is_err());
        assert!("PENDING".parse::<JobState>().is_err());
        assert!("completed".parse::<JobState>().is_err());
    }

    #[test]
    fn is_exit_code__formats() {
        assert!(is_exit_code("0:0"));
        assert!(is_exit_code("137:9"));
        assert!(!is_exit_code("0"));
        assert!(!is_exit_code(":0"));
        assert!(!is_exit_code("a:b"));
    }

    #[test]
    fn parse_sacct_output__job_step_in_the_middle() {
        let tres = "node=1,cpu=4,mem=8000M,billing=4";
        let input = [
            HEADER.to_owned(),
            row("alice", "1", tres, "COMPLETED"),
            row("bob", "2", tres, "FAILED"),
            row("", "2", "", "FAILED"),
            row("carol", "3", tres, "TIMEOUT"),
            row("dave", "4", tres, "CANCELLED by 0"),
        ]
        .join("\n");

        let batch = parse_sacct_output(&input);
        assert_eq!(batch.records.len(), 4);
        assert_eq!(batch.job_steps, 1);
        assert!(batch.errors.is_empty());
        assert_eq!(batch.rows(), 5);
        let ids = batch.records.iter().map(|r| r.job_id.0).collect::<Vec<_>>();
        assert_eq!(ids, [1, 2, 3, 4]);
    }

    #[test]
    fn parse_sacct_output__bad_rows_do_not_stop_the_batch() {
        let input = [
            HEADER.to_owned(),
            row("alice", "1", "node=1,cpu=4,billing=4", "COMPLETED"),
            format!("{}|surplus", row("bob", "2", "node=1,cpu=4,mem=1M,billing=4", "COMPLETED")),
            row("carol", "x", "node=1,cpu=4,mem=1M,billing=4", "COMPLETED"),
            row("dave", "4", "node=1,cpu=4,mem=1M,billing=4", "COMPLETED"),
        ]
        .join("\n");

        let batch = parse_sacct_output(&input);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].job_id, JobId(4));
        assert_eq!(batch.errors.iter().map(RowError::line).collect::<Vec<_>>(), [2, 3, 4]);
        assert!(matches!(
            batch.errors[1],
            RowError::Malformed {
                reason: MalformedRow::TooManyFields { expected: 12, found: 13 },
                ..
            }
        ));
    }

    #[test]
    fn parse_sacct_output__elapsed_out_of_range_is_dropped() {
        let tres = "node=1,cpu=4,mem=8000M,billing=4";
        let input = [
            HEADER.to_owned(),
            row("alice", "1", tres, "COMPLETED").replace("|00:30:00|", "|999999999999999-00:00:00|"),
            row("bob", "2", tres, "COMPLETED"),
        ]
        .join("\n");

        let batch = parse_sacct_output(&input);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].job_id, JobId(2));
        assert_eq!(
            batch.errors,
            [RowError::Malformed {
                line: 2,
                reason: MalformedRow::Elapsed(SlurmDurationError("999999999999999-00:00:00".to_owned())),
            }]
        );
    }

    #[test]
    fn parse_sacct_output__header_only() {
        let batch = parse_sacct_output(&format!("{HEADER}\n"));
        assert_eq!(batch, ParsedBatch::default());
    }
}
