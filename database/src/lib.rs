//! Host-scoped SQLite store for job accounting rows.
//!
//! One database file per cluster node (`<dir>/<hostname>_jobs.db`) with a single table keyed by
//! `job_id`. The handle is opened at the start of a run and closed at its end.

pub mod commit;

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use accounting_data::{JobAccountingRecord, JobId, JobState, SlurmUser};
use log::{debug, info};
use rusqlite::{params, types::Type, Connection, OptionalExtension as _, Row};
use thiserror::Error;

pub use commit::{commit_window, CommitSummary};

pub const DEFAULT_TABLE: &str = "Jobs";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("`{0}` is not a valid table name")]
    InvalidTableName(String),
    #[error("creating store directory {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("opening store {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Upserting a single record failed. The rest of the batch is unaffected.
#[derive(Debug, Error)]
#[error("committing job {job_id}")]
pub struct CommitError {
    pub job_id: JobId,
    #[source]
    pub source: rusqlite::Error,
}

/// SQL identifier, restricted to `[A-Za-z_][A-Za-z0-9_]*` because it ends up inside statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: &str) -> Result<Self, StoreError> {
        let mut chars = name.chars();
        let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(TableName(name.to_owned()))
        } else {
            Err(StoreError::InvalidTableName(name.to_owned()))
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct HostStore {
    conn: Connection,
    table: TableName,
}

impl HostStore {
    /// `<dir>/<hostname>_jobs.db`
    pub fn path_for(dir: impl AsRef<Path>, hostname: &str) -> PathBuf {
        dir.as_ref().join(format!("{hostname}_jobs.db"))
    }

    /// Opens (creating if needed) the store file and makes sure the table exists.
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let table = TableName::new(table)?;
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.to_owned(),
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_owned(),
            source,
        })?;
        info!("opened store {path:?}, table {table}");
        Self::with_connection(conn, table)
    }

    pub fn open_in_memory(table: &str) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, TableName::new(table)?)
    }

    fn with_connection(conn: Connection, table: TableName) -> Result<Self, StoreError> {
        let store = HostStore { conn, table };
        store.ensure_schema()?;
        Ok(store)
    }

    /// How long a writer waits for a concurrent run holding the lock.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), StoreError> {
        Ok(self.conn.busy_timeout(timeout)?)
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Never drops or alters an existing table.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        let states = JobState::TERMINAL
            .iter()
            .map(|state| format!("'{state}'"))
            .collect::<Vec<_>>()
            .join(", ");
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                job_id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                node_count INTEGER NOT NULL,
                cpu_count INTEGER NOT NULL,
                gpu_count INTEGER NOT NULL DEFAULT 0,
                memory_mb INTEGER NOT NULL,
                billing_units INTEGER NOT NULL,
                time_limit TEXT NOT NULL,
                elapsed_time TEXT NOT NULL,
                submit_time TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                node_list TEXT NOT NULL,
                state TEXT NOT NULL CHECK (state IN ({states})),
                exit_code TEXT NOT NULL
            );",
            table = self.table
        ))?;
        debug!("schema for {} ensured", self.table);
        Ok(())
    }

    /// Inserts the record, or overwrites every column of the row with the same `job_id`.
    pub fn upsert(&self, record: &JobAccountingRecord) -> Result<(), CommitError> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {table} (
                        job_id, user_id, group_id, node_count, cpu_count, gpu_count, memory_mb,
                        billing_units, time_limit, elapsed_time, submit_time, start_time, end_time,
                        node_list, state, exit_code
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                    ON CONFLICT(job_id) DO UPDATE SET
                        user_id = excluded.user_id,
                        group_id = excluded.group_id,
                        node_count = excluded.node_count,
                        cpu_count = excluded.cpu_count,
                        gpu_count = excluded.gpu_count,
                        memory_mb = excluded.memory_mb,
                        billing_units = excluded.billing_units,
                        time_limit = excluded.time_limit,
                        elapsed_time = excluded.elapsed_time,
                        submit_time = excluded.submit_time,
                        start_time = excluded.start_time,
                        end_time = excluded.end_time,
                        node_list = excluded.node_list,
                        state = excluded.state,
                        exit_code = excluded.exit_code",
                    table = self.table
                ),
                params![
                    *record.job_id,
                    record.user_id.as_str(),
                    record.group_id,
                    record.node_count,
                    record.cpu_count,
                    record.gpu_count,
                    record.memory_mb,
                    record.billing_units,
                    record.time_limit,
                    record.elapsed_time,
                    record.submit_time,
                    record.start_time,
                    record.end_time,
                    record.node_list,
                    record.state.as_str(),
                    record.exit_code,
                ],
            )
            .map(|_| ())
            .map_err(|source| CommitError {
                job_id: record.job_id,
                source,
            })
    }

    pub fn get(&self, job_id: JobId) -> Result<Option<JobAccountingRecord>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT * FROM {} WHERE job_id = ?1", self.table),
                params![*job_id],
                record_from_row,
            )
            .optional()?)
    }

    /// Every row, ordered by `job_id`.
    pub fn all(&self) -> Result<Vec<JobAccountingRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!("SELECT * FROM {} ORDER BY job_id", self.table))?;
        let records = stmt.query_map([], record_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<JobAccountingRecord> {
    let state: String = row.get("state")?;
    let state = state.parse::<JobState>().map_err(|e| {
        let idx = row.as_ref().column_index("state").unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })?;

    Ok(JobAccountingRecord {
        job_id: JobId(row.get("job_id")?),
        user_id: SlurmUser(row.get("user_id")?),
        group_id: row.get("group_id")?,
        node_count: row.get("node_count")?,
        cpu_count: row.get("cpu_count")?,
        gpu_count: row.get("gpu_count")?,
        memory_mb: row.get("memory_mb")?,
        billing_units: row.get("billing_units")?,
        time_limit: row.get("time_limit")?,
        elapsed_time: row.get("elapsed_time")?,
        submit_time: row.get("submit_time")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        node_list: row.get("node_list")?,
        state,
        exit_code: row.get("exit_code")?,
    })
}
