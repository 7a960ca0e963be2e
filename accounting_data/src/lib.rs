pub mod misc {
    pub mod parsing;
}
pub mod record;
pub mod slurm;
pub mod tres;

pub use record::{parse_sacct_output, JobAccountingRecord, JobId, JobState, ParsedBatch, RowError};
pub use slurm::{fetch_window, AccountingSource, FetchError, Sacct, SacctOutput, SacctQuery, SlurmUser};
